#![no_main]
use libfuzzer_sys::fuzz_target;
use mapletap::crypto::{CipherStream, ReadOutcome, Transform};
use mapletap::protocol::Direction;

fuzz_target!(|data: &[u8]| {
    let mut stream = CipherStream::new(
        Direction::Outbound,
        95,
        8,
        [0x46, 0x72, 0xEE, 0x4D],
        Transform::AesXor,
    );
    for chunk in data.chunks(32) {
        let _ = stream.append(chunk);
        loop {
            match stream.try_read() {
                ReadOutcome::Packet { .. } => {}
                _ => break,
            }
        }
    }
});
