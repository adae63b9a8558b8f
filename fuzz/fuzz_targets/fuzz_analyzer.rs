#![no_main]
use libfuzzer_sys::fuzz_target;
use mapletap::session::Analyzer;

fuzz_target!(|data: &[u8]| {
    // Split the input into pseudo-frames and run them through the whole
    // pipeline; nothing here may panic.
    let mut analyzer = Analyzer::new();
    let mut ts = 0.0;
    for chunk in data.chunks(96) {
        ts += 0.001;
        let _ = analyzer.process_frame(chunk, ts);
    }
});
