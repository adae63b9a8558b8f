pub mod aes;
pub mod opcode;

use std::collections::HashMap;

use crate::protocol::Direction;
use self::aes::MapleAes;

/// Per-direction payload transform negotiated at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Chained AES-256-ECB keystream XOR.
    AesXor,
    /// Subtract IV[0] from every byte; inbound game-port variant.
    DataShift,
}

/// Outcome of one framing attempt.
pub enum ReadOutcome {
    /// A complete packet was decoded and consumed from the buffer.
    Packet {
        opcode: u16,
        payload: Vec<u8>,
        length: u32,
    },
    /// Not enough buffered bytes; try again after the next append.
    Incomplete,
    /// The header check failed (or a defensive bound tripped); the stream is
    /// now dead. Returned exactly once per stream.
    Desync,
}

/// Header bytes needed before the first framing attempt.
const MIN_HEADER: usize = 4;

/// Per-direction buffer and packet-size bound. A stream that crosses it is
/// no longer tracking real traffic.
const MAX_STREAM_BYTES: usize = 16 * 1024 * 1024;

/// One direction's decryption pipeline: buffers reassembled TCP bytes,
/// validates and strips packet headers against the rolling IV, decrypts each
/// payload, and morphs the IV forward.
pub struct CipherStream {
    direction: Direction,
    transform: Transform,
    aes: MapleAes,
    buf: Vec<u8>,
    /// Bytes needed before the next framing attempt can make progress.
    expected: usize,
    dead: bool,
    opcode_table: Option<HashMap<i32, u16>>,
}

impl CipherStream {
    pub fn new(
        direction: Direction,
        version: u16,
        locale: u8,
        iv: [u8; 4],
        transform: Transform,
    ) -> Self {
        CipherStream {
            direction,
            transform,
            aes: MapleAes::new(version, locale, iv),
            buf: Vec::with_capacity(4096),
            expected: MIN_HEADER,
            dead: false,
            opcode_table: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Install the negotiated opcode table; decoded opcodes are replaced by
    /// their real values from here on.
    pub fn install_opcode_table(&mut self, table: HashMap<i32, u16>) {
        self.opcode_table = Some(table);
    }

    pub fn opcode_remap_active(&self) -> bool {
        self.opcode_table.is_some()
    }

    /// Buffer reassembled stream bytes. Returns false when the append pushed
    /// the stream over its defensive size bound (the stream is dead after
    /// that); a stream that is already dead swallows bytes silently.
    #[must_use]
    pub fn append(&mut self, data: &[u8]) -> bool {
        if self.dead || data.is_empty() {
            return true;
        }
        if self.buf.len() + data.len() > MAX_STREAM_BYTES {
            self.dead = true;
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    /// Attempt to frame and decrypt one packet off the buffer front.
    pub fn try_read(&mut self) -> ReadOutcome {
        if self.dead || self.buf.len() < self.expected {
            return ReadOutcome::Incomplete;
        }

        if !self.aes.confirm_header(&self.buf) {
            self.dead = true;
            return ReadOutcome::Desync;
        }

        let header_len = MapleAes::header_length(&self.buf);
        if self.buf.len() < header_len {
            self.expected = header_len;
            return ReadOutcome::Incomplete;
        }

        let payload_len = MapleAes::packet_length(&self.buf);
        if payload_len > MAX_STREAM_BYTES {
            self.dead = true;
            return ReadOutcome::Desync;
        }
        let total = header_len + payload_len;
        if self.buf.len() < total {
            self.expected = total;
            return ReadOutcome::Incomplete;
        }

        let mut payload = self.buf[header_len..total].to_vec();
        match self.transform {
            Transform::AesXor => self.aes.transform(&mut payload),
            Transform::DataShift => {
                let iv0 = self.aes.iv()[0];
                for b in &mut payload {
                    *b = b.wrapping_sub(iv0);
                }
            }
        }
        self.aes.shift_iv();

        self.buf.drain(..total);
        self.expected = MIN_HEADER;

        let raw_opcode = if payload.len() >= 2 {
            u16::from_le_bytes([payload[0], payload[1]])
        } else {
            0
        };
        let body = if payload.len() > 2 {
            payload[2..].to_vec()
        } else {
            Vec::new()
        };
        let opcode = match &self.opcode_table {
            Some(table) => table
                .get(&i32::from(raw_opcode))
                .copied()
                .unwrap_or(raw_opcode),
            None => raw_opcode,
        };

        ReadOutcome::Packet {
            opcode,
            payload: body,
            length: payload_len as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION: u16 = 0x0103;
    const LOCALE: u8 = 8;
    const IV: [u8; 4] = [0x00, 0x00, 0x42, 0x99];

    /// Encrypt one packet the way a peer would: header from the current IV,
    /// payload XORed with the same keystream, IV morphed afterwards.
    fn seal_packet(aes: &mut MapleAes, plaintext: &[u8]) -> Vec<u8> {
        let iv = aes.iv();
        let b0 = (VERSION & 0xFF) as u8 ^ iv[2];
        let b1 = (VERSION >> 8) as u8 ^ iv[3];
        let iv_bytes = u16::from_le_bytes([b0, b1]);
        let xorred = (plaintext.len() as u16) ^ iv_bytes;
        let mut wire = vec![b0, b1];
        wire.extend_from_slice(&xorred.to_le_bytes());
        let mut ct = plaintext.to_vec();
        aes.transform(&mut ct);
        wire.extend_from_slice(&ct);
        aes.shift_iv();
        wire
    }

    fn stream() -> (CipherStream, MapleAes) {
        (
            CipherStream::new(Direction::Outbound, VERSION, LOCALE, IV, Transform::AesXor),
            MapleAes::new(VERSION, LOCALE, IV),
        )
    }

    fn read_packet(s: &mut CipherStream) -> (u16, Vec<u8>, u32) {
        match s.try_read() {
            ReadOutcome::Packet {
                opcode,
                payload,
                length,
            } => (opcode, payload, length),
            ReadOutcome::Incomplete => panic!("expected a packet, got Incomplete"),
            ReadOutcome::Desync => panic!("expected a packet, got Desync"),
        }
    }

    #[test]
    fn single_packet_roundtrip() {
        let (mut s, mut peer) = stream();
        let wire = seal_packet(&mut peer, &[0xB5, 0x00, 1, 2, 3, 4, 5, 6]);
        assert!(s.append(&wire));
        let (opcode, payload, length) = read_packet(&mut s);
        assert_eq!(opcode, 0x00B5);
        assert_eq!(payload, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(length, 8);
        assert!(matches!(s.try_read(), ReadOutcome::Incomplete));
    }

    #[test]
    fn consecutive_packets_morph_iv() {
        let (mut s, mut peer) = stream();
        for n in 0u8..5 {
            let wire = seal_packet(&mut peer, &[n, 0x00, n, n]);
            assert!(s.append(&wire));
        }
        for n in 0u8..5 {
            let (opcode, payload, _) = read_packet(&mut s);
            assert_eq!(opcode, u16::from(n));
            assert_eq!(payload, vec![n, n]);
        }
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let (mut s, mut peer) = stream();
        let wire = seal_packet(&mut peer, &[0x11, 0x00, 9, 8, 7]);
        for &b in &wire[..wire.len() - 1] {
            assert!(s.append(&[b]));
            assert!(matches!(s.try_read(), ReadOutcome::Incomplete));
        }
        assert!(s.append(&[wire[wire.len() - 1]]));
        let (opcode, payload, _) = read_packet(&mut s);
        assert_eq!(opcode, 0x0011);
        assert_eq!(payload, vec![9, 8, 7]);
    }

    #[test]
    fn data_shift_transform() {
        let mut s = CipherStream::new(
            Direction::Inbound,
            VERSION,
            LOCALE,
            IV,
            Transform::DataShift,
        );
        // Header still comes from the IV; payload bytes are plain + IV[0].
        let iv0 = IV[0];
        let plaintext = [0x46u8, 0x00, 0xFE, 0x01];
        let shifted: Vec<u8> = plaintext.iter().map(|b| b.wrapping_add(iv0)).collect();
        let b0 = (VERSION & 0xFF) as u8 ^ IV[2];
        let b1 = (VERSION >> 8) as u8 ^ IV[3];
        let iv_bytes = u16::from_le_bytes([b0, b1]);
        let xorred = (plaintext.len() as u16) ^ iv_bytes;
        let mut wire = vec![b0, b1];
        wire.extend_from_slice(&xorred.to_le_bytes());
        wire.extend_from_slice(&shifted);
        assert!(s.append(&wire));
        let (opcode, payload, _) = read_packet(&mut s);
        assert_eq!(opcode, 0x0046);
        assert_eq!(payload, vec![0xFE, 0x01]);
    }

    #[test]
    fn desync_reported_once() {
        let (mut s, mut peer) = stream();
        let wire = seal_packet(&mut peer, &[0x01, 0x00, 0xAA]);
        assert!(s.append(&wire));
        read_packet(&mut s);

        // Corrupt the header bytes the current IV would demand.
        let iv = peer.iv();
        let bad = [(VERSION & 0xFF) as u8 ^ iv[2] ^ 0xFF, 0x00, 0x00, 0x00];
        assert!(s.append(&bad));
        assert!(matches!(s.try_read(), ReadOutcome::Desync));
        assert!(s.is_dead());
        // Further bytes are swallowed without another signal.
        assert!(s.append(&[0x01, 0x02, 0x03, 0x04]));
        assert!(matches!(s.try_read(), ReadOutcome::Incomplete));
    }

    #[test]
    fn big_packet_roundtrip() {
        let (mut s, mut peer) = stream();
        // Payload over 0xFF00 exercises the 8-byte header and the 1452-byte
        // first chunk.
        let len = 0xFF10usize;
        let mut plaintext = vec![0u8; len];
        plaintext[0] = 0x77;
        plaintext[1] = 0x01;
        for (i, b) in plaintext.iter_mut().enumerate().skip(2) {
            *b = (i * 31) as u8;
        }

        let iv = peer.iv();
        let b0 = (VERSION & 0xFF) as u8 ^ iv[2];
        let b1 = (VERSION >> 8) as u8 ^ iv[3];
        let iv_bytes = u16::from_le_bytes([b0, b1]);
        let mark = 0xFF00u16 ^ iv_bytes;
        let big = (len as i32) ^ i32::from(iv_bytes);
        let mut wire = vec![b0, b1];
        wire.extend_from_slice(&mark.to_le_bytes());
        wire.extend_from_slice(&big.to_le_bytes());
        let mut ct = plaintext.clone();
        peer.transform(&mut ct);
        wire.extend_from_slice(&ct);
        peer.shift_iv();

        assert!(s.append(&wire));
        let (opcode, payload, length) = read_packet(&mut s);
        assert_eq!(opcode, 0x0177);
        assert_eq!(length as usize, len);
        assert_eq!(payload, plaintext[2..]);
    }

    #[test]
    fn opcode_remap_applies_to_decoded_packets() {
        let (mut s, mut peer) = stream();
        let mut table = HashMap::new();
        table.insert(9, 0xCD);
        s.install_opcode_table(table);
        assert!(s.opcode_remap_active());

        let wire = seal_packet(&mut peer, &[0x09, 0x00, 0x01]);
        assert!(s.append(&wire));
        let (opcode, _, _) = read_packet(&mut s);
        assert_eq!(opcode, 0x00CD);

        // Opcodes outside the table pass through unchanged.
        let wire = seal_packet(&mut peer, &[0x10, 0x00]);
        assert!(s.append(&wire));
        let (opcode, _, _) = read_packet(&mut s);
        assert_eq!(opcode, 0x0010);
    }

    #[test]
    fn empty_payload_packet() {
        let (mut s, mut peer) = stream();
        let wire = seal_packet(&mut peer, &[]);
        assert!(s.append(&wire));
        let (opcode, payload, length) = read_packet(&mut s);
        assert_eq!(opcode, 0);
        assert!(payload.is_empty());
        assert_eq!(length, 0);
    }

    #[test]
    fn oversized_length_kills_stream() {
        let (mut s, _) = stream();
        // Valid header bytes but an 8-byte form advertising ~2 GiB.
        let b0 = (VERSION & 0xFF) as u8 ^ IV[2];
        let b1 = (VERSION >> 8) as u8 ^ IV[3];
        let iv_bytes = u16::from_le_bytes([b0, b1]);
        let mark = 0xFF00u16 ^ iv_bytes;
        let big = 0x7FFF_FFF0i32 ^ i32::from(iv_bytes);
        let mut wire = vec![b0, b1];
        wire.extend_from_slice(&mark.to_le_bytes());
        wire.extend_from_slice(&big.to_le_bytes());
        assert!(s.append(&wire));
        assert!(matches!(s.try_read(), ReadOutcome::Desync));
        assert!(s.is_dead());
    }

    #[test]
    fn buffer_bound_kills_stream() {
        let (mut s, _) = stream();
        let chunk = vec![0u8; MAX_STREAM_BYTES / 2 + 1];
        assert!(s.append(&chunk));
        assert!(!s.append(&chunk));
        assert!(s.is_dead());
    }

    #[test]
    fn ciphertext_concatenation_matches_stream() {
        // The bytes consumed per packet are exactly header + ciphertext, so
        // re-sealing the decoded packets reproduces the wire stream.
        let (mut s, mut peer) = stream();
        let mut wire_all = Vec::new();
        for n in 0u8..3 {
            let wire = seal_packet(&mut peer, &[n, 0x00, 0xA0 | n]);
            wire_all.extend_from_slice(&wire);
        }
        assert!(s.append(&wire_all));

        let mut reseal = MapleAes::new(VERSION, LOCALE, IV);
        let mut rebuilt = Vec::new();
        for _ in 0..3 {
            let (opcode, payload, _) = read_packet(&mut s);
            let mut plain = opcode.to_le_bytes().to_vec();
            plain.extend_from_slice(&payload);
            rebuilt.extend_from_slice(&seal_packet(&mut reseal, &plain));
        }
        assert_eq!(rebuilt, wire_all);
    }
}
