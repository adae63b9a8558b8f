//! IV-chained AES keystream, IV morph schedule, and key derivation for one
//! cipher stream direction.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use zeroize::Zeroize;

/// Fixed 256-byte permutation driving the IV morph. Reproduced verbatim;
/// a single wrong entry desynchronizes every stream after its first packet.
const SHUFFLE: [u8; 256] = [
    0xEC, 0x3F, 0x77, 0xA4, 0x45, 0xD0, 0x71, 0xBF, 0xB7, 0x98, 0x20, 0xFC, 0x4B, 0xE9, 0xB3, 0xE1,
    0x5C, 0x22, 0xF7, 0x0C, 0x44, 0x1B, 0x81, 0xBD, 0x63, 0x8D, 0xD4, 0xC3, 0xF2, 0x10, 0x19, 0xE0,
    0xFB, 0xA1, 0x6E, 0x66, 0xEA, 0xAE, 0xD6, 0xCE, 0x06, 0x18, 0x4E, 0xEB, 0x78, 0x95, 0xDB, 0xBA,
    0xB6, 0x42, 0x7A, 0x2A, 0x83, 0x0B, 0x54, 0x67, 0x6D, 0xE8, 0x65, 0xE7, 0x2F, 0x07, 0xF3, 0xAA,
    0x27, 0x7B, 0x85, 0xB0, 0x26, 0xFD, 0x8B, 0xA9, 0xFA, 0xBE, 0xA8, 0xD7, 0xCB, 0xCC, 0x92, 0xDA,
    0xF9, 0x93, 0x60, 0x2D, 0xDD, 0xD2, 0xA2, 0x9B, 0x39, 0x5F, 0x82, 0x21, 0x4C, 0x69, 0xF8, 0x31,
    0x87, 0xEE, 0x8E, 0xAD, 0x8C, 0x6A, 0xBC, 0xB5, 0x6B, 0x59, 0x13, 0xF1, 0x04, 0x00, 0xF6, 0x5A,
    0x35, 0x79, 0x48, 0x8F, 0x15, 0xCD, 0x97, 0x57, 0x12, 0x3E, 0x37, 0xFF, 0x9D, 0x4F, 0x51, 0xF5,
    0xA3, 0x70, 0xBB, 0x14, 0x75, 0xC2, 0xB8, 0x72, 0xC0, 0xED, 0x7D, 0x68, 0xC9, 0x2E, 0x0D, 0x62,
    0x46, 0x17, 0x11, 0x4D, 0x6C, 0xC4, 0x7E, 0x53, 0xC1, 0x25, 0xC7, 0x9A, 0x1C, 0x88, 0x58, 0x2C,
    0x89, 0xDC, 0x02, 0x64, 0x40, 0x01, 0x5D, 0x38, 0xA5, 0xE2, 0xAF, 0x55, 0xD5, 0xEF, 0x1A, 0x7C,
    0xA7, 0x5B, 0xA6, 0x6F, 0x86, 0x9F, 0x73, 0xE6, 0x0A, 0xDE, 0x2B, 0x99, 0x4A, 0x47, 0x9C, 0xDF,
    0x09, 0x76, 0x9E, 0x30, 0x0E, 0xE4, 0xB2, 0x94, 0xA0, 0x3B, 0x34, 0x1D, 0x28, 0x0F, 0x36, 0xE3,
    0x23, 0xB4, 0x03, 0xD8, 0x90, 0xC8, 0x3C, 0xFE, 0x5E, 0x32, 0x24, 0x50, 0x1F, 0x3A, 0x43, 0x8A,
    0x96, 0x41, 0x74, 0xAC, 0x52, 0x33, 0xF0, 0xD9, 0x29, 0x80, 0xB1, 0x16, 0xD3, 0xAB, 0x91, 0xB9,
    0x84, 0x7F, 0x61, 0x1E, 0xCF, 0xC5, 0xD1, 0x56, 0x3D, 0xCA, 0xF4, 0x05, 0xC6, 0xE5, 0x08, 0x49,
];

/// AES key used by every locale except Taiwan.
const DEFAULT_SECRET_KEY: [u8; 32] = [
    0x13, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0xB4, 0x00, 0x00, 0x00,
    0x1B, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x33, 0x00, 0x00, 0x00, 0x52, 0x00, 0x00, 0x00,
];

/// Per-build key material for locale 6, indexed by `version % 20`.
const TW_SECRETS: [&str; 20] = [
    "2923BE84E16CD6AE529049F1F1BBE9EBB3A6DB3C870C3E99245E0D1C06B747DE",
    "B3124DC843BB8BA61F035A7D0938251F5DD4CBFC96F5453B130D890A1CDBAE32",
    "888138616B681262F954D0E7711748780D92291D86299972DB741CFA4F37B8B5",
    "209A50EE407836FD124932F69E7D49DCAD4F14F2444066D06BC430B7323BA122",
    "F622919DE18B1FDAB0CA9902B9729D492C807EC599D5E980B2EAC9CC53BF67D6",
    "BF14D67E2DDC8E6683EF574961FF698F61CDD11E9D9C167272E61DF0844F4A77",
    "02D7E8392C53CBC9121E33749E0CF4D5D49FD4A4597E35CF3222F4CCCFD3902D",
    "48D38F75E6D91D2AE5C0F72B788187440E5F5000D4618DBE7B0515073B33821F",
    "187092DA6454CEB1853E6915F8466A0496730ED9162F6768D4F74A4AD0576876",
    "5B628A8A8F275CF7E5874A3B329B614084C6C3B1A7304A10EE756F032F9E6AEF",
    "762DD0C2C9CD68D4496A792508614014B13B6AA51128C18CD6A90B87978C2FF1",
    "10509BC8814329288AF6E99E47A18148316CCDA49EDE81A38C9810FF9A43CDCF",
    "5E4EE1309CFED9719FE2A5E20C9BB44765382A4689A982797A7678C263B126DF",
    "DA296D3E62E0961234BF39A63F895EF16D0EE36C28A11E201DCBC2033F410784",
    "0F1405651B2861C9C5E72C8E463608DCF3A88DFEBEF2EB71FFA0D03B75068C7E",
    "8778734DD0BE82BEDBC246412B8CFA307F70F0A754863295AA5B68130BE6FCF5",
    "CABE7D9F898A411BFDB84F68F6727B1499CDD30DF0443AB4A66653330BCBA110",
    "5E4CEC034C73E605B4310EAAADCFD5B0CA27FFD89D144DF4792759427C9CC1F8",
    "CD8C87202364B8A687954CB05A8D4E2D99E73DB160DEB180AD0841E96741A5D5",
    "9FE4189F15420026FE4CD12104932FB38F735340438AAF7ECA6FD5CFD3A195CE",
];

/// Initial value the morph schedule steps from on every IV update.
const MORPH_SEED: [u8; 4] = [0xF2, 0x53, 0x50, 0xC6];

/// Keystream table cap: 92 blocks cover the largest 1472-byte chunk.
const XOR_TABLE_BLOCKS: usize = 92;

/// Header sentinel selecting the 8-byte big-packet form.
const BIG_HEADER_MARK: u16 = 0xFF00;

const LOCALE_TAIWAN: u8 = 6;

/// Cipher state for one direction of a session: the rolling 4-byte IV, the
/// 256-bit AES key, and the header arithmetic built on both.
///
/// `version` is stored as handed over by the handshake: the outbound stream
/// carries the build number itself, the inbound stream carries
/// `0xFFFF - build`. Header validation uses the stored value; key selection
/// reconstructs the positive build.
pub struct MapleAes {
    iv: [u8; 4],
    version: u16,
    key: [u8; 32],
    cipher: Aes256,
}

impl MapleAes {
    pub fn new(version: u16, locale: u8, iv: [u8; 4]) -> Self {
        // Inbound streams store 0xFFFF - build, which reads as a negative
        // i16; undo that for key selection.
        let key_version = if (version as i16) < 0 {
            0xFFFF - version
        } else {
            version
        };

        let key = if locale == LOCALE_TAIWAN {
            generate_tw_key(key_version)
        } else {
            DEFAULT_SECRET_KEY
        };

        let cipher = Aes256::new(GenericArray::from_slice(&key));
        MapleAes {
            iv,
            version,
            key,
            cipher,
        }
    }

    pub fn iv(&self) -> [u8; 4] {
        self.iv
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> [u8; 32] {
        self.key
    }

    /// Validate the first two header bytes against the current IV.
    pub fn confirm_header(&self, buf: &[u8]) -> bool {
        (buf[0] ^ self.iv[2]) == (self.version & 0xFF) as u8
            && (buf[1] ^ self.iv[3]) == (self.version >> 8) as u8
    }

    /// Header length for the packet starting at `buf`: 8 bytes for the
    /// big-packet form, 4 otherwise. Needs the first 4 bytes present.
    pub fn header_length(buf: &[u8]) -> usize {
        let iv_bytes = u16::from_le_bytes([buf[0], buf[1]]);
        let xorred = u16::from_le_bytes([buf[2], buf[3]]);
        if xorred ^ iv_bytes == BIG_HEADER_MARK {
            8
        } else {
            4
        }
    }

    /// Payload length encoded in the header. Needs `header_length` bytes.
    pub fn packet_length(buf: &[u8]) -> usize {
        let iv_bytes = u16::from_le_bytes([buf[0], buf[1]]);
        let xorred = u16::from_le_bytes([buf[2], buf[3]]);
        let length = xorred ^ iv_bytes;
        if length == BIG_HEADER_MARK {
            let big = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
            ((big ^ i32::from(iv_bytes)) & 0x7FFF_FFFF) as usize
        } else {
            length as usize
        }
    }

    /// XOR `data` against the keystream chained off the current IV.
    ///
    /// The keystream is AES-256-ECB applied to the IV repeated across one
    /// block, then re-applied to each previous output block. Payloads are
    /// XORed in wire-chunk units: 1456 bytes first (1452 when the payload
    /// carries the big-packet form), 1460 thereafter, with the keystream
    /// restarting at each chunk boundary.
    pub fn transform(&self, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }

        let mut iv_block = [0u8; 16];
        for (i, b) in iv_block.iter_mut().enumerate() {
            *b = self.iv[i % 4];
        }

        let blocks = (data.len() / 16 + 1).min(XOR_TABLE_BLOCKS);
        let mut table = vec![0u8; blocks * 16];
        let mut block = GenericArray::clone_from_slice(&iv_block);
        for i in 0..blocks {
            self.cipher.encrypt_block(&mut block);
            table[i * 16..(i + 1) * 16].copy_from_slice(block.as_slice());
        }

        let first = if data.len() >= usize::from(BIG_HEADER_MARK) {
            1452
        } else {
            1456
        };
        let mut chunk = first.min(data.len());
        let mut pos = 0;
        while pos < data.len() {
            for i in 0..chunk {
                data[pos + i] ^= table[i];
            }
            pos += chunk;
            chunk = 1460.min(data.len() - pos);
        }
    }

    /// Advance the IV to its post-packet successor.
    pub fn shift_iv(&mut self) {
        let old = self.iv;
        let mut next = MORPH_SEED;
        for b in old {
            morph(b, &mut next);
        }
        self.iv = next;
    }
}

impl Drop for MapleAes {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// One morph step: mix `value` into the working IV through the shuffle
/// table, then rotate the whole 32-bit IV left by 3.
pub(crate) fn morph(value: u8, iv: &mut [u8; 4]) {
    let t = SHUFFLE[value as usize];
    iv[0] = iv[0].wrapping_add(SHUFFLE[iv[1] as usize].wrapping_sub(value));
    iv[1] = iv[1].wrapping_sub(iv[2] ^ t);
    iv[2] ^= SHUFFLE[iv[3] as usize].wrapping_add(value);
    iv[3] = iv[3].wrapping_sub(iv[0].wrapping_sub(t));

    let rolled = u32::from_le_bytes(*iv).rotate_left(3);
    *iv = rolled.to_le_bytes();
}

/// Locale-6 key schedule: pick the build's hex secret, sample every fourth
/// byte into an 8-byte seed, and spread the seed across the 256-bit key at
/// 4-byte strides with zero fill.
fn generate_tw_key(version: u16) -> [u8; 32] {
    let hex = TW_SECRETS[usize::from(version) % TW_SECRETS.len()];

    let mut buffer = [0u8; 32];
    for (i, pair) in hex.as_bytes().chunks_exact(2).enumerate() {
        buffer[i] = (hex_nibble(pair[0]) << 4) | hex_nibble(pair[1]);
    }

    let mut seed = [0u8; 8];
    for i in 0..8 {
        seed[i] = buffer[i * 4];
    }

    let mut key = [0u8; 32];
    for i in 0..8 {
        key[i * 4] = seed[i];
    }
    key
}

fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'A'..=b'F' => c - b'A' + 10,
        b'a'..=b'f' => c - b'a' + 10,
        _ => 0,
    }
}
