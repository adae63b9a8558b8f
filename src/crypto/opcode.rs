//! Dynamic opcode table negotiated by the inbound opcode-encryption packet.
//!
//! The server ships a 3DES-ECB blob whose plaintext is a `|`-separated list
//! of the ciphered opcodes the client will use; position in the list gives
//! the real opcode (`index + 0xCC`). The resulting table is installed on the
//! outbound stream so decoded packets show real opcodes.

use std::collections::HashMap;

use des::TdesEde3;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, KeyInit};

/// Key shipped with the client; consumers may override it per deployment.
pub const DEFAULT_OPCODE_KEY: &str = "BrN=r54jQp2@yP6G";

/// First real opcode value; list position `i` maps to `0xCC + i`.
const DYNAMIC_OPCODE_BASE: u16 = 0xCC;

const DES_BLOCK: usize = 8;

/// Parse the payload of an opcode-encryption packet (after the 2-byte
/// opcode): a little-endian i32 ciphertext size followed by the ciphertext.
///
/// Any failure (short payload, bad size, undecryptable blob, malformed
/// token) yields the entries parsed up to that point, possibly none;
/// framing is never affected.
pub fn parse_opcode_table(payload: &[u8], key: &str) -> HashMap<i32, u16> {
    let mut table = HashMap::new();

    if payload.len() < 4 {
        return table;
    }
    let size = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if size <= 0 {
        return table;
    }
    let size = size as usize;
    if payload.len() < 4 + size {
        return table;
    }

    // 3DES with no padding only consumes whole blocks.
    let whole = size - size % DES_BLOCK;
    if whole == 0 {
        return table;
    }

    let mut plain = payload[4..4 + whole].to_vec();
    decrypt_blob(&mut plain, key);

    let text = String::from_utf8_lossy(&plain);
    let mut index: u16 = 0;
    for token in text.split('|') {
        if token.is_empty() {
            break;
        }
        let Ok(value) = token.parse::<i32>() else {
            break;
        };
        if table.contains_key(&value) {
            break;
        }
        table.insert(value, DYNAMIC_OPCODE_BASE + index);
        index += 1;
    }

    table
}

/// Expand the 16-byte key string to 24 bytes (`K || K[0..8]`) and decrypt in
/// place with 3DES-EDE in ECB mode. Keys of the wrong length fall back to
/// the default.
fn decrypt_blob(data: &mut [u8], key: &str) {
    let key_bytes = if key.len() == 16 {
        key.as_bytes()
    } else {
        DEFAULT_OPCODE_KEY.as_bytes()
    };
    let mut des_key = [0u8; 24];
    des_key[..16].copy_from_slice(key_bytes);
    des_key[16..].copy_from_slice(&key_bytes[..8]);

    let cipher = TdesEde3::new(GenericArray::from_slice(&des_key));
    for block in data.chunks_exact_mut(DES_BLOCK) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}
