//! Cleartext handshake detection on the pre-cipher inbound byte stream.
//!
//! The server opens every connection with an unencrypted frame carrying the
//! protocol version, a patch-location string, and the two 4-byte IV seeds
//! that key the per-direction cipher streams.

/// Fields extracted from a successfully parsed handshake frame.
pub(crate) struct HandshakeFrame {
    pub version: u16,
    pub sub_version: String,
    pub locale: u8,
    pub local_iv: [u8; 4],
    pub remote_iv: [u8; 4],
    /// Locale-6 game connections replace the inbound AES transform with the
    /// data-shift cipher.
    pub extra_cipher: bool,
    /// Bytes consumed from the inbound buffer (`2 + size`).
    pub consumed: usize,
}

/// Patch strings longer than this are not handshakes but stray data that
/// happened to pass the earlier checks.
const MAX_PATCH_LEN: usize = 100;

/// Highest known locale value.
const MAX_LOCALE: u8 = 0x12;

const LOCALE_TAIWAN: u8 = 6;

/// Try to parse a handshake from the start of `buf`.
///
/// Returns None while the frame is incomplete or does not look like a
/// handshake; the caller keeps accumulating bytes in either case.
pub(crate) fn parse_handshake(buf: &[u8]) -> Option<HandshakeFrame> {
    if buf.len() < 2 {
        return None;
    }
    let size = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + size {
        return None;
    }
    let body = &buf[2..2 + size];

    let (version, patch, local_iv, remote_iv, locale) = if size > 0x10 {
        parse_standard(body)?
    } else {
        parse_legacy(body)?
    };

    if locale == 0 || locale > MAX_LOCALE {
        return None;
    }

    let extra_cipher = locale == LOCALE_TAIWAN && !patch.contains(':');

    Some(HandshakeFrame {
        version,
        sub_version: patch,
        locale,
        local_iv,
        remote_iv,
        extra_cipher,
        consumed: 2 + size,
    })
}

/// Standard form: version, length-prefixed patch string, IVs, locale.
fn parse_standard(body: &[u8]) -> Option<(u16, String, [u8; 4], [u8; 4], u8)> {
    if body.len() < 4 {
        return None;
    }
    let version = u16::from_le_bytes([body[0], body[1]]);
    let str_len = u16::from_le_bytes([body[2], body[3]]) as usize;
    if str_len > MAX_PATCH_LEN {
        return None;
    }
    // version(2) + str_len(2) + patch + local_iv(4) + remote_iv(4) + locale(1)
    if body.len() < 4 + str_len + 9 {
        return None;
    }
    let patch = String::from_utf8_lossy(&body[4..4 + str_len]).into_owned();
    let mut local_iv = [0u8; 4];
    let mut remote_iv = [0u8; 4];
    local_iv.copy_from_slice(&body[4 + str_len..8 + str_len]);
    remote_iv.copy_from_slice(&body[8 + str_len..12 + str_len]);
    let locale = body[12 + str_len];
    Some((version, patch, local_iv, remote_iv, locale))
}

/// Legacy short form: version, two unused bytes, a numeric patch value
/// rendered as `value + 1`, IVs, locale.
fn parse_legacy(body: &[u8]) -> Option<(u16, String, [u8; 4], [u8; 4], u8)> {
    // version(2) + skip(2) + patch(2) + local_iv(4) + remote_iv(4) + locale(1)
    if body.len() < 15 {
        return None;
    }
    let version = u16::from_le_bytes([body[0], body[1]]);
    let patch_value = u16::from_le_bytes([body[4], body[5]]);
    let patch = (patch_value.wrapping_add(1)).to_string();
    let mut local_iv = [0u8; 4];
    let mut remote_iv = [0u8; 4];
    local_iv.copy_from_slice(&body[6..10]);
    remote_iv.copy_from_slice(&body[10..14]);
    let locale = body[14];
    Some((version, patch, local_iv, remote_iv, locale))
}

/// Reduce a patch-location string to the single sub-version byte: an
/// all-digit string is taken modulo 256, anything else maps to 1.
pub(crate) fn sub_version_byte(patch: &str) -> u8 {
    if !patch.is_empty() && patch.bytes().all(|b| b.is_ascii_digit()) {
        patch
            .bytes()
            .fold(0u32, |acc, d| (acc * 10 + u32::from(d - b'0')) % 256) as u8
    } else {
        1
    }
}
