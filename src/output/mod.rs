use colored::Colorize;
use serde_json::json;

use crate::protocol::{DecodedPacket, Direction};

pub struct Formatter {
    json: bool,
    hex: bool,
    quiet: bool,
}

impl Formatter {
    pub fn new(json: bool, hex: bool, quiet: bool) -> Self {
        Formatter { json, hex, quiet }
    }

    pub fn print_packet(&self, packet: &DecodedPacket) {
        if self.json {
            self.print_json(packet);
        } else {
            self.print_text(packet);
        }
    }

    fn print_text(&self, packet: &DecodedPacket) {
        if packet.is_handshake {
            if let Some(info) = &packet.handshake {
                println!(
                    "{} {} v{} ({}) locale {} port {}",
                    session_tag(packet.session_id).cyan(),
                    "HANDSHAKE".magenta().bold(),
                    info.version,
                    info.sub_version,
                    info.locale,
                    info.server_port,
                );
            }
            return;
        }

        if packet.is_desync_notice {
            eprintln!(
                "{} {} {} stream desynchronized; dropping further bytes",
                session_tag(packet.session_id).cyan(),
                direction_tag(packet.direction),
                "DESYNC".red().bold(),
            );
            return;
        }

        if !self.quiet {
            println!(
                "{} {} {} ({} bytes)",
                session_tag(packet.session_id).cyan(),
                direction_tag(packet.direction),
                format_opcode(packet.opcode).yellow(),
                packet.length,
            );
        }
        if self.hex && !packet.payload.is_empty() {
            print_hex(&packet.payload);
        }
    }

    fn print_json(&self, packet: &DecodedPacket) {
        let mut j = json!({
            "timestamp": packet.timestamp,
            "session": packet.session_id,
            "direction": packet.direction.to_string(),
            "opcode": format_opcode(packet.opcode),
            "opcodeRaw": packet.opcode,
            "length": packet.length,
            "isHandshake": packet.is_handshake,
            "isDesync": packet.is_desync_notice,
            "payload": hex_string(&packet.payload),
        });
        if let Some(info) = &packet.handshake {
            j["handshake"] = json!({
                "version": info.version,
                "subVersion": info.sub_version,
                "locale": info.locale,
                "serverPort": info.server_port,
            });
        }
        println!("{}", j);
    }
}

fn session_tag(id: u32) -> String {
    format!("[s{}]", id)
}

fn direction_tag(direction: Direction) -> colored::ColoredString {
    match direction {
        Direction::Inbound => "IN ".green(),
        Direction::Outbound => "OUT".blue(),
    }
}

/// Uppercase-hex opcode, fixed width: `0x00B5`.
fn format_opcode(opcode: u16) -> String {
    format!("0x{:04X}", opcode)
}

fn hex_string(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Bytes per hex-dump row.
const HEX_COLS: usize = 16;

/// Print a hex + ASCII dump, one prebuilt line per row.
fn print_hex(data: &[u8]) {
    for (row, chunk) in data.chunks(HEX_COLS).enumerate() {
        let mut line = format!("{:06x}:", row * HEX_COLS);
        for slot in 0..HEX_COLS {
            match chunk.get(slot) {
                Some(b) => line.push_str(&format!(" {:02x}", b)),
                None => line.push_str("   "),
            }
        }
        line.push_str("  ");
        for &b in chunk {
            line.push(if (0x20..0x7F).contains(&b) {
                b as char
            } else {
                '.'
            });
        }
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_formatting() {
        assert_eq!(format_opcode(0x00B5), "0x00B5");
        assert_eq!(format_opcode(0xFFFF), "0xFFFF");
        assert_eq!(format_opcode(0), "0x0000");
    }

    #[test]
    fn hex_string_lowercase_pairs() {
        assert_eq!(hex_string(&[0x00, 0xAB, 0x10]), "00ab10");
        assert_eq!(hex_string(&[]), "");
    }
}
