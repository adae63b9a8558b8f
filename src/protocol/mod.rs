pub(crate) mod handshake;

use std::net::Ipv4Addr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

/// A parsed TCP segment with extracted header info and payload.
#[derive(Debug)]
pub struct TcpSegment {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpSegment {
    /// Connection tuple in the direction this segment travels.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            src_ip: self.src_ip,
            src_port: self.src_port,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
        }
    }
}

/// Directional connection identifier. A session is reachable under this key
/// and under `reverse()` of it; the session table registers both.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ConnectionKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl ConnectionKey {
    /// The same connection, seen from the peer's side.
    pub fn reverse(&self) -> ConnectionKey {
        ConnectionKey {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Which way a packet travels relative to the game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server to client.
    Inbound,
    /// Client to server.
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "IN"),
            Direction::Outbound => write!(f, "OUT"),
        }
    }
}

/// Opcode used on the synthetic handshake packet, outside the u16 range of
/// real opcodes' first-two-bytes semantics by convention.
pub const HANDSHAKE_OPCODE: u16 = 0xFFFF;

/// One decrypted game packet (or a synthetic handshake/desync record)
/// delivered to the consumer.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    /// Capture timestamp, epoch-relative seconds.
    pub timestamp: f64,
    pub session_id: u32,
    pub direction: Direction,
    /// Little-endian u16 of the first two decrypted bytes (post-remap for
    /// outbound packets when opcode encryption is active).
    pub opcode: u16,
    /// Decrypted bytes after the opcode.
    pub payload: Vec<u8>,
    /// Total decoded length in bytes.
    pub length: u32,
    pub is_handshake: bool,
    /// Set on the one-shot notification that a direction's framing has
    /// desynchronized and no further packets can be decoded.
    pub is_desync_notice: bool,
    /// Present only when `is_handshake`.
    pub handshake: Option<HandshakeInfo>,
}

/// Negotiated session parameters carried on the handshake packet.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub version: u16,
    pub sub_version: String,
    pub locale: u8,
    pub server_port: u16,
}

/// Parse a raw Ethernet-II frame into a TcpSegment.
/// Returns None for anything that is not Ethernet/IPv4/TCP; such frames are
/// skipped without diagnostics.
pub fn parse_segment(data: &[u8]) -> Option<TcpSegment> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            ipv4.header().source_addr(),
            ipv4.header().destination_addr(),
        ),
        _ => return None,
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };

    Some(TcpSegment {
        src_ip,
        dst_ip,
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        seq: tcp.sequence_number(),
        flags: TcpFlags {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        },
        payload: tcp.payload().to_vec(),
    })
}
