//! Session tracking and dispatch: ties reassembly, handshake detection, and
//! the cipher streams together per connection.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::crypto::opcode::{DEFAULT_OPCODE_KEY, parse_opcode_table};
use crate::crypto::{CipherStream, ReadOutcome, Transform};
use crate::protocol::{
    self, ConnectionKey, DecodedPacket, Direction, HANDSHAKE_OPCODE, HandshakeInfo, TcpSegment,
    handshake,
};
use crate::reassembly::Reassembler;

/// Inbound opcode announcing the encrypted-opcode table.
const OPCODE_ENCRYPTION: u16 = 0x46;

/// Port the login servers listen on; everything else is a game channel.
const LOGIN_PORT: u16 = 8484;

/// Pre-handshake accumulation bound per direction. A connection that buffers
/// this much without producing a handshake is not MapleStory traffic.
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// One bidirectional MapleStory connection and all of its cipher state.
struct Session {
    id: u32,
    /// Server endpoint, learned from the first server-side payload.
    server: Option<(Ipv4Addr, u16)>,
    client_port: u16,
    initialized: bool,
    terminated: bool,
    /// One desync notification per session; set on the first dead stream.
    desync_notified: bool,

    version: u16,
    sub_version: String,
    sub_version_byte: u8,
    locale: u8,
    is_login: bool,

    server_reasm: Reassembler,
    client_reasm: Reassembler,

    pending_inbound: Vec<u8>,
    pending_outbound: Vec<u8>,
    last_server_seq_end: Option<u32>,
    last_client_seq_end: Option<u32>,

    inbound: Option<CipherStream>,
    outbound: Option<CipherStream>,
}

impl Session {
    fn new(id: u32) -> Self {
        Session {
            id,
            server: None,
            client_port: 0,
            initialized: false,
            terminated: false,
            desync_notified: false,
            version: 0,
            sub_version: String::new(),
            sub_version_byte: 0,
            locale: 0,
            is_login: false,
            server_reasm: Reassembler::new(),
            client_reasm: Reassembler::new(),
            pending_inbound: Vec::new(),
            pending_outbound: Vec::new(),
            last_server_seq_end: None,
            last_client_seq_end: None,
            inbound: None,
            outbound: None,
        }
    }

    /// Handle one non-empty data segment.
    fn process_segment(
        &mut self,
        seg: &TcpSegment,
        timestamp: f64,
        opcode_key: &str,
    ) -> Vec<DecodedPacket> {
        if self.terminated {
            return Vec::new();
        }
        if self.initialized {
            self.process_established(seg, timestamp, opcode_key)
        } else {
            self.process_nascent(seg, timestamp, opcode_key)
        }
    }

    /// Before the handshake: raw payloads accumulate per direction without
    /// reassembly (the handshake fits one segment in practice, and the
    /// hold-last protection would sit on it indefinitely).
    fn process_nascent(
        &mut self,
        seg: &TcpSegment,
        timestamp: f64,
        opcode_key: &str,
    ) -> Vec<DecodedPacket> {
        let seq_end = seg.seq.wrapping_add(seg.payload.len() as u32);

        if self.is_inbound_nascent(seg) {
            if self.server.is_none() {
                self.server = Some((seg.src_ip, seg.src_port));
                if self.client_port == 0 {
                    self.client_port = seg.dst_port;
                }
            }
            if self.pending_inbound.len() + seg.payload.len() > MAX_PENDING_BYTES {
                self.terminated = true;
                return Vec::new();
            }
            self.pending_inbound.extend_from_slice(&seg.payload);
            self.last_server_seq_end = Some(seq_end);
            self.try_handshake(timestamp, opcode_key)
        } else {
            if self.pending_outbound.len() + seg.payload.len() > MAX_PENDING_BYTES {
                self.terminated = true;
                return Vec::new();
            }
            self.pending_outbound.extend_from_slice(&seg.payload);
            self.last_client_seq_end = Some(seq_end);
            Vec::new()
        }
    }

    /// Direction guess while the server endpoint is still unknown: a SYN
    /// told us the client port, otherwise the first payload of a connection
    /// is the server's handshake.
    fn is_inbound_nascent(&self, seg: &TcpSegment) -> bool {
        match self.server {
            Some((ip, port)) => seg.src_ip == ip && seg.src_port == port,
            None => self.client_port == 0 || seg.src_port != self.client_port,
        }
    }

    /// Attempt handshake detection on the accumulated inbound bytes; on
    /// success, bring up both cipher streams and flush everything buffered.
    fn try_handshake(&mut self, timestamp: f64, opcode_key: &str) -> Vec<DecodedPacket> {
        let Some(hs) = handshake::parse_handshake(&self.pending_inbound) else {
            return Vec::new();
        };
        let Some((_, server_port)) = self.server else {
            return Vec::new();
        };

        self.version = hs.version;
        self.sub_version = hs.sub_version.clone();
        self.sub_version_byte = handshake::sub_version_byte(&hs.sub_version);
        self.locale = hs.locale;
        self.is_login = server_port == LOGIN_PORT;

        self.outbound = Some(CipherStream::new(
            Direction::Outbound,
            hs.version,
            hs.locale,
            hs.local_iv,
            Transform::AesXor,
        ));
        let inbound_transform = if hs.extra_cipher {
            Transform::DataShift
        } else {
            Transform::AesXor
        };
        self.inbound = Some(CipherStream::new(
            Direction::Inbound,
            0xFFFF - hs.version,
            hs.locale,
            hs.remote_iv,
            inbound_transform,
        ));
        self.initialized = true;

        // The pre-handshake bytes bypassed reassembly; pin both reassemblers
        // to the end of what was consumed raw.
        if let Some(end) = self.last_server_seq_end {
            self.server_reasm.init(end);
        }
        if let Some(end) = self.last_client_seq_end {
            self.client_reasm.init(end);
        }

        let mut packets = vec![DecodedPacket {
            timestamp,
            session_id: self.id,
            direction: Direction::Inbound,
            opcode: HANDSHAKE_OPCODE,
            payload: Vec::new(),
            length: hs.consumed as u32,
            is_handshake: true,
            is_desync_notice: false,
            handshake: Some(HandshakeInfo {
                version: hs.version,
                sub_version: hs.sub_version,
                locale: hs.locale,
                server_port,
            }),
        }];

        self.pending_inbound.drain(..hs.consumed);
        let rest = std::mem::take(&mut self.pending_inbound);
        packets.extend(self.feed_stream(Direction::Inbound, &rest, timestamp, opcode_key));
        let buffered = std::mem::take(&mut self.pending_outbound);
        packets.extend(self.feed_stream(Direction::Outbound, &buffered, timestamp, opcode_key));

        packets
    }

    fn process_established(
        &mut self,
        seg: &TcpSegment,
        timestamp: f64,
        opcode_key: &str,
    ) -> Vec<DecodedPacket> {
        let inbound = match self.server {
            Some((ip, port)) => seg.src_ip == ip && seg.src_port == port,
            None => false,
        };
        let (direction, reasm, hold_last) = if inbound {
            (Direction::Inbound, &mut self.server_reasm, true)
        } else {
            (Direction::Outbound, &mut self.client_reasm, false)
        };
        reasm.add_segment(seg.seq, &seg.payload);
        let bytes = reasm.drain(hold_last);
        self.feed_stream(direction, &bytes, timestamp, opcode_key)
    }

    /// Push reassembled bytes into one direction's cipher stream and collect
    /// every packet that frames out of it.
    fn feed_stream(
        &mut self,
        direction: Direction,
        data: &[u8],
        timestamp: f64,
        opcode_key: &str,
    ) -> Vec<DecodedPacket> {
        let (stream_slot, peer_slot) = match direction {
            Direction::Inbound => (&mut self.inbound, &mut self.outbound),
            Direction::Outbound => (&mut self.outbound, &mut self.inbound),
        };
        let Some(stream) = stream_slot.as_mut() else {
            return Vec::new();
        };

        let mut packets = Vec::new();

        if !stream.append(data) {
            if !self.desync_notified {
                self.desync_notified = true;
                packets.push(desync_notice(self.id, direction, timestamp));
            }
            return packets;
        }

        loop {
            match stream.try_read() {
                ReadOutcome::Packet {
                    opcode,
                    payload,
                    length,
                } => {
                    if direction == Direction::Inbound && opcode == OPCODE_ENCRYPTION {
                        let table = parse_opcode_table(&payload, opcode_key);
                        if let Some(peer) = peer_slot.as_mut() {
                            peer.install_opcode_table(table);
                        }
                    }
                    packets.push(DecodedPacket {
                        timestamp,
                        session_id: self.id,
                        direction,
                        opcode,
                        payload,
                        length,
                        is_handshake: false,
                        is_desync_notice: false,
                        handshake: None,
                    });
                }
                ReadOutcome::Incomplete => break,
                ReadOutcome::Desync => {
                    if !self.desync_notified {
                        self.desync_notified = true;
                        packets.push(desync_notice(self.id, direction, timestamp));
                    }
                    break;
                }
            }
        }

        packets
    }
}

fn desync_notice(session_id: u32, direction: Direction, timestamp: f64) -> DecodedPacket {
    DecodedPacket {
        timestamp,
        session_id,
        direction,
        opcode: 0,
        payload: Vec::new(),
        length: 0,
        is_handshake: false,
        is_desync_notice: true,
        handshake: None,
    }
}

/// Descriptive snapshot of a tracked session, for status surfaces.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: u32,
    pub initialized: bool,
    pub version: u16,
    pub sub_version: String,
    pub sub_version_byte: u8,
    pub locale: u8,
    pub is_login: bool,
    pub server_port: u16,
}

/// The session table: resolves connection keys (either direction) to
/// sessions, runs the per-segment lifecycle, and feeds session dispatch.
///
/// All methods take `&mut self`; wrap in [`SharedAnalyzer`] when frames
/// arrive from more than one thread.
pub struct Analyzer {
    keys: HashMap<ConnectionKey, u32>,
    sessions: HashMap<u32, Session>,
    next_session_id: u32,
    opcode_key: String,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Analyzer {
            keys: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 1,
            opcode_key: DEFAULT_OPCODE_KEY.to_string(),
        }
    }

    /// Override the 3DES key used for opcode-encryption packets.
    pub fn with_opcode_key(key: impl Into<String>) -> Self {
        let mut analyzer = Self::new();
        analyzer.opcode_key = key.into();
        analyzer
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot every tracked session, ordered by id.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|s| SessionSummary {
                id: s.id,
                initialized: s.initialized,
                version: s.version,
                sub_version: s.sub_version.clone(),
                sub_version_byte: s.sub_version_byte,
                locale: s.locale,
                is_login: s.is_login,
                server_port: s.server.map(|(_, port)| port).unwrap_or(0),
            })
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Feed one raw Ethernet frame. Returns every packet decoded as a
    /// consequence, in stream order per direction.
    pub fn process_frame(&mut self, frame: &[u8], timestamp: f64) -> Vec<DecodedPacket> {
        match protocol::parse_segment(frame) {
            Some(seg) => self.process_segment(&seg, timestamp),
            None => Vec::new(),
        }
    }

    /// Feed one parsed TCP segment.
    pub fn process_segment(&mut self, seg: &TcpSegment, timestamp: f64) -> Vec<DecodedPacket> {
        let key = seg.key();
        let found = self
            .keys
            .get(&key)
            .or_else(|| self.keys.get(&key.reverse()))
            .copied();

        // Teardown: drop the whole session, emit nothing.
        if seg.flags.fin || seg.flags.rst {
            if let Some(id) = found {
                self.remove_session(id);
            }
            return Vec::new();
        }

        // Client SYN: a fresh connection absorbs any prior session on the
        // same tuple (reconnection after a missed teardown).
        if seg.flags.syn && !seg.flags.ack {
            if let Some(old) = found {
                self.remove_session(old);
            }
            let id = self.alloc_id();
            let mut session = Session::new(id);
            session.client_port = seg.src_port;
            session.client_reasm.init(seg.seq.wrapping_add(1));
            self.keys.insert(key, id);
            self.sessions.insert(id, session);
            return Vec::new();
        }

        // Server SYN-ACK: pin the inbound sequence base.
        if seg.flags.syn && seg.flags.ack {
            if let Some(id) = found {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.server_reasm.init(seg.seq.wrapping_add(1));
                }
            }
            return Vec::new();
        }

        // Pure ACKs carry nothing.
        if seg.payload.is_empty() {
            return Vec::new();
        }

        let id = match found {
            Some(id) => id,
            None => {
                // Mid-stream join: start tracking from the first data.
                let id = self.alloc_id();
                self.keys.insert(key, id);
                self.sessions.insert(id, Session::new(id));
                id
            }
        };

        let Some(session) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        if session.terminated {
            return Vec::new();
        }

        let was_initialized = session.initialized;
        let packets = session.process_segment(seg, timestamp, &self.opcode_key);

        // Once the handshake lands, register both directional keys so either
        // side's segments resolve without the reverse lookup guessing.
        if !was_initialized && session.initialized {
            self.keys.insert(key, id);
            self.keys.insert(key.reverse(), id);
        }

        packets
    }

    /// Cooperative teardown: mark every session terminated and drop state.
    pub fn teardown(&mut self) {
        for session in self.sessions.values_mut() {
            session.terminated = true;
        }
        self.sessions.clear();
        self.keys.clear();
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        id
    }

    fn remove_session(&mut self, id: u32) {
        self.keys.retain(|_, v| *v != id);
        self.sessions.remove(&id);
    }
}

/// Thread-safe wrapper: one lock spans lookup, lifecycle, and session
/// dispatch for a whole segment, so a session is never touched from two
/// threads at once. Decoded packets are returned after the lock is released;
/// the sink cannot reenter the table.
#[derive(Clone)]
pub struct SharedAnalyzer {
    inner: Arc<Mutex<Analyzer>>,
}

impl SharedAnalyzer {
    pub fn new(analyzer: Analyzer) -> Self {
        SharedAnalyzer {
            inner: Arc::new(Mutex::new(analyzer)),
        }
    }

    pub fn process_frame(&self, frame: &[u8], timestamp: f64) -> Vec<DecodedPacket> {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.process_frame(frame, timestamp)
    }

    pub fn teardown(&self) {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.teardown();
    }
}
