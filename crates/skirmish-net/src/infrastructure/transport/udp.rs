//! UDP transport with per-channel reliable and unreliable delivery.
//!
//! # Wire layout
//!
//! Every datagram starts with an 8-byte header (big-endian):
//!
//! ```text
//! [magic:u16][type:u8][channel:u8][sequence:u32][body...]
//! ```
//!
//! | type | body |
//! |---|---|
//! | Connect    | protocol version (u16) + session UUID (16 bytes) |
//! | Accept     | session UUID, echoed |
//! | Reject     | UTF-8 reason |
//! | Disconnect | – |
//! | Unreliable | payload |
//! | Reliable   | payload |
//! | Ack        | – (channel + sequence name the acknowledged packet) |
//! | Ping/Pong  | sender's send time (f64 seconds), echoed by Pong |
//!
//! # How reliability works (for beginners)
//!
//! UDP may drop, duplicate or reorder datagrams.  For a reliable channel the
//! sender numbers each payload, keeps a copy, and resends it every 100 ms
//! until the receiver acknowledges that number.  The receiver delivers
//! payloads strictly in number order, holding back early arrivals until the
//! gap before them is filled, and drops numbers it has already delivered.
//! After 20 unanswered resends the connection is declared dead.
//!
//! Unreliable channels are only *sequenced*: the receiver remembers the
//! newest number it delivered and drops anything older.
//!
//! A ping every second measures the round-trip time and keeps the connection
//! alive; five seconds of silence times the peer out.
//!
//! # Read timeout
//!
//! `poll` blocks in `recv_from` for at most the requested timeout, then drains
//! whatever else is queued without blocking, then services the timers.

use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{ChannelId, Delivery, Transport, TransportError, TransportEvent};
use crate::application::link::PeerId;

// ── Protocol constants ────────────────────────────────────────────────────────

/// First two bytes of every datagram: ASCII `SK`.
pub const MAGIC: u16 = 0x534B;

/// Bumped on incompatible changes to this layout.
pub const PROTOCOL_VERSION: u16 = 1;

pub const HEADER_LEN: usize = 8;

/// Largest payload accepted by `send`.
pub const MAX_PAYLOAD: usize = 65_000;

/// The id a client uses for its server.
pub const SERVER_PEER: PeerId = PeerId(0);

// ── Packet header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Accept = 2,
    Reject = 3,
    Disconnect = 4,
    Unreliable = 5,
    Reliable = 6,
    Ack = 7,
    Ping = 8,
    Pong = 9,
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Accept),
            3 => Ok(PacketType::Reject),
            4 => Ok(PacketType::Disconnect),
            5 => Ok(PacketType::Unreliable),
            6 => Ok(PacketType::Reliable),
            7 => Ok(PacketType::Ack),
            8 => Ok(PacketType::Ping),
            9 => Ok(PacketType::Pong),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub channel: ChannelId,
    pub sequence: u32,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, channel: ChannelId, sequence: u32) -> Self {
        Self {
            packet_type,
            channel,
            sequence,
        }
    }

    /// Header followed by `body`.
    pub fn encode(&self, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.push(self.packet_type as u8);
        buf.push(self.channel);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    /// Splits a datagram into header and body.  `None` for foreign or
    /// truncated datagrams.
    pub fn decode(datagram: &[u8]) -> Option<(PacketHeader, &[u8])> {
        if datagram.len() < HEADER_LEN {
            return None;
        }
        let magic = u16::from_be_bytes([datagram[0], datagram[1]]);
        if magic != MAGIC {
            return None;
        }
        let packet_type = PacketType::try_from(datagram[2]).ok()?;
        let sequence = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        Some((
            PacketHeader::new(packet_type, datagram[3], sequence),
            &datagram[HEADER_LEN..],
        ))
    }
}

/// `true` when `a` is newer than `b` in wrapping sequence space.
pub fn sequence_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Timers and limits.
#[derive(Debug, Clone, PartialEq)]
pub struct UdpConfig {
    /// Server only: connections beyond this are rejected.
    pub max_peers: usize,
    pub resend_interval: Duration,
    /// Unanswered resends after which the peer is timed out.
    pub max_resends: u32,
    pub keepalive_interval: Duration,
    /// Silence after which the peer is timed out.
    pub timeout: Duration,
    /// Client only: spacing of Connect attempts.
    pub connect_retry: Duration,
    /// Client only: give up on the handshake after this long.
    pub connect_timeout: Duration,
    /// Early reliable arrivals held per channel.  Further early arrivals are
    /// left unacknowledged so the sender resends them.
    pub max_held: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            max_peers: 16,
            resend_interval: Duration::from_millis(100),
            max_resends: 20,
            keepalive_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            connect_retry: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(5),
            max_held: 1024,
        }
    }
}

// ── Connection state ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingReliable {
    payload: Vec<u8>,
    last_sent: Instant,
    resends: u32,
}

#[derive(Debug, Default)]
struct ChannelState {
    next_send: u32,
    unacked: BTreeMap<u32, PendingReliable>,
    next_expected: u32,
    held: BTreeMap<u32, Vec<u8>>,
    latest_unreliable: Option<u32>,
}

#[derive(Debug)]
struct Connection {
    addr: SocketAddr,
    session: Uuid,
    channels: HashMap<ChannelId, ChannelState>,
    last_heard: Instant,
    last_ping: Instant,
    rtt: Option<Duration>,
}

impl Connection {
    fn new(addr: SocketAddr, session: Uuid, now: Instant) -> Self {
        Self {
            addr,
            session,
            channels: HashMap::new(),
            last_heard: now,
            last_ping: now,
            rtt: None,
        }
    }
}

#[derive(Debug)]
struct Handshake {
    started: Instant,
    last_attempt: Option<Instant>,
}

#[derive(Debug)]
enum Mode {
    Server,
    Client {
        server_addr: SocketAddr,
        session: Uuid,
        handshake: Option<Handshake>,
    },
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// [`Transport`] over one `std::net::UdpSocket`.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    mode: Mode,
    config: UdpConfig,
    connections: BTreeMap<PeerId, Connection>,
    by_addr: HashMap<SocketAddr, PeerId>,
    next_peer: u32,
    epoch: Instant,
    events: Vec<TransportEvent>,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Binds `bind` and accepts connections.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be bound.
    pub fn server(bind: SocketAddr, config: UdpConfig) -> Result<Self, TransportError> {
        let transport = Self::bind(bind, Mode::Server, config)?;
        info!(addr = ?transport.local_addr().ok(), "UDP server listening");
        Ok(transport)
    }

    /// Binds `bind` and starts a handshake with `server_addr`.  The first
    /// Connect goes out on the first `poll`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be bound.
    pub fn client(
        bind: SocketAddr,
        server_addr: SocketAddr,
        config: UdpConfig,
    ) -> Result<Self, TransportError> {
        let mode = Mode::Client {
            server_addr,
            session: Uuid::new_v4(),
            handshake: Some(Handshake {
                started: Instant::now(),
                last_attempt: None,
            }),
        };
        let transport = Self::bind(bind, mode, config)?;
        info!(%server_addr, "UDP client connecting");
        Ok(transport)
    }

    fn bind(addr: SocketAddr, mode: Mode, config: UdpConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self {
            socket: Some(socket),
            mode,
            config,
            connections: BTreeMap::new(),
            by_addr: HashMap::new(),
            next_peer: 1,
            epoch: Instant::now(),
            events: Vec::new(),
            buf: vec![0u8; HEADER_LEN + MAX_PAYLOAD],
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        Ok(socket.local_addr()?)
    }

    /// Receives one datagram, if any arrives before the socket's timeout.
    /// Returns `false` when nothing was waiting.
    fn receive_one(&mut self) -> Result<bool, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        match socket.recv_from(&mut self.buf) {
            Ok((len, src)) => {
                let datagram = self.buf[..len].to_vec();
                self.handle_datagram(src, &datagram, Instant::now());
                Ok(true)
            }
            Err(e) if is_timeout_error(&e) => Ok(false),
            // ICMP port-unreachable from a vanished peer surfaces here on some
            // platforms; the keepalive timeout deals with the peer.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn handle_datagram(&mut self, src: SocketAddr, datagram: &[u8], now: Instant) {
        let Some((header, body)) = PacketHeader::decode(datagram) else {
            debug!(%src, len = datagram.len(), "ignoring foreign datagram");
            return;
        };
        match header.packet_type {
            PacketType::Connect => self.on_connect(src, body, now),
            PacketType::Accept => self.on_accept(src, body, now),
            PacketType::Reject => self.on_reject(src, body),
            _ => self.on_connected_packet(src, header, body, now),
        }
    }

    fn on_connect(&mut self, src: SocketAddr, body: &[u8], now: Instant) {
        if !matches!(self.mode, Mode::Server) || body.len() < 18 {
            return;
        }
        let version = u16::from_be_bytes([body[0], body[1]]);
        let Ok(session) = Uuid::from_slice(&body[2..18]) else {
            return;
        };
        if version != PROTOCOL_VERSION {
            warn!(%src, version, "rejecting connect with wrong protocol version");
            let reject = PacketHeader::new(PacketType::Reject, 0, 0);
            self.send_packet(src, reject, b"protocol version mismatch");
            return;
        }

        if let Some(&peer) = self.by_addr.get(&src) {
            let same_session = self
                .connections
                .get(&peer)
                .is_some_and(|c| c.session == session);
            if same_session {
                // Our Accept was lost; the client is retrying.
                let accept = PacketHeader::new(PacketType::Accept, 0, 0);
                self.send_packet(src, accept, session.as_bytes());
                return;
            }
            info!(%peer, %src, "peer reconnected with a new session");
            self.remove_connection(peer);
            self.events.push(TransportEvent::Disconnected { peer });
        }

        if self.connections.len() >= self.config.max_peers {
            warn!(%src, max = self.config.max_peers, "server full, rejecting connect");
            self.send_packet(src, PacketHeader::new(PacketType::Reject, 0, 0), b"server full");
            return;
        }

        let peer = PeerId(self.next_peer);
        self.next_peer += 1;
        self.connections.insert(peer, Connection::new(src, session, now));
        self.by_addr.insert(src, peer);
        self.send_packet(src, PacketHeader::new(PacketType::Accept, 0, 0), session.as_bytes());
        info!(%peer, %src, "peer connected");
        self.events.push(TransportEvent::Connected { peer });
    }

    fn on_accept(&mut self, src: SocketAddr, body: &[u8], now: Instant) {
        let Mode::Client {
            server_addr,
            session,
            handshake,
        } = &mut self.mode
        else {
            return;
        };
        if src != *server_addr || handshake.is_none() || body != session.as_bytes() {
            return;
        }
        *handshake = None;
        let connection = Connection::new(src, *session, now);
        self.connections.insert(SERVER_PEER, connection);
        self.by_addr.insert(src, SERVER_PEER);
        info!(%src, "connected to server");
        self.events.push(TransportEvent::Connected { peer: SERVER_PEER });
    }

    fn on_reject(&mut self, src: SocketAddr, body: &[u8]) {
        let Mode::Client {
            server_addr,
            handshake,
            ..
        } = &mut self.mode
        else {
            return;
        };
        if src != *server_addr || handshake.is_none() {
            return;
        }
        *handshake = None;
        warn!(%src, reason = %String::from_utf8_lossy(body), "server rejected connection");
        self.events.push(TransportEvent::Disconnected { peer: SERVER_PEER });
    }

    fn on_connected_packet(
        &mut self,
        src: SocketAddr,
        header: PacketHeader,
        body: &[u8],
        now: Instant,
    ) {
        let Some(&peer) = self.by_addr.get(&src) else {
            trace!(%src, "packet from unknown address");
            return;
        };
        let max_held = self.config.max_held;
        let socket = self.socket.as_ref();
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        conn.last_heard = now;
        let channel = header.channel;
        let seq = header.sequence;

        match header.packet_type {
            PacketType::Disconnect => {
                info!(%peer, "peer said goodbye");
                self.remove_connection(peer);
                self.events.push(TransportEvent::Disconnected { peer });
            }
            PacketType::Unreliable => {
                let state = conn.channels.entry(channel).or_default();
                if state.latest_unreliable.is_some_and(|latest| !sequence_newer(seq, latest)) {
                    trace!(%peer, channel, seq, "stale unreliable datagram dropped");
                    return;
                }
                state.latest_unreliable = Some(seq);
                self.events.push(TransportEvent::Received {
                    peer,
                    channel,
                    payload: body.to_vec(),
                });
            }
            PacketType::Reliable => {
                let state = conn.channels.entry(channel).or_default();
                if seq == state.next_expected {
                    self.events.push(TransportEvent::Received {
                        peer,
                        channel,
                        payload: body.to_vec(),
                    });
                    state.next_expected = state.next_expected.wrapping_add(1);
                    while let Some(payload) = state.held.remove(&state.next_expected) {
                        self.events.push(TransportEvent::Received {
                            peer,
                            channel,
                            payload,
                        });
                        state.next_expected = state.next_expected.wrapping_add(1);
                    }
                } else if sequence_newer(seq, state.next_expected) {
                    if state.held.len() >= max_held && !state.held.contains_key(&seq) {
                        trace!(%peer, channel, seq, "hold-back full, datagram left unacked");
                        return;
                    }
                    state.held.insert(seq, body.to_vec());
                } else {
                    // Delivered already; the ack went missing.
                    trace!(%peer, channel, seq, "duplicate reliable datagram dropped");
                }
                let ack = PacketHeader::new(PacketType::Ack, channel, seq);
                send_with(socket, conn.addr, ack, &[]);
            }
            PacketType::Ack => {
                if let Some(state) = conn.channels.get_mut(&channel) {
                    state.unacked.remove(&seq);
                }
            }
            PacketType::Ping => {
                send_with(socket, conn.addr, PacketHeader::new(PacketType::Pong, 0, seq), body);
            }
            PacketType::Pong => {
                if let Ok(bytes) = <[u8; 8]>::try_from(body) {
                    let sent = f64::from_be_bytes(bytes);
                    let elapsed = now.duration_since(self.epoch).as_secs_f64() - sent;
                    if elapsed >= 0.0 {
                        conn.rtt = Some(Duration::from_secs_f64(elapsed));
                    }
                }
            }
            PacketType::Connect | PacketType::Accept | PacketType::Reject => {}
        }
    }

    fn service_timers(&mut self, now: Instant) {
        let socket = self.socket.as_ref();

        if let Mode::Client {
            server_addr,
            session,
            handshake,
        } = &mut self.mode
        {
            if let Some(h) = handshake {
                if now.duration_since(h.started) >= self.config.connect_timeout {
                    warn!(%server_addr, "handshake timed out");
                    *handshake = None;
                    self.events.push(TransportEvent::TimedOut { peer: SERVER_PEER });
                } else if h
                    .last_attempt
                    .map_or(true, |t| now.duration_since(t) >= self.config.connect_retry)
                {
                    h.last_attempt = Some(now);
                    let mut body = PROTOCOL_VERSION.to_be_bytes().to_vec();
                    body.extend_from_slice(session.as_bytes());
                    let connect = PacketHeader::new(PacketType::Connect, 0, 0);
                    send_with(socket, *server_addr, connect, &body);
                }
            }
        }

        let mut dead = Vec::new();
        for (&peer, conn) in self.connections.iter_mut() {
            if now.duration_since(conn.last_heard) >= self.config.timeout {
                dead.push(peer);
                continue;
            }
            if now.duration_since(conn.last_ping) >= self.config.keepalive_interval {
                conn.last_ping = now;
                let stamp = now.duration_since(self.epoch).as_secs_f64();
                let ping = PacketHeader::new(PacketType::Ping, 0, 0);
                send_with(socket, conn.addr, ping, &stamp.to_be_bytes());
            }
            let mut exhausted = false;
            for (&channel, state) in conn.channels.iter_mut() {
                for (&seq, pending) in state.unacked.iter_mut() {
                    if now.duration_since(pending.last_sent) < self.config.resend_interval {
                        continue;
                    }
                    if pending.resends >= self.config.max_resends {
                        exhausted = true;
                        break;
                    }
                    pending.resends += 1;
                    pending.last_sent = now;
                    send_with(
                        socket,
                        conn.addr,
                        PacketHeader::new(PacketType::Reliable, channel, seq),
                        &pending.payload,
                    );
                }
            }
            if exhausted {
                dead.push(peer);
            }
        }
        for peer in dead {
            warn!(%peer, "peer timed out");
            self.remove_connection(peer);
            self.events.push(TransportEvent::TimedOut { peer });
        }
    }

    fn send_packet(&self, addr: SocketAddr, header: PacketHeader, body: &[u8]) {
        send_with(self.socket.as_ref(), addr, header, body);
    }

    fn remove_connection(&mut self, peer: PeerId) -> Option<Connection> {
        let conn = self.connections.remove(&peer)?;
        self.by_addr.remove(&conn.addr);
        Some(conn)
    }
}

/// Best-effort send of a control packet.  Failures are logged; the timers
/// recover.
fn send_with(socket: Option<&UdpSocket>, addr: SocketAddr, header: PacketHeader, body: &[u8]) {
    let Some(socket) = socket else {
        return;
    };
    if let Err(e) = socket.send_to(&header.encode(body), addr) {
        debug!(%addr, ?header, "send failed: {e}");
    }
}

impl Transport for UdpTransport {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, TransportError> {
        self.service_timers(Instant::now());

        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        // A zero read timeout is rejected by the OS.
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        if self.receive_one()? {
            let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
            socket.set_nonblocking(true)?;
            let drained = (|| {
                while self.receive_one()? {}
                Ok::<(), TransportError>(())
            })();
            if let Some(socket) = self.socket.as_ref() {
                socket.set_nonblocking(false)?;
            }
            drained?;
        }
        Ok(std::mem::take(&mut self.events))
    }

    fn send(
        &mut self,
        peer: PeerId,
        channel: ChannelId,
        delivery: Delivery,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        let conn = self
            .connections
            .get_mut(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let state = conn.channels.entry(channel).or_default();
        let seq = state.next_send;
        state.next_send = state.next_send.wrapping_add(1);
        let packet_type = match delivery {
            Delivery::Reliable => {
                state.unacked.insert(
                    seq,
                    PendingReliable {
                        payload: payload.to_vec(),
                        last_sent: Instant::now(),
                        resends: 0,
                    },
                );
                PacketType::Reliable
            }
            Delivery::Unreliable => PacketType::Unreliable,
        };
        let datagram = PacketHeader::new(packet_type, channel, seq).encode(payload);
        socket.send_to(&datagram, conn.addr)?;
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.connections.keys().copied().collect()
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(conn) = self.remove_connection(peer) {
            self.send_packet(conn.addr, PacketHeader::new(PacketType::Disconnect, 0, 0), &[]);
            info!(%peer, "disconnected peer");
            self.events.push(TransportEvent::Disconnected { peer });
        }
    }

    fn round_trip_time(&self, peer: PeerId) -> Option<Duration> {
        self.connections.get(&peer).and_then(|c| c.rtt)
    }

    fn shutdown(&mut self) {
        for conn in self.connections.values() {
            send_with(
                self.socket.as_ref(),
                conn.addr,
                PacketHeader::new(PacketType::Disconnect, 0, 0),
                &[],
            );
        }
        self.connections.clear();
        self.by_addr.clear();
        self.socket = None;
        info!("UDP transport shut down");
    }
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
