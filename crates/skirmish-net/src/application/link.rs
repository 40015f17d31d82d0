//! The seam between the coordinator and the peer host.
//!
//! The coordinator runs on the simulation thread and must never block.  It
//! talks to the I/O side only through a [`PeerLink`]: enqueue an outgoing
//! message with a [`SendPolicy`], try-dequeue an [`Inbound`] message, and
//! try-dequeue a lifecycle [`HostEvent`].  The production implementation is
//! `infrastructure::peer_host::HostHandle`; [`ScriptedLink`] is an in-memory
//! stand-in for tests and tools.

use std::collections::VecDeque;
use std::fmt;

use skirmish_core::protocol::messages::NetMessage;
use skirmish_core::PlayerId;

/// Transport-level handle for a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Who receives an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Every connected peer.  For a client that is just the server.
    ToAll,
    /// Every peer except the one a relayed message came from.
    ToAllExcept(PeerId),
    /// Exactly one peer.
    ToPeer(PeerId),
}

impl SendPolicy {
    /// Returns `true` if `peer` is a recipient under this policy.
    pub fn includes(&self, peer: PeerId) -> bool {
        match self {
            SendPolicy::ToAll => true,
            SendPolicy::ToAllExcept(origin) => *origin != peer,
            SendPolicy::ToPeer(target) => *target == peer,
        }
    }
}

/// A decoded message plus where and when it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub message: NetMessage,
    /// Peer the datagram arrived from.  On a client this is always the server.
    pub origin: PeerId,
    /// Local raw clock at receipt, seconds.
    pub received_at: f64,
}

/// Lifecycle notifications from the peer host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Client: the transport finished its handshake with the server.
    Connected { server: PeerId },
    /// Client: the server went away.
    Disconnected { timed_out: bool },
    /// Server: a new peer connected and was assigned `player_id`.
    PeerJoined { peer: PeerId, player_id: PlayerId },
    /// Server: a peer disconnected or timed out; its id is free again.
    PeerLeft {
        peer: PeerId,
        player_id: PlayerId,
        timed_out: bool,
    },
}

/// Non-blocking access to the peer host's queues.
pub trait PeerLink {
    /// Queues `message` for sending.  Returns `false` if the queue is full or
    /// the host has stopped; the message is dropped in that case.
    fn enqueue(&mut self, message: NetMessage, policy: SendPolicy) -> bool;

    /// Asks the host to drop the connection to `peer`.
    fn disconnect(&mut self, peer: PeerId);

    fn try_recv(&mut self) -> Option<Inbound>;

    fn try_recv_event(&mut self) -> Option<HostEvent>;
}

/// A [`PeerLink`] backed by plain queues.
///
/// Tests push inbound traffic and lifecycle events in, run the coordinator,
/// and inspect what it sent.
#[derive(Debug, Default)]
pub struct ScriptedLink {
    inbound: VecDeque<Inbound>,
    events: VecDeque<HostEvent>,
    sent: Vec<(NetMessage, SendPolicy)>,
    disconnected: Vec<PeerId>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&mut self, message: NetMessage, origin: PeerId, received_at: f64) {
        self.inbound.push_back(Inbound {
            message,
            origin,
            received_at,
        });
    }

    pub fn push_event(&mut self, event: HostEvent) {
        self.events.push_back(event);
    }

    /// Everything sent since the last call, oldest first.
    pub fn take_sent(&mut self) -> Vec<(NetMessage, SendPolicy)> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent(&self) -> &[(NetMessage, SendPolicy)] {
        &self.sent
    }

    pub fn disconnected(&self) -> &[PeerId] {
        &self.disconnected
    }
}

impl PeerLink for ScriptedLink {
    fn enqueue(&mut self, message: NetMessage, policy: SendPolicy) -> bool {
        self.sent.push((message, policy));
        true
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.disconnected.push(peer);
    }

    fn try_recv(&mut self) -> Option<Inbound> {
        self.inbound.pop_front()
    }

    fn try_recv_event(&mut self) -> Option<HostEvent> {
        self.events.pop_front()
    }
}
