//! Datagram transports.
//!
//! A [`Transport`] moves opaque byte payloads between this process and its
//! peers on numbered channels.  Each send picks a [`Delivery`] mode:
//!
//! - **Reliable** payloads arrive exactly once and in send order per channel.
//! - **Unreliable** payloads may be lost; stale ones (older than a payload
//!   already delivered on the same channel) are dropped, so what arrives is
//!   always the newest.
//!
//! # Implementations
//!
//! - [`udp::UdpTransport`] – real sockets, for the binary.
//! - [`memory::MemoryTransport`] – an in-process hub with immediate FIFO
//!   delivery, for tests.
//!
//! The peer host owns exactly one transport and drives it from its I/O thread
//! through this trait, which is also the seam the host's unit tests mock.

pub mod memory;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::application::link::PeerId;

/// Numbered lane on a connection.  Ordering is per channel.
pub type ChannelId = u8;

/// Delivery guarantee for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

/// Something that happened on the transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake with `peer` completed.
    Connected { peer: PeerId },
    /// `peer` said goodbye or was disconnected locally.
    Disconnected { peer: PeerId },
    /// `peer` went silent, or a handshake never completed.
    TimedOut { peer: PeerId },
    /// A payload arrived.
    Received {
        peer: PeerId,
        channel: ChannelId,
        payload: Vec<u8>,
    },
}

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A socket operation failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// No connection to the named peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The payload does not fit in one datagram.
    #[error("payload of {size} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// The transport has been shut down.
    #[error("transport is closed")]
    Closed,
}

/// A connection-oriented datagram transport.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Waits up to `timeout` for traffic, services timers, and returns every
    /// event that occurred.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, TransportError>;

    /// Sends `payload` to `peer` on `channel`.
    fn send(
        &mut self,
        peer: PeerId,
        channel: ChannelId,
        delivery: Delivery,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Currently connected peers, in ascending id order.
    fn peers(&self) -> Vec<PeerId>;

    /// Drops the connection to `peer`.  A `Disconnected` event follows.
    fn disconnect(&mut self, peer: PeerId);

    /// Latest measured round-trip time to `peer`, if any.
    fn round_trip_time(&self, peer: PeerId) -> Option<Duration>;

    /// Says goodbye to every peer and releases the socket.
    fn shutdown(&mut self);
}
