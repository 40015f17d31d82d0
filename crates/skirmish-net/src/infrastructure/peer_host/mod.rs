//! The peer host: a transport driven from its own I/O thread.
//!
//! # How the two threads talk (for beginners)
//!
//! Network I/O blocks; the simulation tick must not.  So the host owns the
//! transport on a dedicated thread and hands messages across three bounded
//! tokio channels:
//!
//! ```text
//!   simulation thread                       I/O thread
//!   ─────────────────                       ──────────
//!   HostHandle::enqueue  ── outbound ──►  encode, pick channel, send
//!   HostHandle::try_recv ◄── inbound ───  receive, (relay), decode, stamp
//!   HostHandle::try_recv_event ◄─ events ─ connects, joins, departures
//! ```
//!
//! Only the non-blocking `try_send` / `try_recv` halves are used.  A full
//! queue drops the item and logs a warning; the next tick supersedes it.
//!
//! # Server duties
//!
//! - Assign the lowest free player id to each new peer and unicast `AssignId`.
//! - On departure release the id and broadcast `PlayerDisconnect`.
//! - Forward position, entity and impact frames raw to every other peer
//!   before decoding them for the local coordinator.
//!
//! # Shutdown
//!
//! [`PeerHost::stop`] clears the run flag and waits up to `stop_timeout` for
//! the thread, which flushes pending sends once and shuts the transport down.

pub mod channel;
pub mod id_pool;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use skirmish_core::protocol::messages::NetMessage;
use skirmish_core::{Clock, ProtocolError, WireCodec};

use crate::application::coordinator::SyncRole;
use crate::application::link::{HostEvent, Inbound, PeerId, PeerLink, SendPolicy};
use crate::infrastructure::transport::Transport;

use worker::{IoWorker, Outbound, WorkerQueues};

/// Error type for starting a host.
#[derive(Debug, Error)]
pub enum HostError {
    /// The I/O thread could not be spawned.
    #[error("failed to spawn I/O thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The wire codec could not be created.
    #[error("failed to create wire codec: {0}")]
    Codec(#[from] ProtocolError),
}

/// Host tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Longest the I/O thread blocks in one transport poll.
    pub poll_timeout: Duration,
    /// Capacity of each of the three queues.
    pub queue_capacity: usize,
    /// Server: player ids available, `1..=max_peers`.
    pub max_peers: usize,
    /// How long `stop` waits for the I/O thread.
    pub stop_timeout: Duration,
    /// Spacing of the round-trip-time debug log.
    pub rtt_log_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(5),
            queue_capacity: 4096,
            max_peers: 16,
            stop_timeout: Duration::from_secs(1),
            rtt_log_interval: Duration::from_secs(10),
        }
    }
}

/// Owner of the I/O thread.  Stops it on drop.
#[derive(Debug)]
pub struct PeerHost {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl PeerHost {
    /// Spawns the I/O thread around `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the codec or the thread cannot be created.
    pub fn start(
        transport: Box<dyn Transport>,
        role: SyncRole,
        config: HostConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(PeerHost, HostHandle), HostError> {
        let codec = WireCodec::new()?;
        let capacity = config.queue_capacity.max(1);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (ev_tx, ev_rx) = mpsc::channel(capacity);

        let worker = IoWorker::new(
            transport,
            role,
            &config,
            codec,
            clock,
            WorkerQueues {
                outbound: out_rx,
                inbound: in_tx,
                events: ev_tx,
            },
        );

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let name = match role {
            SyncRole::Server => "skirmish-host-server",
            SyncRole::Client => "skirmish-host-client",
        };
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run(thread_running))
            .map_err(HostError::Spawn)?;
        info!(?role, "peer host started");

        Ok((
            PeerHost {
                running,
                thread: Some(thread),
                stop_timeout: config.stop_timeout,
            },
            HostHandle {
                outbound: out_tx,
                inbound: in_rx,
                events: ev_rx,
            },
        ))
    }

    /// `true` until `stop` is called or the I/O thread exits on its own.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the I/O thread.  Returns `true` if it exited within the stop
    /// timeout; otherwise the thread is left detached.
    pub fn stop(&mut self) -> bool {
        self.running.store(false, Ordering::Relaxed);
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + self.stop_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(timeout = ?self.stop_timeout, "I/O thread did not stop in time, detaching");
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if thread.join().is_err() {
            error!("I/O thread panicked");
            return false;
        }
        info!("peer host stopped");
        true
    }
}

impl Drop for PeerHost {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The coordinator's end of the host queues.
#[derive(Debug)]
pub struct HostHandle {
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<Inbound>,
    events: mpsc::Receiver<HostEvent>,
}

impl PeerLink for HostHandle {
    fn enqueue(&mut self, message: NetMessage, policy: SendPolicy) -> bool {
        self.outbound
            .try_send(Outbound::Message { message, policy })
            .is_ok()
    }

    fn disconnect(&mut self, peer: PeerId) {
        if self.outbound.try_send(Outbound::Disconnect(peer)).is_err() {
            warn!(%peer, "outbound queue unavailable, disconnect not queued");
        }
    }

    fn try_recv(&mut self) -> Option<Inbound> {
        self.inbound.try_recv().ok()
    }

    fn try_recv_event(&mut self) -> Option<HostEvent> {
        self.events.try_recv().ok()
    }
}
