//! The I/O thread's loop.
//!
//! Each iteration flushes the outbound queue to the transport, then polls the
//! transport once and turns what happened into inbound messages and
//! lifecycle events for the coordinator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use skirmish_core::protocol::messages::{NetMessage, Payload};
use skirmish_core::{Clock, GameId, PlayerId, WireCodec, WORLD_PLAYER};

use super::channel::Channel;
use super::id_pool::PlayerIdPool;
use super::HostConfig;
use crate::application::coordinator::SyncRole;
use crate::application::link::{HostEvent, Inbound, PeerId, SendPolicy};
use crate::infrastructure::transport::{ChannelId, Transport, TransportError, TransportEvent};

/// Work item queued by the coordinator.
#[derive(Debug)]
pub(super) enum Outbound {
    Message {
        message: NetMessage,
        policy: SendPolicy,
    },
    Disconnect(PeerId),
}

/// The worker's ends of the host queues.
pub(super) struct WorkerQueues {
    pub outbound: mpsc::Receiver<Outbound>,
    pub inbound: mpsc::Sender<Inbound>,
    pub events: mpsc::Sender<HostEvent>,
}

pub(super) struct IoWorker {
    transport: Box<dyn Transport>,
    role: SyncRole,
    codec: WireCodec,
    clock: Arc<dyn Clock>,
    queues: WorkerQueues,
    ids: PlayerIdPool,
    /// Server: connected peers that were given a player id.
    joined: BTreeMap<PeerId, PlayerId>,
    poll_timeout: Duration,
    rtt_log_interval: Duration,
    last_rtt_log: Instant,
}

impl IoWorker {
    pub(super) fn new(
        transport: Box<dyn Transport>,
        role: SyncRole,
        config: &HostConfig,
        codec: WireCodec,
        clock: Arc<dyn Clock>,
        queues: WorkerQueues,
    ) -> Self {
        Self {
            transport,
            role,
            codec,
            clock,
            queues,
            ids: PlayerIdPool::new(config.max_peers),
            joined: BTreeMap::new(),
            poll_timeout: config.poll_timeout,
            rtt_log_interval: config.rtt_log_interval,
            last_rtt_log: Instant::now(),
        }
    }

    /// Runs until `running` is cleared or the transport closes, then flushes
    /// once and shuts the transport down.
    pub(super) fn run(mut self, running: Arc<AtomicBool>) {
        info!(role = ?self.role, "I/O thread started");
        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.step() {
                if matches!(e, TransportError::Closed) {
                    warn!("transport closed under the I/O thread");
                    break;
                }
                error!("transport poll failed: {e}");
                // Avoid spinning on a persistent socket error.
                std::thread::sleep(self.poll_timeout);
            }
            self.log_round_trip_times();
        }
        self.flush_outbound();
        self.transport.shutdown();
        info!(role = ?self.role, "I/O thread stopped");
    }

    /// One iteration: flush, then poll.
    pub(super) fn step(&mut self) -> Result<(), TransportError> {
        self.flush_outbound();
        let events = self.transport.poll(self.poll_timeout)?;
        for event in events {
            self.handle(event);
        }
        Ok(())
    }

    fn flush_outbound(&mut self) {
        while let Ok(item) = self.queues.outbound.try_recv() {
            match item {
                Outbound::Message { message, policy } => self.send_message(&message, policy),
                Outbound::Disconnect(peer) => self.transport.disconnect(peer),
            }
        }
    }

    /// Peers a message may go to: joined peers on a server, the transport's
    /// peers (the server) on a client.
    fn recipients(&self, policy: SendPolicy) -> Vec<PeerId> {
        let candidates = match self.role {
            SyncRole::Server => self.joined.keys().copied().collect(),
            SyncRole::Client => self.transport.peers(),
        };
        candidates
            .into_iter()
            .filter(|peer| policy.includes(*peer))
            .collect()
    }

    fn send_message(&mut self, message: &NetMessage, policy: SendPolicy) {
        let bytes = match self.codec.encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = ?message.kind(), "dropping unencodable message: {e}");
                return;
            }
        };
        let channel = Channel::for_payload(&message.payload);
        for peer in self.recipients(policy) {
            if let Err(e) = self
                .transport
                .send(peer, channel.id(), channel.delivery(), &bytes)
            {
                warn!(%peer, kind = ?message.kind(), "send failed: {e}");
            }
        }
    }

    fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer } => self.on_connected(peer),
            TransportEvent::Disconnected { peer } => self.on_lost(peer, false),
            TransportEvent::TimedOut { peer } => self.on_lost(peer, true),
            TransportEvent::Received {
                peer,
                channel,
                payload,
            } => self.on_received(peer, channel, &payload),
        }
    }

    fn on_connected(&mut self, peer: PeerId) {
        match self.role {
            SyncRole::Client => {
                info!(server = %peer, "connected");
                self.emit(HostEvent::Connected { server: peer });
            }
            SyncRole::Server => {
                let Some(player_id) = self.ids.acquire() else {
                    warn!(%peer, "no free player id, disconnecting");
                    self.transport.disconnect(peer);
                    return;
                };
                self.joined.insert(peer, player_id);
                info!(%peer, player_id, "peer joined");
                let assign = NetMessage::new(
                    GameId::player(WORLD_PLAYER),
                    self.clock.now(),
                    Payload::AssignId { player_id },
                );
                self.send_message(&assign, SendPolicy::ToPeer(peer));
                self.emit(HostEvent::PeerJoined { peer, player_id });
            }
        }
    }

    fn on_lost(&mut self, peer: PeerId, timed_out: bool) {
        match self.role {
            SyncRole::Client => {
                info!(server = %peer, timed_out, "disconnected");
                self.emit(HostEvent::Disconnected { timed_out });
            }
            SyncRole::Server => {
                let Some(player_id) = self.joined.remove(&peer) else {
                    return;
                };
                self.ids.release(player_id);
                info!(%peer, player_id, timed_out, "peer left");
                let notice = NetMessage::new(
                    GameId::player(player_id),
                    self.clock.now(),
                    Payload::PlayerDisconnect,
                );
                self.send_message(&notice, SendPolicy::ToAll);
                self.emit(HostEvent::PeerLeft {
                    peer,
                    player_id,
                    timed_out,
                });
            }
        }
    }

    fn on_received(&mut self, peer: PeerId, channel: ChannelId, payload: &[u8]) {
        let received_at = self.clock.now();
        if self.role == SyncRole::Server {
            if !self.joined.contains_key(&peer) {
                debug!(%peer, "dropping datagram from peer without a player id");
                return;
            }
            match Channel::from_id(channel) {
                Some(ch) if ch.relayed() => self.relay(peer, ch, payload),
                Some(_) => {}
                None => {
                    debug!(%peer, channel, "dropping datagram on unknown channel");
                    return;
                }
            }
        }

        match self.codec.decode(payload) {
            Ok(message) => {
                let inbound = Inbound {
                    message,
                    origin: peer,
                    received_at,
                };
                if self.queues.inbound.try_send(inbound).is_err() {
                    warn!(%peer, "receive queue full, dropping message");
                }
            }
            Err(e) => warn!(%peer, channel, len = payload.len(), "undecodable datagram: {e}"),
        }
    }

    /// Forwards a raw frame to every joined peer but its origin.
    fn relay(&mut self, origin: PeerId, channel: Channel, payload: &[u8]) {
        for peer in self.recipients(SendPolicy::ToAllExcept(origin)) {
            if let Err(e) = self
                .transport
                .send(peer, channel.id(), channel.delivery(), payload)
            {
                warn!(%peer, %origin, "relay failed: {e}");
            }
        }
    }

    fn emit(&self, event: HostEvent) {
        if self.queues.events.try_send(event).is_err() {
            warn!("event queue full, dropping lifecycle event");
        }
    }

    fn log_round_trip_times(&mut self) {
        if self.last_rtt_log.elapsed() < self.rtt_log_interval {
            return;
        }
        self.last_rtt_log = Instant::now();
        for peer in self.transport.peers() {
            if let Some(rtt) = self.transport.round_trip_time(peer) {
                debug!(%peer, rtt_ms = rtt.as_secs_f64() * 1000.0, "round-trip time");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::{Delivery, MockTransport};
    use skirmish_core::protocol::messages::PlaneUpdate;
    use skirmish_core::{encode_message, Kinematics, ManualClock};

    struct Harness {
        worker: IoWorker,
        outbound: mpsc::Sender<Outbound>,
        inbound: mpsc::Receiver<Inbound>,
        events: mpsc::Receiver<HostEvent>,
    }

    fn harness(transport: MockTransport, role: SyncRole, max_peers: usize) -> Harness {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (ev_tx, ev_rx) = mpsc::channel(16);
        let config = HostConfig {
            max_peers,
            rtt_log_interval: Duration::from_secs(3600),
            ..HostConfig::default()
        };
        let worker = IoWorker::new(
            Box::new(transport),
            role,
            &config,
            WireCodec::new().unwrap(),
            Arc::new(ManualClock::new(42.0)),
            WorkerQueues {
                outbound: out_rx,
                inbound: in_tx,
                events: ev_tx,
            },
        );
        Harness {
            worker,
            outbound: out_tx,
            inbound: in_rx,
            events: ev_rx,
        }
    }

    /// Makes `poll` return each batch in turn, then nothing.
    fn script_polls(transport: &mut MockTransport, batches: Vec<Vec<TransportEvent>>) {
        let mut batches = batches.into_iter();
        transport
            .expect_poll()
            .returning(move |_| Ok(batches.next().unwrap_or_default()));
    }

    fn plane_update_bytes() -> Vec<u8> {
        let msg = NetMessage::new(
            GameId::new(1, 1),
            41.0,
            Payload::PlaneUpdate(PlaneUpdate {
                kinematics: Kinematics::default(),
                throttle: 0.5,
                health: 100.0,
            }),
        );
        encode_message(&msg).unwrap()
    }

    fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_server_assigns_ids_and_relays_without_echo() {
        // Arrange
        let bytes = plane_update_bytes();
        let mut transport = MockTransport::new();
        script_polls(
            &mut transport,
            vec![
                vec![
                    TransportEvent::Connected { peer: PeerId(1) },
                    TransportEvent::Connected { peer: PeerId(2) },
                ],
                vec![TransportEvent::Received {
                    peer: PeerId(1),
                    channel: Channel::Position.id(),
                    payload: bytes.clone(),
                }],
            ],
        );
        // Two AssignId unicasts on the control channel.
        transport
            .expect_send()
            .withf(|_, channel, delivery, _| *channel == 0 && *delivery == Delivery::Reliable)
            .times(2)
            .returning(|_, _, _, _| Ok(()));
        // The relayed frame goes to peer 2 only, byte for byte.
        let expected = bytes.clone();
        transport
            .expect_send()
            .withf(move |peer, channel, delivery, payload| {
                *peer == PeerId(2)
                    && *channel == 1
                    && *delivery == Delivery::Unreliable
                    && payload == expected.as_slice()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut h = harness(transport, SyncRole::Server, 4);

        // Act
        h.worker.step().unwrap();
        h.worker.step().unwrap();

        // Assert
        assert_eq!(
            drain(&mut h.events),
            vec![
                HostEvent::PeerJoined {
                    peer: PeerId(1),
                    player_id: 1
                },
                HostEvent::PeerJoined {
                    peer: PeerId(2),
                    player_id: 2
                },
            ]
        );
        let inbound = drain(&mut h.inbound);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].origin, PeerId(1));
        assert_eq!(inbound[0].received_at, 42.0);
    }

    #[test]
    fn test_server_broadcasts_player_disconnect_when_peer_times_out() {
        // Arrange
        let mut transport = MockTransport::new();
        script_polls(
            &mut transport,
            vec![
                vec![
                    TransportEvent::Connected { peer: PeerId(1) },
                    TransportEvent::Connected { peer: PeerId(2) },
                ],
                vec![TransportEvent::TimedOut { peer: PeerId(1) }],
            ],
        );
        transport
            .expect_send()
            .withf(|_, channel, _, _| *channel == 0)
            .returning(|_, _, _, _| Ok(()));
        let mut h = harness(transport, SyncRole::Server, 4);

        // Act
        h.worker.step().unwrap();
        drain(&mut h.events);
        h.worker.step().unwrap();

        // Assert
        assert_eq!(
            drain(&mut h.events),
            vec![HostEvent::PeerLeft {
                peer: PeerId(1),
                player_id: 1,
                timed_out: true
            }]
        );
        assert_eq!(h.worker.ids.in_use(), 1);
        assert_eq!(h.worker.recipients(SendPolicy::ToAll), vec![PeerId(2)]);
    }

    #[test]
    fn test_server_disconnects_peer_when_ids_run_out() {
        // Arrange
        let mut transport = MockTransport::new();
        script_polls(
            &mut transport,
            vec![vec![
                TransportEvent::Connected { peer: PeerId(1) },
                TransportEvent::Connected { peer: PeerId(2) },
            ]],
        );
        transport.expect_send().returning(|_, _, _, _| Ok(()));
        transport
            .expect_disconnect()
            .withf(|peer| *peer == PeerId(2))
            .times(1)
            .return_const(());
        let mut h = harness(transport, SyncRole::Server, 1);

        // Act
        h.worker.step().unwrap();

        // Assert
        assert_eq!(drain(&mut h.events).len(), 1);
    }

    #[test]
    fn test_client_sends_queued_message_on_its_channel() {
        // Arrange
        let mut transport = MockTransport::new();
        script_polls(
            &mut transport,
            vec![vec![TransportEvent::Connected { peer: PeerId(0) }]],
        );
        transport.expect_peers().returning(|| vec![PeerId(0)]);
        transport
            .expect_send()
            .withf(|peer, channel, delivery, _| {
                *peer == PeerId(0) && *channel == 0 && *delivery == Delivery::Reliable
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut h = harness(transport, SyncRole::Client, 4);
        h.worker.step().unwrap();
        let request = NetMessage::new(GameId::player(3), 1.0, Payload::SyncRequest { t0: 1.0 });

        // Act
        h.outbound
            .try_send(Outbound::Message {
                message: request,
                policy: SendPolicy::ToAll,
            })
            .unwrap();
        h.worker.step().unwrap();

        // Assert
        assert_eq!(
            drain(&mut h.events),
            vec![HostEvent::Connected { server: PeerId(0) }]
        );
    }

    #[test]
    fn test_undecodable_datagram_is_dropped() {
        // Arrange
        let mut transport = MockTransport::new();
        script_polls(
            &mut transport,
            vec![vec![
                TransportEvent::Connected { peer: PeerId(0) },
                TransportEvent::Received {
                    peer: PeerId(0),
                    channel: 2,
                    payload: vec![0xBA, 0xD0],
                },
            ]],
        );
        let mut h = harness(transport, SyncRole::Client, 4);

        // Act
        h.worker.step().unwrap();

        // Assert
        assert!(drain(&mut h.inbound).is_empty());
    }

    #[test]
    fn test_client_reports_timeout() {
        let mut transport = MockTransport::new();
        script_polls(
            &mut transport,
            vec![vec![TransportEvent::TimedOut { peer: PeerId(0) }]],
        );
        let mut h = harness(transport, SyncRole::Client, 4);

        h.worker.step().unwrap();

        assert_eq!(
            drain(&mut h.events),
            vec![HostEvent::Disconnected { timed_out: true }]
        );
    }
}
