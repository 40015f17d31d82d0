//! In-process transport for tests.
//!
//! A [`MemoryNetwork`] is a hub shared by one server endpoint and any number
//! of client endpoints.  Every send lands in the recipient's inbox
//! immediately and in order, for both delivery modes, so tests get
//! deterministic traffic without sockets.  Peer ids follow the UDP transport:
//! a client sees the server as `PeerId(0)`, the server numbers clients from 1.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::udp::SERVER_PEER;
use super::{ChannelId, Delivery, Transport, TransportError, TransportEvent};
use crate::application::link::PeerId;

#[derive(Debug, Default)]
struct Inbox {
    events: VecDeque<TransportEvent>,
    connected: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct Hub {
    server: Option<Inbox>,
    clients: BTreeMap<PeerId, Inbox>,
    next_client: u32,
    max_peers: usize,
}

impl Hub {
    fn connected_clients(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.clients
            .iter()
            .filter(|(_, inbox)| inbox.connected)
            .map(|(peer, _)| *peer)
    }

    fn push_server(&mut self, event: TransportEvent) {
        if let Some(server) = self.server.as_mut().filter(|s| !s.closed) {
            server.events.push_back(event);
        }
    }

    fn push_client(&mut self, peer: PeerId, event: TransportEvent) {
        if let Some(client) = self.clients.get_mut(&peer).filter(|c| !c.closed) {
            client.events.push_back(event);
        }
    }

    /// Severs the link between the server and `peer`, telling both sides
    /// with the given events.
    fn sever(
        &mut self,
        peer: PeerId,
        to_server: TransportEvent,
        to_client: TransportEvent,
    ) -> bool {
        let Some(client) = self.clients.get_mut(&peer).filter(|c| c.connected) else {
            return false;
        };
        client.connected = false;
        self.push_client(peer, to_client);
        self.push_server(to_server);
        true
    }
}

type Shared = Arc<(Mutex<Hub>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, Hub> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The hub.  Cheap to clone; clones share the same network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    shared: Shared,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the server endpoint.  Clients beyond `max_peers` are refused.
    pub fn server(&self, max_peers: usize) -> MemoryTransport {
        let mut hub = lock(&self.shared);
        hub.max_peers = max_peers;
        hub.server = Some(Inbox {
            connected: true,
            ..Inbox::default()
        });
        drop(hub);
        MemoryTransport {
            shared: Arc::clone(&self.shared),
            endpoint: Endpoint::Server,
        }
    }

    /// Creates a client endpoint and connects it.  Without a server, or with
    /// the server full, the client's first poll reports a timeout.
    pub fn client(&self) -> MemoryTransport {
        let mut hub = lock(&self.shared);
        hub.next_client += 1;
        let peer = PeerId(hub.next_client);
        let server_open = hub.server.as_ref().is_some_and(|s| !s.closed);
        let has_room = hub.connected_clients().count() < hub.max_peers;

        let mut inbox = Inbox::default();
        if server_open && has_room {
            inbox.connected = true;
            inbox.events.push_back(TransportEvent::Connected { peer: SERVER_PEER });
            hub.push_server(TransportEvent::Connected { peer });
        } else {
            inbox.events.push_back(TransportEvent::TimedOut { peer: SERVER_PEER });
        }
        hub.clients.insert(peer, inbox);
        drop(hub);
        self.shared.1.notify_all();

        MemoryTransport {
            shared: Arc::clone(&self.shared),
            endpoint: Endpoint::Client(peer),
        }
    }

    /// Simulates `peer` going silent: both sides see a timeout.
    pub fn drop_client(&self, peer: PeerId) {
        let mut hub = lock(&self.shared);
        hub.sever(
            peer,
            TransportEvent::TimedOut { peer },
            TransportEvent::TimedOut { peer: SERVER_PEER },
        );
        drop(hub);
        self.shared.1.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Server,
    Client(PeerId),
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Shared,
    endpoint: Endpoint,
}

impl MemoryTransport {
    /// The id the server knows this client by.  `None` for the server.
    pub fn client_id(&self) -> Option<PeerId> {
        match self.endpoint {
            Endpoint::Server => None,
            Endpoint::Client(peer) => Some(peer),
        }
    }

    fn inbox<'a>(&self, hub: &'a mut Hub) -> Option<&'a mut Inbox> {
        match self.endpoint {
            Endpoint::Server => hub.server.as_mut(),
            Endpoint::Client(peer) => hub.clients.get_mut(&peer),
        }
    }
}

impl Transport for MemoryTransport {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, TransportError> {
        let (_, condvar) = &*self.shared;
        let mut hub = lock(&self.shared);
        let pending = |hub: &mut Hub| self.inbox(hub).map_or(0, |inbox| inbox.events.len());
        if self.inbox(&mut hub).map_or(true, |inbox| inbox.closed) {
            return Err(TransportError::Closed);
        }
        if pending(&mut hub) == 0 && !timeout.is_zero() {
            hub = condvar
                .wait_timeout(hub, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(self
            .inbox(&mut hub)
            .map(|inbox| inbox.events.drain(..).collect())
            .unwrap_or_default())
    }

    fn send(
        &mut self,
        peer: PeerId,
        channel: ChannelId,
        _delivery: Delivery,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut hub = lock(&self.shared);
        if self.inbox(&mut hub).map_or(true, |inbox| inbox.closed) {
            return Err(TransportError::Closed);
        }
        match self.endpoint {
            Endpoint::Server => {
                if !hub.clients.get(&peer).is_some_and(|c| c.connected) {
                    return Err(TransportError::UnknownPeer(peer));
                }
                hub.push_client(
                    peer,
                    TransportEvent::Received {
                        peer: SERVER_PEER,
                        channel,
                        payload: payload.to_vec(),
                    },
                );
            }
            Endpoint::Client(me) => {
                let connected = hub.clients.get(&me).is_some_and(|c| c.connected);
                if peer != SERVER_PEER || !connected {
                    return Err(TransportError::UnknownPeer(peer));
                }
                hub.push_server(TransportEvent::Received {
                    peer: me,
                    channel,
                    payload: payload.to_vec(),
                });
            }
        }
        drop(hub);
        self.shared.1.notify_all();
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        let hub = lock(&self.shared);
        match self.endpoint {
            Endpoint::Server => hub.connected_clients().collect(),
            Endpoint::Client(me) => {
                if hub.clients.get(&me).is_some_and(|c| c.connected) {
                    vec![SERVER_PEER]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn disconnect(&mut self, peer: PeerId) {
        let mut hub = lock(&self.shared);
        match self.endpoint {
            Endpoint::Server => {
                hub.sever(
                    peer,
                    TransportEvent::Disconnected { peer },
                    TransportEvent::Disconnected { peer: SERVER_PEER },
                );
            }
            Endpoint::Client(me) if peer == SERVER_PEER => {
                hub.sever(
                    me,
                    TransportEvent::Disconnected { peer: me },
                    TransportEvent::Disconnected { peer: SERVER_PEER },
                );
            }
            Endpoint::Client(_) => {}
        }
        drop(hub);
        self.shared.1.notify_all();
    }

    fn round_trip_time(&self, peer: PeerId) -> Option<Duration> {
        self.peers().contains(&peer).then_some(Duration::ZERO)
    }

    fn shutdown(&mut self) {
        let mut hub = lock(&self.shared);
        match self.endpoint {
            Endpoint::Server => {
                let peers: Vec<PeerId> = hub.connected_clients().collect();
                for peer in peers {
                    if let Some(client) = hub.clients.get_mut(&peer) {
                        client.connected = false;
                    }
                    hub.push_client(peer, TransportEvent::Disconnected { peer: SERVER_PEER });
                }
            }
            Endpoint::Client(me) => {
                if let Some(client) = hub.clients.get_mut(&me).filter(|c| c.connected) {
                    client.connected = false;
                    hub.push_server(TransportEvent::Disconnected { peer: me });
                }
            }
        }
        if let Some(inbox) = self.inbox(&mut hub) {
            inbox.closed = true;
            inbox.events.clear();
        }
        drop(hub);
        self.shared.1.notify_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(transport: &mut MemoryTransport) -> Vec<TransportEvent> {
        transport.poll(Duration::ZERO).unwrap()
    }

    #[test]
    fn test_client_connect_notifies_both_sides() {
        // Arrange
        let network = MemoryNetwork::new();
        let mut server = network.server(4);

        // Act
        let mut client = network.client();

        // Assert
        assert_eq!(drain(&mut server), vec![TransportEvent::Connected { peer: PeerId(1) }]);
        assert_eq!(drain(&mut client), vec![TransportEvent::Connected { peer: SERVER_PEER }]);
        assert_eq!(server.peers(), vec![PeerId(1)]);
        assert_eq!(client.peers(), vec![SERVER_PEER]);
        assert_eq!(client.client_id(), Some(PeerId(1)));
    }

    #[test]
    fn test_payloads_arrive_in_send_order() {
        // Arrange
        let network = MemoryNetwork::new();
        let mut server = network.server(4);
        let mut client = network.client();
        drain(&mut server);

        // Act
        client.send(SERVER_PEER, 1, Delivery::Unreliable, b"a").unwrap();
        client.send(SERVER_PEER, 2, Delivery::Reliable, b"b").unwrap();

        // Assert
        assert_eq!(
            drain(&mut server),
            vec![
                TransportEvent::Received {
                    peer: PeerId(1),
                    channel: 1,
                    payload: b"a".to_vec()
                },
                TransportEvent::Received {
                    peer: PeerId(1),
                    channel: 2,
                    payload: b"b".to_vec()
                },
            ]
        );
    }

    #[test]
    fn test_full_server_refuses_client() {
        let network = MemoryNetwork::new();
        let mut server = network.server(1);
        let _first = network.client();
        let mut second = network.client();

        assert_eq!(drain(&mut second), vec![TransportEvent::TimedOut { peer: SERVER_PEER }]);
        assert_eq!(server.peers(), vec![PeerId(1)]);
    }

    #[test]
    fn test_drop_client_times_out_both_sides() {
        // Arrange
        let network = MemoryNetwork::new();
        let mut server = network.server(4);
        let mut client = network.client();
        drain(&mut server);
        drain(&mut client);

        // Act
        network.drop_client(PeerId(1));

        // Assert
        assert_eq!(drain(&mut server), vec![TransportEvent::TimedOut { peer: PeerId(1) }]);
        assert_eq!(drain(&mut client), vec![TransportEvent::TimedOut { peer: SERVER_PEER }]);
        assert!(server.peers().is_empty());
        assert!(matches!(
            server.send(PeerId(1), 0, Delivery::Reliable, b"x"),
            Err(TransportError::UnknownPeer(PeerId(1)))
        ));
    }

    #[test]
    fn test_server_disconnect_tells_the_client() {
        let network = MemoryNetwork::new();
        let mut server = network.server(4);
        let mut client = network.client();
        drain(&mut server);
        drain(&mut client);

        server.disconnect(PeerId(1));

        assert_eq!(drain(&mut server), vec![TransportEvent::Disconnected { peer: PeerId(1) }]);
        assert_eq!(drain(&mut client), vec![TransportEvent::Disconnected { peer: SERVER_PEER }]);
    }

    #[test]
    fn test_poll_times_out_when_idle() {
        let network = MemoryNetwork::new();
        let mut server = network.server(4);

        let events = server.poll(Duration::from_millis(5)).unwrap();

        assert!(events.is_empty());
    }

    #[test]
    fn test_shutdown_closes_endpoint_and_notifies_peer() {
        let network = MemoryNetwork::new();
        let mut server = network.server(4);
        let mut client = network.client();
        drain(&mut server);

        client.shutdown();

        assert_eq!(drain(&mut server), vec![TransportEvent::Disconnected { peer: PeerId(1) }]);
        assert!(matches!(client.poll(Duration::ZERO), Err(TransportError::Closed)));
    }
}
