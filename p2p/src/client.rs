//! Local client fan-out.
//!
//! Clients subscribe to the core with a typed role: CORE clients exchange
//! payload, MONITOR clients observe neighbour state, BLACKLIST clients act
//! as policy oracles. The framing of the client RPC connection itself is the
//! caller's concern; here a client is a channel of typed notices.
use std::fmt;
use std::sync::Arc;

use crossbeam_channel as chan;

use switchyard_common::address::Address;
use switchyard_common::hello::Hello;
use switchyard_common::identity::PeerId;
use switchyard_common::time::LocalTime;

use crate::fsm::NeighbourState;

/// Identifies a subscribed client.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// The role a client declared on subscribe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientKind {
    /// Sends and receives payload; told about connects and disconnects.
    Core,
    /// Observes neighbour state transitions.
    Monitor,
    /// Answers authorization queries.
    Blacklist,
}

/// Why a submitted message was not delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The deadline elapsed before the message could be handed to a carrier.
    Timeout,
    /// No usable address for the peer.
    NoAddress,
    /// The peer is not and could not become a neighbour.
    NotConnected,
    /// The neighbour went away while the message was queued.
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "send deadline elapsed"),
            Self::NoAddress => write!(f, "no usable address for peer"),
            Self::NotConnected => write!(f, "peer is not connected"),
            Self::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

/// Status code of a streamed address-to-string reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The candidate converted; more may follow. A final `Ok` with no text
    /// closes the stream.
    Ok,
    /// This candidate failed to convert; more will follow.
    Error,
}

/// A notice delivered to a subscribed client.
#[derive(Debug, Clone)]
pub enum ClientNotice {
    /// Our current HELLO; sent once on subscribe and on every change.
    OwnHello(Arc<Hello>),
    /// Inbound payload from a connected peer.
    Recv {
        /// Origin peer.
        peer: PeerId,
        /// Opaque payload bytes.
        payload: Arc<Vec<u8>>,
    },
    /// Outcome of a submitted send.
    SendOk {
        /// Destination peer.
        peer: PeerId,
        /// Payload size as submitted.
        bytes_payload: u32,
        /// Bytes handed to the carrier, zero when nothing was sent.
        bytes_on_wire: u32,
        /// `Ok` when the message was handed to a carrier.
        result: Result<(), SendError>,
    },
    /// A neighbour reached CONNECTED.
    Connected {
        /// The neighbour.
        peer: PeerId,
        /// Assigned inbound bandwidth, bytes/second.
        bandwidth_in: u32,
        /// Assigned outbound bandwidth, bytes/second.
        bandwidth_out: u32,
    },
    /// A neighbour went away.
    Disconnected {
        /// The neighbour.
        peer: PeerId,
    },
    /// One element of an address-to-string reply stream.
    AddressToString {
        /// Candidate status.
        status: ReplyStatus,
        /// Printable form; `None` with status `Ok` terminates the stream.
        text: Option<String>,
    },
    /// One monitored peer's state.
    MonitorPeer {
        /// The peer.
        peer: PeerId,
        /// Its primary address, when one is selected.
        address: Option<Address>,
        /// Current neighbour state.
        state: NeighbourState,
        /// When the state times out on its own.
        state_timeout: LocalTime,
    },
    /// End of a one-shot monitor synchronization.
    MonitorEnd,
    /// Authorization query; the oracle must answer with a blacklist reply
    /// command.
    BlacklistQuery {
        /// Peer to authorise.
        peer: PeerId,
    },
}

#[derive(Debug, Clone)]
struct MonitorSubscription {
    /// `None` monitors every peer.
    peer: Option<PeerId>,
}

#[derive(Debug)]
struct Client {
    kind: ClientKind,
    sender: chan::Sender<ClientNotice>,
    monitor: Option<MonitorSubscription>,
}

/// Registry of subscribed clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Vec<(ClientId, Client)>,
    next_id: u64,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a client. Registration order is preserved: blacklist
    /// oracles are consulted in the order they subscribed.
    pub fn register(&mut self, kind: ClientKind, sender: chan::Sender<ClientNotice>) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;

        self.clients.push((
            id,
            Client {
                kind,
                sender,
                monitor: None,
            },
        ));
        id
    }

    /// Remove a client. Unknown ids are ignored.
    pub fn unregister(&mut self, id: ClientId) {
        self.clients.retain(|(cid, _)| *cid != id);
    }

    /// The role of a client.
    pub fn kind(&self, id: ClientId) -> Option<ClientKind> {
        self.find(id).map(|c| c.kind)
    }

    /// Number of subscribed clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are subscribed.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn find(&self, id: ClientId) -> Option<&Client> {
        self.clients
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, c)| c)
    }

    fn find_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients
            .iter_mut()
            .find(|(cid, _)| *cid == id)
            .map(|(_, c)| c)
    }

    /// Deliver a notice to one client. Returns `false` if the client is gone
    /// and was dropped from the registry.
    pub fn notify(&mut self, id: ClientId, notice: ClientNotice) -> bool {
        match self.find(id) {
            Some(client) => {
                if client.sender.try_send(notice).is_err() {
                    self.unregister(id);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Deliver a notice to every CORE client.
    pub fn broadcast_core(&mut self, notice: ClientNotice) {
        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.kind == ClientKind::Core)
            .map(|(id, _)| *id)
            .collect();

        for id in targets {
            self.notify(id, notice.clone());
        }
    }

    /// Record a monitor subscription for a client.
    pub fn subscribe_monitor(&mut self, id: ClientId, peer: Option<PeerId>) {
        if let Some(client) = self.find_mut(id) {
            client.monitor = Some(MonitorSubscription { peer });
        }
    }

    /// Monitors whose subscription matches the given peer.
    pub fn monitors_of(&self, peer: &PeerId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, c)| match &c.monitor {
                Some(sub) => sub.peer.map_or(true, |p| p == *peer),
                None => false,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Blacklist oracles in registration order.
    pub fn oracles(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, c)| c.kind == ClientKind::Blacklist)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_order_is_registration_order() {
        let mut registry = ClientRegistry::new();
        let (tx, _rx) = chan::unbounded();

        let _core = registry.register(ClientKind::Core, tx.clone());
        let first = registry.register(ClientKind::Blacklist, tx.clone());
        let second = registry.register(ClientKind::Blacklist, tx);

        assert_eq!(registry.oracles(), vec![first, second]);
    }

    #[test]
    fn test_dead_client_is_dropped_on_notify() {
        let mut registry = ClientRegistry::new();
        let (tx, rx) = chan::unbounded();
        let id = registry.register(ClientKind::Core, tx);

        drop(rx);
        assert!(!registry.notify(
            id,
            ClientNotice::Disconnected {
                peer: PeerId::from_bytes([1; 32])
            }
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_monitor_matching() {
        let mut registry = ClientRegistry::new();
        let (tx, _rx) = chan::unbounded();
        let all = registry.register(ClientKind::Monitor, tx.clone());
        let one = registry.register(ClientKind::Monitor, tx);

        let x = PeerId::from_bytes([1; 32]);
        let y = PeerId::from_bytes([2; 32]);

        registry.subscribe_monitor(all, None);
        registry.subscribe_monitor(one, Some(x));

        assert_eq!(registry.monitors_of(&x), vec![all, one]);
        assert_eq!(registry.monitors_of(&y), vec![all]);
    }
}
