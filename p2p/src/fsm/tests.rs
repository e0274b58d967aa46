//! End-to-end tests driving two state machines against each other through
//! an in-memory carrier.
use std::collections::HashMap;

use crossbeam_channel as chan;

use switchyard_common::address::{Address, OwnAddress};
use switchyard_common::identity::{Identity, PeerId};
use switchyard_common::time::{LocalDuration, LocalTime, RefClock};

use super::*;
use crate::client::{ClientKind, ClientNotice};
use crate::message::Message;
use crate::plugin::{AddressChange, Link};
use crate::session::SessionId;
use crate::stats;

struct Node {
    fsm: StateMachine<RefClock>,
    clock: RefClock,
    address: OwnAddress,
    notices: Option<chan::Receiver<ClientNotice>>,
}

impl Node {
    fn new(seed: u64, octet: u8, config: Config) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let identity = Identity::generate(&mut rng);
        let clock = RefClock::from(LocalTime::from_secs(10_000));
        let mut fsm = StateMachine::new(
            identity,
            config,
            fastrand::Rng::with_seed(seed + 1),
            clock.clone(),
        );
        let address = OwnAddress::new("tcp", vec![10, 0, 0, octet, 4, 0]);

        fsm.initialize(clock.local_time());
        fsm.address_changed(AddressChange::Added, address.clone());

        Self {
            fsm,
            clock,
            address,
            notices: None,
        }
    }

    fn peer_id(&self) -> PeerId {
        self.fsm.peer_id()
    }

    fn subscribe(&mut self, kind: ClientKind) -> ClientId {
        let (tx, rx) = chan::unbounded();
        let (reply_tx, reply_rx) = chan::unbounded();
        self.fsm.command(Command::RegisterClient {
            kind,
            sender: tx,
            reply: reply_tx,
        });
        let id = reply_rx.try_recv().expect("registration replies synchronously");
        self.notices = Some(rx);
        id
    }

    fn notices(&self) -> Vec<ClientNotice> {
        self.notices
            .as_ref()
            .map(|rx| rx.try_iter().collect())
            .unwrap_or_default()
    }
}

/// Two nodes joined by an in-memory carrier.
struct Sim {
    nodes: Vec<Node>,
    /// Session pairing across nodes: (node, session) <-> (node, session).
    links: HashMap<(usize, SessionId), (usize, SessionId)>,
    /// Wire log of everything delivered, as (from, message).
    wire: Vec<(usize, Message)>,
}

impl Sim {
    fn new(configs: [Config; 2]) -> Self {
        let [ca, cb] = configs;
        Self {
            nodes: vec![Node::new(1000, 1, ca), Node::new(2000, 2, cb)],
            links: HashMap::new(),
            wire: Vec::new(),
        }
    }

    fn peer(&self, index: usize) -> PeerId {
        self.nodes[index].peer_id()
    }

    /// Open a session pair between two nodes, as if a dial succeeded.
    fn open_link(&mut self, dialer: usize, target: usize) -> (SessionId, SessionId) {
        let dialer_peer = self.peer(dialer);
        let target_peer = self.peer(target);
        let target_bytes = self.nodes[target].address.bytes.clone();
        let dialer_bytes = self.nodes[dialer].address.bytes.clone();

        let out = self.nodes[dialer]
            .fsm
            .session_started(
                "tcp",
                Address::new("tcp", target_bytes, target_peer),
                Link::Outbound,
            )
            .expect("outbound session admitted");
        let inn = self.nodes[target]
            .fsm
            .session_started(
                "tcp",
                Address::new("tcp", dialer_bytes, dialer_peer),
                Link::Inbound,
            )
            .expect("inbound session admitted");

        self.links.insert((dialer, out), (target, inn));
        self.links.insert((target, inn), (dialer, out));
        (out, inn)
    }

    fn close_link(&mut self, node: usize, session: SessionId) {
        if let Some((other, remote)) = self.links.remove(&(node, session)) {
            self.links.remove(&(other, remote));
            self.nodes[node].fsm.session_ended(session);
            self.nodes[other].fsm.session_ended(remote);
        }
    }

    /// Drain both machines, shuttling writes across links, until quiescent.
    fn run(&mut self) {
        for _ in 0..1000 {
            let mut busy = false;

            for index in 0..self.nodes.len() {
                let outputs: Vec<Io> = self.nodes[index].fsm.drain().collect();
                for io in outputs {
                    match io {
                        Io::Write(session, message) => {
                            busy = true;
                            self.wire.push((index, message.clone()));
                            if let Some(&(other, remote)) = self.links.get(&(index, session)) {
                                self.nodes[other].fsm.message_received(remote, message);
                            }
                        }
                        Io::Connect(address) => {
                            busy = true;
                            let target = self
                                .nodes
                                .iter()
                                .position(|n| n.peer_id() == address.peer);
                            if let Some(target) = target {
                                // One link per pair keeps the session
                                // table small.
                                let already = self
                                    .links
                                    .iter()
                                    .any(|((n, _), (o, _))| *n == index && *o == target);
                                if !already {
                                    self.open_link(index, target);
                                }
                            }
                        }
                        Io::Disconnect(session, _) => {
                            busy = true;
                            self.close_link(index, session);
                        }
                        Io::SetTimer(_) | Io::Event(_) => {}
                    }
                }
            }
            if !busy {
                return;
            }
        }
        panic!("simulation did not quiesce");
    }

    /// Advance both clocks and fire the timers.
    fn elapse(&mut self, duration: LocalDuration) {
        for node in &mut self.nodes {
            node.clock.elapse(duration);
            node.fsm.timer_expired();
        }
        self.run();
    }

    fn syn_acks_on_wire(&self) -> usize {
        self.wire
            .iter()
            .filter(|(_, m)| matches!(m, Message::SynAck { .. }))
            .count()
    }
}

fn connected_config() -> Config {
    Config::default()
}

#[test]
fn test_validation_end_to_end() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    let (ab, _ba) = sim.open_link(0, 1);
    sim.run();

    // A learns B's self-description over the session and challenges the
    // advertised address.
    let hello = (*sim.nodes[1].fsm.own_hello()).clone();
    sim.nodes[0]
        .fsm
        .message_received(ab, Message::Hello(hello));
    sim.run();

    assert!(sim
        .wire
        .iter()
        .any(|(from, m)| *from == 0 && matches!(m, Message::Ping(_))));
    assert!(sim
        .wire
        .iter()
        .any(|(from, m)| *from == 1 && matches!(m, Message::Pong(_))));
    assert_eq!(
        sim.nodes[0].fsm.statistics().get(stats::VALIDATED_ADDRESSES),
        1
    );
    assert_eq!(
        sim.nodes[0].fsm.statistics().get(stats::PONGS_VERIFIED),
        1
    );
}

#[test]
fn test_connect_and_send() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    let a_client = sim.nodes[0].subscribe(ClientKind::Core);
    let _b_client = sim.nodes[1].subscribe(ClientKind::Core);
    sim.run();

    let b = sim.peer(1);
    sim.open_link(0, 1);
    sim.run();

    sim.nodes[0].fsm.command(Command::Send {
        client: a_client,
        peer: b,
        payload: b"ping across the yard".to_vec(),
        priority: 1,
        timeout: LocalDuration::from_secs(30),
    });
    sim.run();

    assert!(sim.nodes[0].fsm.statistics().get(stats::CONNECTED_NEIGHBOURS) >= 1);

    let a_notices = sim.nodes[0].notices();
    assert!(a_notices.iter().any(|n| matches!(
        n,
        ClientNotice::SendOk { result: Ok(()), bytes_on_wire, .. } if *bytes_on_wire > 0
    )));
    assert!(a_notices
        .iter()
        .any(|n| matches!(n, ClientNotice::Connected { peer, .. } if *peer == b)));

    let b_notices = sim.nodes[1].notices();
    assert!(b_notices.iter().any(|n| matches!(
        n,
        ClientNotice::Recv { payload, .. } if payload.as_slice() == b"ping across the yard"
    )));
}

#[test]
fn test_simultaneous_connect() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    let a_client = sim.nodes[0].subscribe(ClientKind::Core);
    let b_client = sim.nodes[1].subscribe(ClientKind::Core);
    sim.run();

    let a = sim.peer(0);
    let b = sim.peer(1);
    sim.open_link(0, 1);
    sim.run();

    // Both sides try to connect at once.
    sim.nodes[0].fsm.command(Command::Send {
        client: a_client,
        peer: b,
        payload: vec![0xaa],
        priority: 0,
        timeout: LocalDuration::from_secs(30),
    });
    sim.nodes[1].fsm.command(Command::Send {
        client: b_client,
        peer: a,
        payload: vec![0xbb],
        priority: 0,
        timeout: LocalDuration::from_secs(30),
    });
    sim.run();

    // Exactly one connected neighbour on each side, and both agree: one
    // handshake won, so only one SYN-ACK crossed the wire.
    assert!(sim.nodes[0].fsm.statistics().get(stats::CONNECTED_NEIGHBOURS) == 1);
    assert!(sim.nodes[1].fsm.statistics().get(stats::CONNECTED_NEIGHBOURS) == 1);
    assert_eq!(sim.syn_acks_on_wire(), 1);
    assert_eq!(
        sim.nodes[0].fsm.statistics().get(stats::TIMEOUT_DISCONNECTS),
        0
    );
    assert_eq!(
        sim.nodes[1].fsm.statistics().get(stats::TIMEOUT_DISCONNECTS),
        0
    );
}

#[test]
fn test_blacklist_oracle_abort_kills_session() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    let oracle = sim.nodes[0].subscribe(ClientKind::Blacklist);
    sim.run();

    let a = sim.peer(0);
    let (_ab, ba) = sim.open_link(1, 0);
    sim.run();

    // B opens a handshake towards A; A's oracle is consulted.
    let b_client = {
        let (tx, _rx) = chan::unbounded();
        let (reply_tx, reply_rx) = chan::unbounded();
        sim.nodes[1].fsm.command(Command::RegisterClient {
            kind: ClientKind::Core,
            sender: tx,
            reply: reply_tx,
        });
        reply_rx.try_recv().unwrap()
    };
    sim.nodes[1].fsm.command(Command::Send {
        client: b_client,
        peer: a,
        payload: vec![1],
        priority: 0,
        timeout: LocalDuration::from_secs(30),
    });
    // Drain B only, shuttling its SYN to A but withholding A's outputs so
    // the oracle query stays pending.
    sim.run();

    let queries: Vec<PeerId> = sim.nodes[0]
        .notices()
        .into_iter()
        .filter_map(|n| match n {
            ClientNotice::BlacklistQuery { peer } => Some(peer),
            _ => None,
        })
        .collect();
    assert!(!queries.is_empty(), "the oracle must be consulted");

    // The oracle aborts: "I don't know".
    sim.nodes[0].fsm.command(Command::BlacklistReply {
        client: oracle,
        peer: queries[0],
        allowed: None,
    });
    sim.run();

    // The inbound session on A was killed; nothing else was sent on it.
    assert!(sim.nodes[0].fsm.statistics().get(stats::SESSIONS_KILLED) >= 1);
    assert!(!sim.links.contains_key(&(0, ba)));
    assert_eq!(sim.syn_acks_on_wire(), 0);
}

#[test]
fn test_static_blacklist_refuses_session() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    sim.run();
    let b = sim.peer(1);

    // Rebuild A with B statically denied on every carrier.
    let mut config = connected_config();
    config.static_blacklist = vec![StaticEntry {
        peer: b,
        transport: None,
    }];
    sim.nodes[0] = Node::new(1000, 1, config);
    sim.run();

    let denied = sim.nodes[0].fsm.session_started(
        "tcp",
        Address::new("tcp", vec![10, 0, 0, 2, 4, 0], b),
        Link::Inbound,
    );
    assert!(denied.is_none());
}

#[test]
fn test_no_write_after_session_end() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    let a_client = sim.nodes[0].subscribe(ClientKind::Core);
    sim.run();

    let b = sim.peer(1);
    let (ab, _) = sim.open_link(0, 1);
    sim.run();

    sim.nodes[0].fsm.command(Command::Send {
        client: a_client,
        peer: b,
        payload: vec![7; 64],
        priority: 0,
        timeout: LocalDuration::from_secs(30),
    });
    // The carrier tears the session down before the machine is drained.
    sim.close_link(0, ab);

    let leaked: Vec<Io> = sim.nodes[0]
        .fsm
        .drain()
        .filter(|io| matches!(io, Io::Write(s, _) if *s == ab))
        .collect();
    assert!(leaked.is_empty(), "no write may reference a dead session");
}

#[test]
fn test_idle_neighbour_times_out() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    let a_client = sim.nodes[0].subscribe(ClientKind::Core);
    sim.run();

    let b = sim.peer(1);
    sim.open_link(0, 1);
    sim.run();

    sim.nodes[0].fsm.command(Command::Send {
        client: a_client,
        peer: b,
        payload: vec![1],
        priority: 0,
        timeout: LocalDuration::from_secs(5),
    });
    sim.run();
    assert_eq!(sim.nodes[0].fsm.statistics().get(stats::CONNECTED_NEIGHBOURS), 1);

    // Silence B: drop every link so keepalives go nowhere.
    let b_links: Vec<(usize, SessionId)> = sim
        .links
        .keys()
        .filter(|(node, _)| *node == 0)
        .copied()
        .collect();
    for (node, session) in b_links {
        sim.close_link(node, session);
    }

    for _ in 0..40 {
        sim.elapse(LocalDuration::from_secs(1));
    }
    assert_eq!(sim.nodes[0].fsm.statistics().get(stats::CONNECTED_NEIGHBOURS), 0);
    assert!(sim.nodes[0].fsm.statistics().get(stats::TIMEOUT_DISCONNECTS) >= 1);
}

#[test]
fn test_unique_neighbour_per_peer() {
    let mut sim = Sim::new([connected_config(), connected_config()]);
    let a_client = sim.nodes[0].subscribe(ClientKind::Core);
    sim.run();

    let b = sim.peer(1);
    sim.open_link(0, 1);
    sim.open_link(0, 1);
    sim.run();

    for _ in 0..3 {
        sim.nodes[0].fsm.command(Command::Send {
            client: a_client,
            peer: b,
            payload: vec![1],
            priority: 0,
            timeout: LocalDuration::from_secs(30),
        });
    }
    sim.run();

    let (tx, rx) = chan::unbounded();
    sim.nodes[0].fsm.command(Command::GetNeighbours(tx));
    let neighbours = rx.try_recv().unwrap();
    assert_eq!(neighbours.len(), 1);
    assert_eq!(neighbours[0].peer, b);
}
