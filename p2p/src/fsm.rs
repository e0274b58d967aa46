//! Transport protocol state machine.
//!
//! Deterministic and free of I/O: carriers, timers and clients inject
//! inputs through the entry points below, and everything the core wants
//! done comes back out of the [`Iterator`] of [`Io`] intents.
use crossbeam_channel as chan;
use log::*;

pub mod event;
pub mod output;

// Sub-components.
mod atsmgr;
mod blacklistmgr;
mod hellomgr;
mod killq;
mod neighbourmgr;
mod quota;
mod topologymgr;
mod validator;

#[cfg(test)]
mod tests;

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use switchyard_common::address::{Address, OwnAddress};
use switchyard_common::collections::HashSet;
use switchyard_common::identity::{Identity, PeerId};
use switchyard_common::time::{Clock, LocalDuration, LocalTime};

use atsmgr::AtsManager;
use blacklistmgr::BlacklistManager;
use hellomgr::HelloManager;
use killq::KillQueue;
use neighbourmgr::NeighbourManager;
use topologymgr::TopologyManager;
use validator::ValidationManager;

pub use blacklistmgr::{CheckContext, CheckOutcome, StaticEntry};
pub use event::Event;
pub use neighbourmgr::{NeighbourInfo, NeighbourState};
pub use output::{Io, Outbox};
pub use quota::QuotaOutcome;
pub use topologymgr::Config as TopologyConfig;
pub use validator::PongDisposition;

use crate::client::{ClientId, ClientKind, ClientNotice, ClientRegistry, ReplyStatus, SendError};
use crate::message::Message;
use crate::plugin::{AddressChange, Link, ReceiveOutcome};
use crate::session::{SessionId, SessionInfo, SessionTable};
use crate::stats::{self, Statistics};

/// Why a session or neighbour was torn down.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Protocol violation by the peer.
    Misbehaving(&'static str),
    /// Too many inbound bandwidth violations.
    QuotaExceeded,
    /// A deadline expired.
    Timeout(&'static str),
    /// The blacklist forbade communication.
    Denied,
    /// A blacklist check lost its session mid-flight; deny without
    /// confirmation.
    CheckAborted,
    /// A signed payload had already expired.
    ClockSkew,
    /// Cryptographic verification failed.
    InvalidSignature,
    /// Recoverable carrier-level failure.
    SessionError(&'static str),
    /// The path was replaced by a better one.
    AddressSwitch,
    /// The remote closed gracefully.
    Remote,
    /// An operator or client asked for the disconnect.
    Command,
    /// Too many sessions or neighbours.
    ConnectionLimit,
}

impl DisconnectReason {
    /// Whether the reason may no longer apply after some time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::SessionError(_) | Self::ConnectionLimit
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::QuotaExceeded => write!(f, "inbound quota exceeded"),
            Self::Timeout(what) => write!(f, "timed out: {}", what),
            Self::Denied => write!(f, "blacklisted"),
            Self::CheckAborted => write!(f, "blacklist check aborted"),
            Self::ClockSkew => write!(f, "expired signature; check your clock"),
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::SessionError(err) => write!(f, "session error: {}", err),
            Self::AddressSwitch => write!(f, "superseded by a better path"),
            Self::Remote => write!(f, "closed by peer"),
            Self::Command => write!(f, "received external command"),
            Self::ConnectionLimit => write!(f, "connection limit reached"),
        }
    }
}

/// Configured limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum simultaneous neighbour records.
    pub neighbour_limit: usize,
    /// Maximum simultaneous carrier sessions.
    pub max_sessions: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            neighbour_limit: 50,
            max_sessions: 128,
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Validity interval of our own HELLO.
    pub hello_expiration: LocalDuration,
    /// Default inbound rate per neighbour, bytes/second.
    pub quota_in: u32,
    /// Default outbound rate per neighbour, bytes/second.
    pub quota_out: u32,
    /// Keepalive cadence on connected neighbours.
    pub keepalive_interval: LocalDuration,
    /// Idle cutoff for connected neighbours.
    pub idle_timeout: LocalDuration,
    /// Handshake cutoff.
    pub setup_timeout: LocalDuration,
    /// Static blacklist entries.
    pub static_blacklist: Vec<StaticEntry>,
    /// Topology policy.
    pub topology: TopologyConfig,
    /// Addresses to dial at startup.
    pub connect: Vec<Address>,
    /// Configured limits.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hello_expiration: hellomgr::DEFAULT_HELLO_EXPIRATION,
            quota_in: 64 * 1024,
            quota_out: 64 * 1024,
            keepalive_interval: neighbourmgr::KEEPALIVE_INTERVAL,
            idle_timeout: neighbourmgr::IDLE_TIMEOUT,
            setup_timeout: neighbourmgr::SETUP_TIMEOUT,
            static_blacklist: Vec::new(),
            topology: TopologyConfig::default(),
            connect: Vec::new(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Construct a configuration that dials the given addresses at startup.
    pub fn from(connect: Vec<Address>) -> Self {
        Self {
            connect,
            ..Self::default()
        }
    }
}

/// A command or request that can be sent to the protocol.
pub enum Command {
    /// Subscribe a client of the given kind.
    RegisterClient {
        /// Role of the client.
        kind: ClientKind,
        /// Channel notices are delivered on.
        sender: chan::Sender<ClientNotice>,
        /// Receives the assigned id.
        reply: chan::Sender<ClientId>,
    },
    /// Remove a client.
    UnregisterClient {
        /// The client to remove.
        client: ClientId,
    },
    /// Submit a payload for a peer.
    Send {
        /// Submitting client; receives the send outcome.
        client: ClientId,
        /// Destination peer.
        peer: PeerId,
        /// Opaque payload.
        payload: Vec<u8>,
        /// Higher goes out first.
        priority: u32,
        /// Fail the message after this long.
        timeout: LocalDuration,
    },
    /// Adjust a peer's inbound bandwidth allowance.
    SetQuota {
        /// The peer.
        peer: PeerId,
        /// New inbound rate, bytes/second.
        bandwidth_in: u32,
    },
    /// Convert a binary address into printable form; replies stream back to
    /// the client.
    AddressToString {
        /// Requesting client.
        client: ClientId,
        /// Carrier name.
        transport: String,
        /// Opaque address bytes.
        bytes: Vec<u8>,
        /// Skip name lookups.
        numeric_only: bool,
    },
    /// Subscribe to neighbour state, or take a one-shot snapshot.
    MonitorPeers {
        /// Requesting client.
        client: ClientId,
        /// A single peer, or all peers when `None`.
        peer: Option<PeerId>,
        /// Snapshot only; no ongoing updates.
        one_shot: bool,
    },
    /// A blacklist oracle's answer. `None` aborts the check.
    BlacklistReply {
        /// The answering oracle.
        client: ClientId,
        /// The peer the answer is about.
        peer: PeerId,
        /// The verdict.
        allowed: Option<bool>,
    },
    /// External scheduler suggestion: use this path with this bandwidth.
    UseAddress {
        /// The peer.
        peer: PeerId,
        /// Suggested address.
        address: Address,
        /// Live session for the address, when known.
        session: Option<SessionId>,
        /// Assigned inbound bandwidth, bytes/second.
        bandwidth_in: u32,
        /// Assigned outbound bandwidth, bytes/second.
        bandwidth_out: u32,
    },
    /// Traffic manipulation hook: pin a peer's observed latency.
    TrafficMetric {
        /// The peer.
        peer: PeerId,
        /// Latency to report, or `None` to restore measurements.
        latency: Option<LocalDuration>,
    },
    /// Snapshot the statistics counters.
    GetStatistics(chan::Sender<Vec<(String, u64)>>),
    /// Snapshot the neighbour table.
    GetNeighbours(chan::Sender<Vec<NeighbourInfo>>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegisterClient { kind, .. } => write!(f, "RegisterClient({:?})", kind),
            Self::UnregisterClient { client } => write!(f, "UnregisterClient({})", client),
            Self::Send { peer, payload, .. } => {
                write!(f, "Send({}, {} bytes)", peer, payload.len())
            }
            Self::SetQuota { peer, bandwidth_in } => {
                write!(f, "SetQuota({}, {})", peer, bandwidth_in)
            }
            Self::AddressToString { transport, .. } => {
                write!(f, "AddressToString({})", transport)
            }
            Self::MonitorPeers { peer, one_shot, .. } => {
                write!(f, "MonitorPeers({:?}, one_shot={})", peer, one_shot)
            }
            Self::BlacklistReply { peer, allowed, .. } => {
                write!(f, "BlacklistReply({}, {:?})", peer, allowed)
            }
            Self::UseAddress { peer, address, .. } => {
                write!(f, "UseAddress({}, {})", peer, address)
            }
            Self::TrafficMetric { peer, latency } => {
                write!(f, "TrafficMetric({}, {:?})", peer, latency)
            }
            Self::GetStatistics(_) => write!(f, "GetStatistics"),
            Self::GetNeighbours(_) => write!(f, "GetNeighbours"),
        }
    }
}

/// An instance of the transport protocol.
pub struct StateMachine<C> {
    /// Our key pair.
    identity: Rc<Identity>,
    /// Live carrier sessions.
    sessions: SessionTable,
    /// Own and peer HELLOs.
    hellomgr: HelloManager<C>,
    /// PING/PONG address validation.
    validator: ValidationManager<C>,
    /// Neighbour engine.
    neighbourmgr: NeighbourManager<C>,
    /// Blacklist pipeline.
    blacklistmgr: BlacklistManager,
    /// Connection topology and HELLO gossip.
    topologymgr: TopologyManager<C>,
    /// Scheduler adapter.
    atsmgr: AtsManager,
    /// Deferred session teardown.
    killq: KillQueue,
    /// Subscribed clients.
    clients: ClientRegistry,
    /// Statistics sink.
    stats: Statistics,
    /// Umbrella-level output queue.
    outbox: Outbox,
    clock: C,
    /// Addresses to dial at startup.
    connect: Vec<Address>,
    /// Session cap.
    max_sessions: usize,
}

impl<C: Clock> StateMachine<C> {
    /// Construct a new protocol instance.
    pub fn new(identity: Identity, config: Config, rng: fastrand::Rng, clock: C) -> Self {
        let Config {
            hello_expiration,
            quota_in,
            quota_out,
            keepalive_interval,
            idle_timeout,
            setup_timeout,
            static_blacklist,
            topology,
            connect,
            limits,
        } = config;

        let identity = Rc::new(identity);
        let hellomgr = HelloManager::new(
            hellomgr::Config { hello_expiration },
            identity.clone(),
            rng.clone(),
            clock.clone(),
        );
        let validator = ValidationManager::new(identity.clone(), rng.clone(), clock.clone());
        let neighbourmgr = NeighbourManager::new(
            neighbourmgr::Config {
                local_id: identity.peer_id(),
                neighbour_limit: limits.neighbour_limit,
                default_quota_in: quota_in,
                default_quota_out: quota_out,
                keepalive_interval,
                idle_timeout,
                setup_timeout,
            },
            rng.clone(),
            clock.clone(),
        );
        let blacklistmgr = BlacklistManager::new(static_blacklist);
        let topologymgr = TopologyManager::new(topology, rng.clone(), clock.clone());
        let atsmgr = AtsManager::new(
            atsmgr::Config {
                default_bandwidth_in: quota_in,
                default_bandwidth_out: quota_out,
            },
            rng.clone(),
        );

        Self {
            identity,
            sessions: SessionTable::new(),
            hellomgr,
            validator,
            neighbourmgr,
            blacklistmgr,
            topologymgr,
            atsmgr,
            killq: KillQueue::new(),
            clients: ClientRegistry::new(),
            stats: Statistics::new(),
            outbox: Outbox::new(),
            clock,
            connect,
            max_sessions: limits.max_sessions,
        }
    }

    /// Our peer identity.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// The statistics sink.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Our current self-description.
    pub fn own_hello(&self) -> Arc<switchyard_common::hello::Hello> {
        self.hellomgr.own_hello()
    }

    /// Initialize the state machine. Must be called once, with the current
    /// time.
    pub fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.hellomgr.initialize();
        self.neighbourmgr.initialize();
        self.topologymgr.initialize();

        for address in self.connect.drain(..).collect::<Vec<_>>() {
            self.outbox.connect(address);
        }
        self.outbox.event(Event::Ready { time });
    }

    /// Update the cached time.
    pub fn tick(&mut self, time: LocalTime) {
        self.clock.set(time);
    }

    /// Create a draining iterator over the protocol outputs.
    pub fn drain(&mut self) -> Box<dyn Iterator<Item = Io> + '_> {
        Box::new(std::iter::from_fn(|| self.next()))
    }

    fn connected_friends(&self) -> usize {
        self.neighbourmgr
            .connected()
            .filter(|(peer, _)| self.topologymgr.is_friend(peer))
            .count()
    }

    /// A carrier minted a new session. Returns `None` when the session is
    /// refused; the carrier must then close it immediately.
    pub fn session_started(
        &mut self,
        plugin: &str,
        address: Address,
        link: Link,
    ) -> Option<SessionId> {
        let peer = address.peer;
        if peer == self.identity.peer_id() {
            debug!(target: "p2p", "refusing session to ourselves");
            return None;
        }
        if self.sessions.len() >= self.max_sessions {
            warn!(target: "p2p", "{}: session limit reached, refusing", peer);
            return None;
        }
        if self
            .blacklistmgr
            .is_statically_denied(&peer, Some(&address.transport))
        {
            info!(target: "p2p", "{}: refusing session, statically blacklisted", peer);
            return None;
        }
        if !self.topologymgr.admits(&peer, self.connected_friends()) {
            info!(target: "p2p", "{}: refusing session, connection policy", peer);
            return None;
        }

        let session = self.sessions.insert(SessionInfo {
            plugin: plugin.to_owned(),
            peer,
            address: address.clone(),
            link,
            since: self.clock.local_time(),
        });
        debug!(target: "p2p", "{}: session {} started on {} ({})", peer, session, plugin, link);

        self.outbox.event(Event::SessionStarted {
            peer,
            session,
            address: address.clone(),
            link,
        });
        self.validator
            .session_started(peer, session, &self.sessions);
        if link.is_inbound() {
            // Ask the peer how it reaches us; the answer both validates the
            // session path and teaches us our externally visible address.
            self.validator
                .start_session_probe(peer, session, &self.sessions);
        }
        self.neighbourmgr.session_started(peer, session, &address);

        // Dynamic policy runs after the fact: the session exists and is
        // killed when an oracle objects.
        let oracles = self.clients.oracles();
        if !oracles.is_empty() && !self.blacklistmgr.has_pending(&peer, Some(session)) {
            self.blacklistmgr.check(
                peer,
                Some(address.transport),
                Some(session),
                CheckContext::SessionAdmission,
                oracles,
            );
        }
        Some(session)
    }

    /// A carrier is about to destroy a session. After this call the core
    /// never references the session again.
    pub fn session_ended(&mut self, session: SessionId) {
        self.killq.forget(session);
        let Some(info) = self.sessions.remove(session) else {
            return;
        };
        let peer = info.peer;
        debug!(target: "p2p", "{}: session {} ended", peer, session);

        self.outbox.event(Event::SessionEnded { peer, session });
        self.validator.session_ended(session);
        self.blacklistmgr.session_ended(session);

        let candidates: Vec<(Address, SessionId)> = self
            .atsmgr
            .candidates(&peer)
            .into_iter()
            .filter(|(_, s)| *s != session && self.sessions.get(*s).is_some())
            .collect();
        self.neighbourmgr.session_ended(session, &candidates);
    }

    /// A carrier announced or withdrew a local binding.
    pub fn address_changed(&mut self, change: AddressChange, address: OwnAddress) {
        self.hellomgr.address_changed(change, address);
    }

    /// Backpressure query from a carrier: how long to wait before reading
    /// again on this session.
    pub fn receive_delay(&self, session: SessionId) -> LocalDuration {
        self.sessions
            .get(session)
            .map(|info| self.neighbourmgr.receive_delay(&info.peer))
            .unwrap_or_default()
    }

    /// A message arrived on a session.
    pub fn message_received(&mut self, session: SessionId, message: Message) -> ReceiveOutcome {
        let Some(info) = self.sessions.get(session) else {
            debug!(target: "p2p", "message on unknown session {}, dropping", session);
            return ReceiveOutcome::dropped(LocalDuration::default());
        };
        let peer = info.peer;
        trace!(target: "p2p", "{}: received {} on {}", peer, message.cmd(), session);

        match message {
            Message::Hello(hello) => {
                if self.hellomgr.received_hello(hello).is_none() {
                    trace!(target: "p2p", "{}: hello taught us nothing", peer);
                }
            }
            Message::Ping(ping) => {
                match self.validator.received_ping(
                    peer,
                    session,
                    &ping,
                    &self.hellomgr,
                    &self.sessions,
                ) {
                    Ok(()) => self.stats.bump(stats::PINGS_ANSWERED, 1),
                    Err(reason) => {
                        self.stats.bump(stats::MALFORMED_DROPS, 1);
                        self.kill_session(session, reason);
                    }
                }
            }
            Message::Pong(pong) => match self.validator.received_pong(peer, &pong) {
                PongDisposition::Validated(_) => {
                    self.stats.bump(stats::PONGS_VERIFIED, 1);
                }
                PongDisposition::Discarded | PongDisposition::ClockSkew => {
                    self.stats.bump(stats::PONGS_DISCARDED, 1);
                }
            },
            Message::Syn { timestamp } => {
                if !self.topologymgr.admits(&peer, self.connected_friends()) {
                    info!(target: "p2p", "{}: refusing SYN, connection policy", peer);
                    self.kill_session(session, DisconnectReason::Denied);
                } else if !self.blacklistmgr.has_pending(&peer, Some(session)) {
                    let transport = self
                        .sessions
                        .get(session)
                        .map(|i| i.address.transport.clone());
                    // The handshake waits for the verdict; with no oracles
                    // registered the result is immediate.
                    self.blacklistmgr.check(
                        peer,
                        transport,
                        Some(session),
                        CheckContext::Handshake { timestamp },
                        self.clients.oracles(),
                    );
                }
            }
            Message::SynAck { timestamp } => {
                self.neighbourmgr.received_syn_ack(peer, session, timestamp);
            }
            Message::Ack => {
                self.neighbourmgr.received_ack(peer, session);
            }
            Message::Disconnect { timestamp } => {
                self.neighbourmgr.received_disconnect(peer, timestamp);
            }
            Message::Keepalive { nonce } => {
                self.neighbourmgr.received_keepalive(peer, session, nonce);
            }
            Message::KeepaliveResponse { nonce } => {
                self.neighbourmgr
                    .received_keepalive_response(peer, session, nonce);
            }
            Message::Quota { bandwidth } => {
                self.neighbourmgr.received_quota(peer, bandwidth);
            }
            Message::Payload(bytes) => {
                let outcome = self
                    .neighbourmgr
                    .payload_received(peer, session, Arc::new(bytes));
                if outcome.dropped {
                    self.stats.bump(stats::QUOTA_DROPS, 1);
                }
                return outcome;
            }
        }
        ReceiveOutcome::accepted()
    }

    fn kill_session(&mut self, session: SessionId, reason: DisconnectReason) {
        if self.sessions.get(session).is_some() && !self.killq.contains(session) {
            self.stats.bump(stats::SESSIONS_KILLED, 1);
            self.killq.enqueue(session, reason);
        }
    }

    /// Process a client command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::RegisterClient {
                kind,
                sender,
                reply,
            } => {
                let client = self.clients.register(kind, sender);
                match kind {
                    ClientKind::Core => {
                        let hello = self.hellomgr.own_hello();
                        self.clients.notify(client, ClientNotice::OwnHello(hello));
                    }
                    ClientKind::Blacklist => {
                        // Every existing neighbour is re-examined against
                        // the newcomer.
                        let neighbours: Vec<(PeerId, Option<SessionId>)> = self
                            .neighbourmgr
                            .infos(None)
                            .into_iter()
                            .map(|info| {
                                let session = info
                                    .address
                                    .as_ref()
                                    .and_then(|a| self.session_for(&info.peer, a));
                                (info.peer, session)
                            })
                            .collect();
                        for (peer, session) in neighbours {
                            self.blacklistmgr.check(
                                peer,
                                None,
                                session,
                                CheckContext::Recheck,
                                vec![client],
                            );
                        }
                    }
                    ClientKind::Monitor => {}
                }
                reply.send(client).ok();
            }
            Command::UnregisterClient { client } => {
                if self.clients.kind(client) == Some(ClientKind::Blacklist) {
                    self.blacklistmgr.oracle_gone(client);
                }
                self.clients.unregister(client);
            }
            Command::Send {
                client,
                peer,
                payload,
                priority,
                timeout,
            } => {
                if peer == self.identity.peer_id() {
                    self.clients.notify(
                        client,
                        ClientNotice::SendOk {
                            peer,
                            bytes_payload: payload.len() as u32,
                            bytes_on_wire: 0,
                            result: Err(SendError::NotConnected),
                        },
                    );
                    return;
                }
                let created = self
                    .neighbourmgr
                    .enqueue(client, peer, payload, priority, timeout);
                if created {
                    self.blacklistmgr.check(
                        peer,
                        None,
                        None,
                        CheckContext::Outbound,
                        self.clients.oracles(),
                    );
                }
                self.stats
                    .set(stats::BYTES_PENDING, self.neighbourmgr.pending_bytes());
            }
            Command::SetQuota { peer, bandwidth_in } => {
                self.neighbourmgr.set_quota_in(peer, bandwidth_in);
            }
            Command::AddressToString {
                client,
                transport,
                bytes,
                numeric_only,
            } => {
                match format_address(&transport, &bytes, numeric_only) {
                    Some(text) => {
                        self.clients.notify(
                            client,
                            ClientNotice::AddressToString {
                                status: ReplyStatus::Ok,
                                text: Some(text),
                            },
                        );
                    }
                    None => {
                        // This candidate failed; the stream stays open for
                        // the terminator.
                        self.clients.notify(
                            client,
                            ClientNotice::AddressToString {
                                status: ReplyStatus::Error,
                                text: None,
                            },
                        );
                    }
                }
                // An empty OK closes the stream.
                self.clients.notify(
                    client,
                    ClientNotice::AddressToString {
                        status: ReplyStatus::Ok,
                        text: None,
                    },
                );
            }
            Command::MonitorPeers {
                client,
                peer,
                one_shot,
            } => {
                for info in self.neighbourmgr.infos(peer) {
                    self.clients.notify(
                        client,
                        ClientNotice::MonitorPeer {
                            peer: info.peer,
                            address: info.address,
                            state: info.state,
                            state_timeout: info.state_timeout,
                        },
                    );
                }
                if one_shot {
                    self.clients.notify(client, ClientNotice::MonitorEnd);
                } else {
                    self.clients.subscribe_monitor(client, peer);
                }
            }
            Command::BlacklistReply {
                client,
                peer,
                allowed,
            } => {
                self.blacklistmgr.reply(client, peer, allowed);
            }
            Command::UseAddress {
                peer,
                address,
                session,
                bandwidth_in,
                bandwidth_out,
            } => {
                self.neighbourmgr.use_address(
                    peer,
                    address,
                    session,
                    bandwidth_in,
                    bandwidth_out,
                    &self.sessions,
                );
            }
            Command::TrafficMetric { peer, latency } => {
                self.atsmgr.set_latency(peer, latency);
            }
            Command::GetStatistics(reply) => {
                self.sync_gauges();
                reply.send(self.stats.snapshot()).ok();
            }
            Command::GetNeighbours(reply) => {
                reply.send(self.neighbourmgr.infos(None)).ok();
            }
        }
    }

    fn session_for(&self, peer: &PeerId, address: &Address) -> Option<SessionId> {
        self.sessions
            .by_peer(peer)
            .find(|(_, info)| info.address.endpoint() == address.endpoint())
            .map(|(id, _)| id)
    }

    fn sync_gauges(&mut self) {
        self.stats.set(
            stats::VALIDATED_ADDRESSES,
            self.validator.validated_count() as u64,
        );
        self.stats
            .set(stats::BYTES_PENDING, self.neighbourmgr.pending_bytes());
        self.stats.set(
            stats::CONNECTED_NEIGHBOURS,
            self.neighbourmgr.connected().count() as u64,
        );
    }

    /// Propagate an event internally and to the subscribed clients.
    pub fn event(&mut self, event: Event) {
        self.atsmgr.received_event(&event);
        self.topologymgr.received_event(&event);

        match event {
            Event::OwnHelloChanged { hello } => {
                self.clients
                    .broadcast_core(ClientNotice::OwnHello(hello.clone()));
                // Connected neighbours hear about our new addresses right
                // away.
                let connected: Vec<SessionId> = self
                    .neighbourmgr
                    .connected()
                    .filter_map(|(_, session)| session)
                    .collect();
                for session in connected {
                    self.outbox
                        .message(session, Message::Hello((*hello).clone()));
                }
            }
            Event::ExternalAddressLearned { address } => {
                self.hellomgr.external_address_confirmed(address);
            }
            Event::HelloDiscovered { peer, hello } => {
                let now = self.clock.local_time();
                let addresses: Vec<(String, Vec<u8>)> = hello
                    .live_addresses(now)
                    .map(|a| (a.transport.clone(), a.bytes.clone()))
                    .collect();
                for (transport, bytes) in addresses {
                    let session = self
                        .sessions
                        .by_peer(&peer)
                        .find(|(_, info)| {
                            info.address.transport == transport && info.address.bytes == bytes
                        })
                        .map(|(id, _)| id);
                    self.validator
                        .start(peer, &transport, &bytes, session, &self.sessions);
                }
            }
            Event::AddressValidated { peer, .. } | Event::AddressInvalidated { peer, .. } => {
                self.stats.set(
                    stats::VALIDATED_ADDRESSES,
                    self.validator.validated_count() as u64,
                );
                // A neighbour stuck waiting for a path can now be served.
                if self.neighbourmgr.state_of(&peer) == Some(NeighbourState::InitAts) {
                    self.outbox.event(Event::AddressRequested { peer });
                }
            }
            Event::AddressSuggested {
                peer,
                address,
                session,
                bandwidth_in,
                bandwidth_out,
            } => {
                self.neighbourmgr.use_address(
                    peer,
                    address,
                    session,
                    bandwidth_in,
                    bandwidth_out,
                    &self.sessions,
                );
            }
            Event::NeighbourStateChanged {
                peer,
                state,
                timeout,
            } => {
                let address = self
                    .neighbourmgr
                    .infos(Some(peer))
                    .into_iter()
                    .next()
                    .and_then(|info| info.address);
                for client in self.clients.monitors_of(&peer) {
                    self.clients.notify(
                        client,
                        ClientNotice::MonitorPeer {
                            peer,
                            address: address.clone(),
                            state,
                            state_timeout: timeout,
                        },
                    );
                }
            }
            Event::NeighbourConnected {
                peer,
                bandwidth_in,
                bandwidth_out,
                ..
            } => {
                self.clients.broadcast_core(ClientNotice::Connected {
                    peer,
                    bandwidth_in,
                    bandwidth_out,
                });
                self.stats.set(
                    stats::CONNECTED_NEIGHBOURS,
                    self.neighbourmgr.connected().count() as u64,
                );
            }
            Event::NeighbourDisconnected { peer, ref reason } => {
                self.clients
                    .broadcast_core(ClientNotice::Disconnected { peer });
                if matches!(reason, DisconnectReason::Timeout(_)) {
                    self.stats.bump(stats::TIMEOUT_DISCONNECTS, 1);
                }
                self.stats.set(
                    stats::CONNECTED_NEIGHBOURS,
                    self.neighbourmgr.connected().count() as u64,
                );
            }
            Event::PayloadReceived { peer, payload } => {
                self.clients
                    .broadcast_core(ClientNotice::Recv { peer, payload });
            }
            Event::SendCompleted {
                client,
                peer,
                bytes_payload,
                bytes_on_wire,
                result,
            } => {
                self.clients.notify(
                    client,
                    ClientNotice::SendOk {
                        peer,
                        bytes_payload,
                        bytes_on_wire,
                        result,
                    },
                );
                self.stats
                    .set(stats::BYTES_PENDING, self.neighbourmgr.pending_bytes());
            }
            Event::QuotaViolation { .. } => {
                self.stats.bump(stats::QUOTA_VIOLATIONS, 1);
            }
            Event::HelloAdvertised { .. } => {
                self.stats.bump(stats::HELLOS_ADVERTISED, 1);
            }
            Event::BlacklistQuery { oracle, peer } => {
                if !self
                    .clients
                    .notify(oracle, ClientNotice::BlacklistQuery { peer })
                {
                    // The oracle is gone; its open queries move on.
                    self.blacklistmgr.oracle_gone(oracle);
                }
            }
            Event::BlacklistResult {
                peer,
                session,
                context,
                outcome,
            } => {
                self.blacklist_concluded(peer, session, context, outcome);
            }
            _ => {}
        }
    }

    /// Run the continuation of a concluded blacklist check.
    fn blacklist_concluded(
        &mut self,
        peer: PeerId,
        session: Option<SessionId>,
        context: CheckContext,
        outcome: CheckOutcome,
    ) {
        let reason = match outcome {
            CheckOutcome::Allowed => None,
            CheckOutcome::Denied => Some(DisconnectReason::Denied),
            CheckOutcome::Aborted => Some(DisconnectReason::CheckAborted),
        };

        match context {
            CheckContext::SessionAdmission => {
                if let (Some(session), Some(reason)) = (session, reason) {
                    self.kill_session(session, reason);
                }
            }
            CheckContext::Handshake { timestamp } => match reason {
                None => {
                    if let Some(session) = session {
                        if self.sessions.get(session).is_some() {
                            if let Err(err) = self.neighbourmgr.received_syn(
                                peer,
                                session,
                                timestamp,
                                &self.sessions,
                            ) {
                                self.kill_session(session, err);
                            }
                        }
                    }
                }
                Some(reason) => {
                    if let Some(session) = session {
                        self.kill_session(session, reason.clone());
                    }
                    if self.neighbourmgr.contains(&peer) {
                        self.neighbourmgr.disconnect(peer, reason);
                    }
                }
            },
            CheckContext::Outbound => match outcome {
                CheckOutcome::Allowed => self.neighbourmgr.set_cleared(peer, true),
                CheckOutcome::Denied => self.neighbourmgr.set_cleared(peer, false),
                CheckOutcome::Aborted => self
                    .neighbourmgr
                    .disconnect(peer, DisconnectReason::CheckAborted),
            },
            CheckContext::Recheck => {
                if let Some(reason) = reason {
                    if let Some(session) = session {
                        self.kill_session(session, reason.clone());
                    }
                    if self.neighbourmgr.contains(&peer) {
                        self.neighbourmgr.disconnect(peer, reason);
                    }
                }
            }
        }
    }

    /// A timer set earlier fired.
    pub fn timer_expired(&mut self) {
        trace!(target: "p2p", "Timer expired");

        self.neighbourmgr.timer_expired();

        let mut connected: HashSet<PeerId> =
            HashSet::with_hasher(fastrand::Rng::with_seed(0).into());
        connected.extend(self.neighbourmgr.connected().map(|(peer, _)| peer));
        self.validator
            .timer_expired(&|peer| connected.contains(peer), &self.sessions);
        self.hellomgr.timer_expired();

        let connected_sessions: Vec<(PeerId, Option<SessionId>)> =
            self.neighbourmgr.connected().collect();
        let friends = self.connected_friends();
        self.topologymgr
            .timer_expired(&self.hellomgr, &connected_sessions, friends);

        self.sync_gauges();
    }
}

impl<C: Clock> Iterator for StateMachine<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        loop {
            if !self.killq.is_empty() {
                self.killq.drain(&mut self.outbox);
            }
            let next = self
                .outbox
                .next()
                .or_else(|| self.neighbourmgr.next())
                .or_else(|| self.validator.next())
                .or_else(|| self.hellomgr.next())
                .or_else(|| self.blacklistmgr.next())
                .or_else(|| self.atsmgr.next())
                .or_else(|| self.topologymgr.next());

            match next? {
                Io::Event(event) => {
                    self.event(event.clone());

                    return Some(Io::Event(event));
                }
                Io::Write(session, message) => {
                    // Never hand a carrier a message for a session it has
                    // already torn down.
                    if self.sessions.get(session).is_some() {
                        return Some(Io::Write(session, message));
                    }
                    trace!(target: "p2p", "dropping write to dead session {}", session);
                }
                Io::Disconnect(session, reason) => {
                    if self.sessions.get(session).is_some() {
                        return Some(Io::Disconnect(session, reason));
                    }
                }
                other => return Some(other),
            }
        }
    }
}

/// Best-effort printable rendering of a carrier address.
fn format_address(transport: &str, bytes: &[u8], numeric_only: bool) -> Option<String> {
    match (transport, bytes.len()) {
        // Four address octets and a big-endian port.
        ("tcp" | "udp", 6) => Some(format!(
            "{}:{}.{}.{}.{}:{}",
            transport,
            bytes[0],
            bytes[1],
            bytes[2],
            bytes[3],
            u16::from_be_bytes([bytes[4], bytes[5]])
        )),
        ("unix", _) if !numeric_only => std::str::from_utf8(bytes)
            .ok()
            .map(|path| format!("{}:{}", transport, path)),
        _ if numeric_only => {
            let mut hex = String::with_capacity(bytes.len() * 2);
            for byte in bytes {
                hex.push_str(&format!("{:02x}", byte));
            }
            Some(format!("{}:{}", transport, hex))
        }
        _ => None,
    }
}
