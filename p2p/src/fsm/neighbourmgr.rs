//! The neighbour engine.
//!
//! One logical neighbour per remote peer, composed from possibly many
//! concrete sessions. Runs the symmetric three-way handshake, keeps the
//! outbound message queue, tracks inbound bandwidth and emits keepalives.
use std::collections::VecDeque;
use std::sync::Arc;

use log::*;

use switchyard_common::address::Address;
use switchyard_common::collections::HashMap;
use switchyard_common::identity::PeerId;
use switchyard_common::time::{Clock, LocalDuration, LocalTime};

use super::output::{Io, Outbox};
use super::quota::{QuotaOutcome, QuotaTracker, VIOLATION_THRESHOLD};
use super::{DisconnectReason, Event};
use crate::client::{ClientId, SendError};
use crate::message::Message;
use crate::plugin::ReceiveOutcome;
use crate::session::{SessionId, SessionTable};

/// Cadence of keepalive probes on a connected neighbour.
pub const KEEPALIVE_INTERVAL: LocalDuration = LocalDuration::from_secs(5);
/// A neighbour with no traffic for this long is dead.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// How long a handshake may take before we give up.
pub const SETUP_TIMEOUT: LocalDuration = LocalDuration::from_secs(15);
/// First SYN retransmit delay; doubled per attempt.
pub const RETRANSMIT_MIN: LocalDuration = LocalDuration::from_secs(1);
/// Retransmit backoff cap.
pub const RETRANSMIT_MAX: LocalDuration = LocalDuration::from_secs(8);
/// SYN (or SYN-ACK) transmissions before giving up.
pub const MAX_HANDSHAKE_ATTEMPTS: u32 = 5;
/// Housekeeping granularity.
const TICK: LocalDuration = LocalDuration::from_secs(1);

/// Neighbour lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NeighbourState {
    /// Record exists but no connection activity yet.
    NotConnected,
    /// Waiting for the scheduler to suggest a path.
    InitAts,
    /// SYN sent, awaiting SYN-ACK.
    SynSent,
    /// Inbound SYN answered with SYN-ACK, awaiting ACK.
    SynAckSent,
    /// ACK emitted; momentary on the way to connected.
    AckSent,
    /// Fully connected.
    Connected,
    /// Terminal; the record is reaped on the next sweep.
    Disconnect,
}

impl std::fmt::Display for NeighbourState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not-connected"),
            Self::InitAts => write!(f, "wait-scheduler"),
            Self::SynSent => write!(f, "syn-sent"),
            Self::SynAckSent => write!(f, "syn-ack-sent"),
            Self::AckSent => write!(f, "ack-sent"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Monitor-facing snapshot of one neighbour.
#[derive(Debug, Clone)]
pub struct NeighbourInfo {
    /// The peer.
    pub peer: PeerId,
    /// Current state.
    pub state: NeighbourState,
    /// Primary address, when one is selected.
    pub address: Option<Address>,
    /// When the current state times out by itself.
    pub state_timeout: LocalTime,
    /// Assigned inbound bandwidth, bytes/second.
    pub bandwidth_in: u32,
    /// Assigned outbound bandwidth, bytes/second.
    pub bandwidth_out: u32,
}

/// Neighbour engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our identity, for the simultaneous-connect tie-break.
    pub local_id: PeerId,
    /// Hard cap on simultaneous neighbour records.
    pub neighbour_limit: usize,
    /// Default inbound rate granted to new neighbours, bytes/second.
    pub default_quota_in: u32,
    /// Default outbound rate assumed for new neighbours, bytes/second.
    pub default_quota_out: u32,
    /// Keepalive cadence.
    pub keepalive_interval: LocalDuration,
    /// Idle cutoff.
    pub idle_timeout: LocalDuration,
    /// Handshake cutoff.
    pub setup_timeout: LocalDuration,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    priority: u32,
    deadline: LocalTime,
    client: ClientId,
}

#[derive(Debug, Copy, Clone)]
struct Probe {
    session: SessionId,
    nonce: u32,
    sent_at: LocalTime,
}

#[derive(Debug)]
struct Neighbour {
    peer: PeerId,
    state: NeighbourState,
    /// Blacklist clearance: `None` while the check is in flight.
    cleared: Option<bool>,
    /// The path used for sending. The session half is `None` while a dial
    /// is outstanding.
    primary: Option<(Address, Option<SessionId>)>,
    /// Armed soft-switch target; promoted once a keepalive answers on it.
    alternate: Option<(Address, SessionId)>,
    queue: VecDeque<QueuedMessage>,
    quota: QuotaTracker,
    bandwidth_in: u32,
    bandwidth_out: u32,
    /// Timestamp identifying the connection attempt (ours on outbound,
    /// theirs on inbound).
    connect_ts: LocalTime,
    attempts: u32,
    next_retransmit: LocalTime,
    backoff: LocalDuration,
    state_deadline: LocalTime,
    last_received: LocalTime,
    last_keepalive: LocalTime,
    probe: Option<Probe>,
    /// The peer's advertised inbound allowance for us, bytes/second.
    quota_out: u32,
}

impl Neighbour {
    fn primary_session(&self) -> Option<SessionId> {
        self.primary.as_ref().and_then(|(_, s)| *s)
    }

    fn primary_address(&self) -> Option<&Address> {
        self.primary.as_ref().map(|(a, _)| a)
    }
}

/// Manages the per-peer neighbour records.
pub struct NeighbourManager<C> {
    /// Engine configuration.
    pub config: Config,
    neighbours: HashMap<PeerId, Neighbour>,
    outbox: Outbox,
    rng: fastrand::Rng,
    clock: C,
    last_idle: Option<LocalTime>,
}

impl<C: Clock> NeighbourManager<C> {
    /// Create a new neighbour engine.
    pub fn new(config: Config, rng: fastrand::Rng, clock: C) -> Self {
        Self {
            config,
            neighbours: HashMap::with_hasher(rng.clone().into()),
            outbox: Outbox::new(),
            rng,
            clock,
            last_idle: None,
        }
    }

    /// Initialize; arms the housekeeping timer.
    pub fn initialize(&mut self) {
        self.outbox.set_timer(TICK);
    }

    /// Drain the next output.
    pub fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }

    fn transition(&mut self, peer: PeerId, state: NeighbourState, deadline: LocalTime) {
        if let Some(n) = self.neighbours.get_mut(&peer) {
            if n.state == state {
                return;
            }
            debug!(target: "p2p", "{}: {} -> {}", peer, n.state, state);
            n.state = state;
            n.state_deadline = deadline;
            self.outbox.event(Event::NeighbourStateChanged {
                peer,
                state,
                timeout: deadline,
            });
        }
    }

    /// Whether a record exists for this peer.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.neighbours.contains_key(peer)
    }

    /// Whether the peer is fully connected.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.neighbours
            .get(peer)
            .map_or(false, |n| n.state == NeighbourState::Connected)
    }

    /// The peer's current state, if a record exists.
    pub fn state_of(&self, peer: &PeerId) -> Option<NeighbourState> {
        self.neighbours.get(peer).map(|n| n.state)
    }

    /// Connected peers and their primary sessions.
    pub fn connected(&self) -> impl Iterator<Item = (PeerId, Option<SessionId>)> + '_ {
        self.neighbours
            .values()
            .filter(|n| n.state == NeighbourState::Connected)
            .map(|n| (n.peer, n.primary_session()))
    }

    /// Number of neighbour records.
    pub fn len(&self) -> usize {
        self.neighbours.len()
    }

    /// Whether there are no neighbours.
    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }

    /// Monitor-facing snapshots. With `Some(peer)`, only that peer.
    pub fn infos(&self, peer: Option<PeerId>) -> Vec<NeighbourInfo> {
        self.neighbours
            .values()
            .filter(|n| peer.map_or(true, |p| n.peer == p))
            .map(|n| NeighbourInfo {
                peer: n.peer,
                state: n.state,
                address: n.primary_address().cloned(),
                state_timeout: n.state_deadline,
                bandwidth_in: n.bandwidth_in,
                bandwidth_out: n.bandwidth_out,
            })
            .collect()
    }

    /// Bytes queued across all neighbours, not yet handed to a carrier.
    pub fn pending_bytes(&self) -> u64 {
        self.neighbours
            .values()
            .flat_map(|n| n.queue.iter())
            .map(|m| m.payload.len() as u64)
            .sum()
    }

    fn make_neighbour(&mut self, peer: PeerId) -> &mut Neighbour {
        let now = self.clock.local_time();
        let config = &self.config;

        self.neighbours.entry(peer).or_insert_with(|| Neighbour {
            peer,
            state: NeighbourState::NotConnected,
            cleared: None,
            primary: None,
            alternate: None,
            queue: VecDeque::new(),
            quota: QuotaTracker::new(config.default_quota_in, now),
            bandwidth_in: config.default_quota_in,
            bandwidth_out: config.default_quota_out,
            connect_ts: now,
            attempts: 0,
            next_retransmit: now,
            backoff: RETRANSMIT_MIN,
            state_deadline: now + config.setup_timeout,
            last_received: now,
            last_keepalive: now,
            probe: None,
            quota_out: config.default_quota_out,
        })
    }

    /// Queue a message for a peer, creating the neighbour when necessary.
    /// Returns `true` when a new record was created (the caller gates it
    /// through the blacklist pipeline).
    pub fn enqueue(
        &mut self,
        client: ClientId,
        peer: PeerId,
        payload: Vec<u8>,
        priority: u32,
        timeout: LocalDuration,
    ) -> bool {
        let now = self.clock.local_time();

        if !self.neighbours.contains_key(&peer) && self.neighbours.len() >= self.config.neighbour_limit
        {
            warn!(target: "p2p", "{}: neighbour limit reached, rejecting send", peer);
            self.outbox.event(Event::SendCompleted {
                client,
                peer,
                bytes_payload: payload.len() as u32,
                bytes_on_wire: 0,
                result: Err(SendError::NotConnected),
            });
            return false;
        }

        let created = !self.neighbours.contains_key(&peer);
        let message = QueuedMessage {
            priority,
            deadline: now + timeout,
            client,
            payload,
        };
        let neighbour = self.make_neighbour(peer);

        if neighbour.state == NeighbourState::Disconnect {
            self.outbox.event(Event::SendCompleted {
                client,
                peer,
                bytes_payload: message.payload.len() as u32,
                bytes_on_wire: 0,
                result: Err(SendError::NotConnected),
            });
            return false;
        }

        // Priority order, FIFO among equals.
        let pos = neighbour
            .queue
            .iter()
            .position(|m| m.priority < message.priority)
            .unwrap_or(neighbour.queue.len());
        neighbour.queue.insert(pos, message);

        if created {
            let deadline = now + self.config.setup_timeout;
            self.transition(peer, NeighbourState::InitAts, deadline);
        } else {
            self.dispatch(peer, &[]);
        }
        created
    }

    /// Outcome of the blacklist gate for a newly created neighbour.
    pub fn set_cleared(&mut self, peer: PeerId, allowed: bool) {
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        neighbour.cleared = Some(allowed);

        if allowed {
            // Now the scheduler may propose a path.
            self.outbox.event(Event::AddressRequested { peer });
        } else {
            self.disconnect(peer, DisconnectReason::Denied);
        }
    }

    /// The scheduler proposed a path for a peer.
    pub fn use_address(
        &mut self,
        peer: PeerId,
        address: Address,
        session: Option<SessionId>,
        bandwidth_in: u32,
        bandwidth_out: u32,
        sessions: &SessionTable,
    ) {
        enum Action {
            Nothing,
            Syn(SessionId),
            Dial(Address),
            Probe(SessionId, u32),
        }

        let now = self.clock.local_time();
        let session = session.filter(|s| sessions.get(*s).is_some());
        let nonce = self.rng.u32(..);
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        neighbour.bandwidth_in = bandwidth_in;
        neighbour.bandwidth_out = bandwidth_out;
        neighbour.quota.set_rate(bandwidth_in, now);

        let action = match neighbour.state {
            NeighbourState::NotConnected | NeighbourState::InitAts => {
                if neighbour.cleared != Some(true) {
                    Action::Nothing
                } else {
                    match session {
                        Some(session) => {
                            neighbour.primary = Some((address, Some(session)));
                            neighbour.connect_ts = now;
                            neighbour.attempts = 1;
                            neighbour.backoff = RETRANSMIT_MIN;
                            neighbour.next_retransmit = now + RETRANSMIT_MIN;
                            Action::Syn(session)
                        }
                        None => {
                            // No live session yet: ask the carriers to dial
                            // and hold the address until one appears.
                            neighbour.primary = Some((address.clone(), None));
                            Action::Dial(address)
                        }
                    }
                }
            }
            NeighbourState::SynSent | NeighbourState::SynAckSent => {
                if let Some(session) = session {
                    neighbour.primary = Some((address, Some(session)));
                }
                Action::Nothing
            }
            NeighbourState::Connected => match session {
                Some(session) if neighbour.primary_session() != Some(session) => {
                    // Soft switch: arm the new path and probe it; the old
                    // path stays until the probe answers.
                    neighbour.alternate = Some((address, session));
                    neighbour.probe = Some(Probe {
                        session,
                        nonce,
                        sent_at: now,
                    });
                    Action::Probe(session, nonce)
                }
                _ => Action::Nothing,
            },
            NeighbourState::AckSent | NeighbourState::Disconnect => Action::Nothing,
        };

        match action {
            Action::Nothing => {}
            Action::Syn(session) => {
                self.outbox
                    .message(session, Message::Syn { timestamp: now });
                self.transition(
                    peer,
                    NeighbourState::SynSent,
                    now + self.config.setup_timeout,
                );
                self.outbox.set_timer(RETRANSMIT_MIN);
            }
            Action::Dial(address) => {
                self.outbox.connect(address);
            }
            Action::Probe(session, nonce) => {
                debug!(target: "p2p", "{}: arming path switch to {}", peer, session);
                self.outbox.message(session, Message::Keepalive { nonce });
            }
        }
    }

    /// A session for a dial we requested appeared; bind it when a neighbour
    /// was waiting on that endpoint.
    pub fn session_started(&mut self, peer: PeerId, session: SessionId, address: &Address) {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        let waiting = matches!(
            (&neighbour.primary, neighbour.state),
            (Some((a, None)), NeighbourState::InitAts | NeighbourState::NotConnected)
                if a.endpoint() == address.endpoint()
        );
        if !waiting || neighbour.cleared != Some(true) {
            return;
        }
        neighbour.primary = Some((address.clone(), Some(session)));
        neighbour.connect_ts = now;
        neighbour.attempts = 1;
        neighbour.backoff = RETRANSMIT_MIN;
        neighbour.next_retransmit = now + RETRANSMIT_MIN;

        self.outbox.message(session, Message::Syn { timestamp: now });
        self.transition(peer, NeighbourState::SynSent, now + self.config.setup_timeout);
        self.outbox.set_timer(RETRANSMIT_MIN);
    }

    /// An inbound SYN, already cleared by the blacklist pipeline.
    pub fn received_syn(
        &mut self,
        peer: PeerId,
        session: SessionId,
        timestamp: LocalTime,
        sessions: &SessionTable,
    ) -> Result<(), DisconnectReason> {
        let now = self.clock.local_time();
        let Some(info) = sessions.get(session) else {
            return Ok(());
        };
        let address = info.address.clone();

        if !self.neighbours.contains_key(&peer) {
            if self.neighbours.len() >= self.config.neighbour_limit {
                return Err(DisconnectReason::ConnectionLimit);
            }
            let neighbour = self.make_neighbour(peer);
            neighbour.cleared = Some(true);
        }

        let state = self.neighbours[&peer].state;
        match state {
            NeighbourState::NotConnected | NeighbourState::InitAts => {
                self.accept_syn(peer, session, address, timestamp);
            }
            NeighbourState::SynSent => {
                // Simultaneous connect: the lexically smaller peer's SYN is
                // canonical on both sides.
                if peer < self.config.local_id {
                    debug!(target: "p2p", "{}: simultaneous SYN, peer wins tie-break", peer);
                    self.accept_syn(peer, session, address, timestamp);
                } else {
                    debug!(target: "p2p", "{}: simultaneous SYN, our SYN is canonical", peer);
                }
            }
            NeighbourState::SynAckSent => {
                // Duplicate SYN: answer again.
                let ts = self.neighbours[&peer].connect_ts;
                if ts == timestamp {
                    self.outbox.message(session, Message::SynAck { timestamp });
                }
            }
            NeighbourState::Connected => {
                // The peer restarted the handshake; acknowledge the newer
                // attempt and keep the neighbour up.
                if timestamp > self.neighbours[&peer].connect_ts {
                    if let Some(n) = self.neighbours.get_mut(&peer) {
                        n.connect_ts = timestamp;
                        n.primary = Some((address, Some(session)));
                    }
                    self.outbox.message(session, Message::SynAck { timestamp });
                }
            }
            NeighbourState::AckSent | NeighbourState::Disconnect => {}
        }
        Ok(())
    }

    fn accept_syn(
        &mut self,
        peer: PeerId,
        session: SessionId,
        address: Address,
        timestamp: LocalTime,
    ) {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        neighbour.primary = Some((address, Some(session)));
        neighbour.connect_ts = timestamp;
        neighbour.attempts = 1;
        neighbour.backoff = RETRANSMIT_MIN;
        neighbour.next_retransmit = now + RETRANSMIT_MIN;
        neighbour.last_received = now;

        self.outbox.message(session, Message::SynAck { timestamp });
        self.transition(
            peer,
            NeighbourState::SynAckSent,
            now + self.config.setup_timeout,
        );
        self.outbox.set_timer(RETRANSMIT_MIN);
    }

    /// A SYN-ACK answering our SYN.
    pub fn received_syn_ack(&mut self, peer: PeerId, session: SessionId, timestamp: LocalTime) {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };

        match neighbour.state {
            NeighbourState::SynSent => {
                if neighbour.connect_ts != timestamp {
                    debug!(target: "p2p", "{}: SYN-ACK for a stale SYN, ignoring", peer);
                    return;
                }
                neighbour.last_received = now;
                // Adopt the session the answer arrived on if our dial never
                // produced one.
                if neighbour.primary_session().is_none() {
                    if let Some((address, _)) = neighbour.primary.clone() {
                        neighbour.primary = Some((address, Some(session)));
                    }
                }
                self.outbox.message(session, Message::Ack);
                // The ACK completes the handshake on our side; the
                // intermediate state is observable but never rested in.
                let deadline = now + self.config.idle_timeout;
                self.transition(peer, NeighbourState::AckSent, deadline);
                self.establish(peer, session);
            }
            NeighbourState::Connected => {
                // Duplicate SYN-ACK; our ACK was lost.
                if neighbour.connect_ts == timestamp {
                    self.outbox.message(session, Message::Ack);
                }
            }
            _ => {
                debug!(target: "p2p", "{}: unexpected SYN-ACK in {}", peer, neighbour.state);
            }
        }
    }

    /// An ACK completing an inbound handshake.
    pub fn received_ack(&mut self, peer: PeerId, session: SessionId) {
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        match neighbour.state {
            NeighbourState::SynAckSent => {
                neighbour.last_received = self.clock.local_time();
                self.establish(peer, session);
            }
            NeighbourState::Connected => {}
            _ => {
                debug!(target: "p2p", "{}: unexpected ACK in {}", peer, neighbour.state);
            }
        }
    }

    fn establish(&mut self, peer: PeerId, session: SessionId) {
        let now = self.clock.local_time();
        let deadline = now + self.config.idle_timeout;
        self.transition(peer, NeighbourState::Connected, deadline);

        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        neighbour.last_keepalive = now;
        let (bandwidth_in, bandwidth_out) = (neighbour.bandwidth_in, neighbour.bandwidth_out);

        // Tell the peer how fast it may send to us.
        self.outbox.message(
            session,
            Message::Quota {
                bandwidth: bandwidth_in,
            },
        );
        self.outbox.event(Event::NeighbourConnected {
            peer,
            session,
            bandwidth_in,
            bandwidth_out,
        });
        self.outbox.set_timer(self.config.keepalive_interval);
        self.dispatch(peer, &[]);
    }

    /// A graceful close from the peer.
    pub fn received_disconnect(&mut self, peer: PeerId, timestamp: LocalTime) {
        let Some(neighbour) = self.neighbours.get(&peer) else {
            return;
        };
        if timestamp < neighbour.connect_ts {
            debug!(target: "p2p", "{}: stale disconnect, ignoring", peer);
            return;
        }
        self.disconnect(peer, DisconnectReason::Remote);
    }

    /// A keepalive probe from the peer; answer on the same session.
    pub fn received_keepalive(&mut self, peer: PeerId, session: SessionId, nonce: u32) {
        let now = self.clock.local_time();
        if let Some(neighbour) = self.neighbours.get_mut(&peer) {
            neighbour.last_received = now;
            if neighbour.state == NeighbourState::Connected {
                neighbour.state_deadline = now + self.config.idle_timeout;
            }
        }
        self.outbox
            .message(session, Message::KeepaliveResponse { nonce });
    }

    /// A keepalive answer; yields an RTT sample and may complete a path
    /// switch.
    pub fn received_keepalive_response(&mut self, peer: PeerId, session: SessionId, nonce: u32) {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        let Some(probe) = neighbour.probe else {
            debug!(target: "p2p", "{}: unsolicited keepalive response", peer);
            return;
        };
        if probe.nonce != nonce || probe.session != session {
            debug!(target: "p2p", "{}: keepalive response does not match probe", peer);
            return;
        }
        neighbour.probe = None;
        neighbour.last_received = now;
        if neighbour.state == NeighbourState::Connected {
            neighbour.state_deadline = now + self.config.idle_timeout;
        }
        let latency = now.duration_since(probe.sent_at);

        // A probe answered on the armed alternate completes the switch.
        let mut released = None;
        if let Some((address, alt_session)) = neighbour.alternate.clone() {
            if alt_session == session {
                released = neighbour.primary_session().filter(|s| *s != session);
                info!(target: "p2p", "{}: switched to {}", peer, address);
                neighbour.primary = Some((address, Some(session)));
                neighbour.alternate = None;
            }
        }
        self.outbox.event(Event::RttMeasured {
            peer,
            session,
            latency,
        });
        if let Some(old) = released {
            self.outbox.disconnect(old, DisconnectReason::AddressSwitch);
        }
    }

    /// The peer advertised how fast we may send to it.
    pub fn received_quota(&mut self, peer: PeerId, bandwidth: u32) {
        if let Some(neighbour) = self.neighbours.get_mut(&peer) {
            neighbour.quota_out = bandwidth;
        }
    }

    /// A client adjusted the peer's inbound allowance.
    pub fn set_quota_in(&mut self, peer: PeerId, bandwidth: u32) {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        neighbour.bandwidth_in = bandwidth;
        neighbour.quota.set_rate(bandwidth, now);

        if let Some(session) = neighbour.primary_session() {
            self.outbox.message(session, Message::Quota { bandwidth });
        }
    }

    /// Inbound payload. Runs the quota tracker and, if within bounds,
    /// publishes the payload.
    pub fn payload_received(
        &mut self,
        peer: PeerId,
        _session: SessionId,
        payload: Arc<Vec<u8>>,
    ) -> ReceiveOutcome {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            debug!(target: "p2p", "{}: payload from unknown neighbour, dropping", peer);
            return ReceiveOutcome::dropped(LocalDuration::default());
        };
        if neighbour.state != NeighbourState::Connected {
            debug!(target: "p2p", "{}: payload while {}, dropping", peer, neighbour.state);
            return ReceiveOutcome::dropped(LocalDuration::default());
        }
        neighbour.last_received = now;
        neighbour.state_deadline = now + self.config.idle_timeout;

        match neighbour.quota.receive(payload.len() as u32, now) {
            QuotaOutcome::Accepted => {
                self.outbox.event(Event::PayloadReceived { peer, payload });
                ReceiveOutcome::accepted()
            }
            QuotaOutcome::Throttled(delay) => {
                let violations = neighbour.quota.violations();
                self.outbox.event(Event::QuotaViolation { peer, violations });
                self.outbox.event(Event::PayloadReceived { peer, payload });
                ReceiveOutcome::throttled(delay)
            }
            QuotaOutcome::Dropped(delay) => {
                warn!(
                    target: "p2p",
                    "{}: inbound quota exceeded ({} violations), dropping {} bytes",
                    peer,
                    neighbour.quota.violations(),
                    payload.len()
                );
                ReceiveOutcome::dropped(delay)
            }
        }
    }

    /// Backpressure query: how long the carrier should wait before reading
    /// again for this peer.
    pub fn receive_delay(&self, peer: &PeerId) -> LocalDuration {
        self.neighbours
            .get(peer)
            .map(|n| {
                if n.quota.violations() >= VIOLATION_THRESHOLD {
                    LocalDuration::from_secs(super::quota::MAX_CARRY_SECS)
                } else {
                    LocalDuration::default()
                }
            })
            .unwrap_or_default()
    }

    /// Send queued messages while a path is available. `candidates` offers
    /// fallback `(address, session)` pairs for a neighbour whose primary
    /// went away.
    pub fn dispatch(&mut self, peer: PeerId, candidates: &[(Address, SessionId)]) {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        if neighbour.state != NeighbourState::Connected {
            return;
        }
        if neighbour.primary_session().is_none() {
            // Re-route onto any validated fallback path.
            if let Some((address, session)) = candidates.first() {
                info!(target: "p2p", "{}: re-routing onto {}", peer, address);
                neighbour.primary = Some((address.clone(), Some(*session)));
            }
        }
        let Some(session) = neighbour.primary_session() else {
            return;
        };

        let mut completions = Vec::new();
        while let Some(message) = neighbour.queue.pop_front() {
            if message.deadline <= now {
                completions.push((
                    message.client,
                    message.payload.len() as u32,
                    0,
                    Err(SendError::Timeout),
                ));
                continue;
            }
            let wire = Message::Payload(message.payload);
            let bytes_on_wire = wire.encoded_size() as u32;
            let bytes_payload = match &wire {
                Message::Payload(p) => p.len() as u32,
                _ => 0,
            };
            self.outbox.message(session, wire);
            completions.push((message.client, bytes_payload, bytes_on_wire, Ok(())));
        }
        for (client, bytes_payload, bytes_on_wire, result) in completions {
            self.outbox.event(Event::SendCompleted {
                client,
                peer,
                bytes_payload,
                bytes_on_wire,
                result,
            });
        }
    }

    /// A session died. Neighbours bound to it lose the path; with a
    /// fallback candidate they are re-routed, otherwise queued messages are
    /// failed back and a fresh path is requested.
    pub fn session_ended(&mut self, session: SessionId, candidates: &[(Address, SessionId)]) {
        let now = self.clock.local_time();
        let affected: Vec<PeerId> = self
            .neighbours
            .values()
            .filter(|n| {
                n.primary_session() == Some(session)
                    || n.alternate.as_ref().map(|(_, s)| *s) == Some(session)
            })
            .map(|n| n.peer)
            .collect();

        for peer in affected {
            let candidates: Vec<(Address, SessionId)> = candidates
                .iter()
                .filter(|(a, s)| a.peer == peer && *s != session)
                .cloned()
                .collect();
            let Some(neighbour) = self.neighbours.get_mut(&peer) else {
                continue;
            };
            if neighbour.alternate.as_ref().map(|(_, s)| *s) == Some(session) {
                neighbour.alternate = None;
            }
            if neighbour.probe.map(|p| p.session) == Some(session) {
                neighbour.probe = None;
            }
            if neighbour.primary_session() != Some(session) {
                continue;
            }
            neighbour.primary = None;

            match neighbour.state {
                NeighbourState::Connected => {
                    if !candidates.is_empty() {
                        self.dispatch(peer, &candidates);
                    } else {
                        // No path left: fail what is queued, go back to
                        // waiting for the scheduler.
                        let failed: Vec<QueuedMessage> =
                            self.neighbours
                                .get_mut(&peer)
                                .map(|n| n.queue.drain(..).collect())
                                .unwrap_or_default();
                        for message in failed {
                            self.outbox.event(Event::SendCompleted {
                                client: message.client,
                                peer,
                                bytes_payload: message.payload.len() as u32,
                                bytes_on_wire: 0,
                                result: Err(SendError::NoAddress),
                            });
                        }
                        self.transition(
                            peer,
                            NeighbourState::InitAts,
                            now + self.config.setup_timeout,
                        );
                        self.outbox.event(Event::AddressRequested { peer });
                    }
                }
                NeighbourState::SynSent | NeighbourState::SynAckSent => {
                    self.transition(
                        peer,
                        NeighbourState::InitAts,
                        now + self.config.setup_timeout,
                    );
                    self.outbox.event(Event::AddressRequested { peer });
                }
                _ => {}
            }
        }
    }

    /// Tear a neighbour down: fail its queue, notify, mark for reaping.
    pub fn disconnect(&mut self, peer: PeerId, reason: DisconnectReason) {
        let now = self.clock.local_time();
        let Some(neighbour) = self.neighbours.get_mut(&peer) else {
            return;
        };
        if neighbour.state == NeighbourState::Disconnect {
            return;
        }
        info!(target: "p2p", "{}: disconnecting neighbour: {}", peer, reason);

        // A graceful close tells the peer; other teardowns just drop.
        if neighbour.state == NeighbourState::Connected {
            if let Some(session) = neighbour.primary_session() {
                self.outbox
                    .message(session, Message::Disconnect { timestamp: now });
            }
        }
        let failed: Vec<QueuedMessage> = neighbour.queue.drain(..).collect();
        for message in failed {
            self.outbox.event(Event::SendCompleted {
                client: message.client,
                peer,
                bytes_payload: message.payload.len() as u32,
                bytes_on_wire: 0,
                result: Err(SendError::NotConnected),
            });
        }
        self.transition(peer, NeighbourState::Disconnect, now + TICK);
        self.outbox.event(Event::NeighbourDisconnected { peer, reason });
        self.outbox.set_timer(TICK);
    }

    /// Periodic sweep: retransmits, handshake and idle timeouts, queue
    /// deadlines, keepalives, record reaping.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();
        let peers: Vec<PeerId> = self.neighbours.keys().copied().collect();

        for peer in peers {
            let Some(neighbour) = self.neighbours.get_mut(&peer) else {
                continue;
            };
            match neighbour.state {
                NeighbourState::Disconnect => {
                    // Freed one tick after entering the terminal state.
                    if now >= neighbour.state_deadline {
                        self.neighbours.remove(&peer);
                    }
                }
                NeighbourState::SynSent => {
                    if now >= neighbour.state_deadline
                        || neighbour.attempts >= MAX_HANDSHAKE_ATTEMPTS
                    {
                        self.disconnect(peer, DisconnectReason::Timeout("syn-sent"));
                    } else if now >= neighbour.next_retransmit {
                        let session = neighbour.primary_session();
                        let timestamp = neighbour.connect_ts;
                        neighbour.attempts += 1;
                        neighbour.backoff = (neighbour.backoff * 2).min(RETRANSMIT_MAX);
                        neighbour.next_retransmit = now + neighbour.backoff;
                        let backoff = neighbour.backoff;
                        if let Some(session) = session {
                            self.outbox.message(session, Message::Syn { timestamp });
                        }
                        self.outbox.set_timer(backoff);
                    }
                }
                NeighbourState::SynAckSent => {
                    if now >= neighbour.state_deadline
                        || neighbour.attempts >= MAX_HANDSHAKE_ATTEMPTS
                    {
                        self.disconnect(peer, DisconnectReason::Timeout("syn-ack-sent"));
                    } else if now >= neighbour.next_retransmit {
                        let session = neighbour.primary_session();
                        let timestamp = neighbour.connect_ts;
                        neighbour.attempts += 1;
                        neighbour.backoff = (neighbour.backoff * 2).min(RETRANSMIT_MAX);
                        neighbour.next_retransmit = now + neighbour.backoff;
                        let backoff = neighbour.backoff;
                        if let Some(session) = session {
                            self.outbox.message(session, Message::SynAck { timestamp });
                        }
                        self.outbox.set_timer(backoff);
                    }
                }
                NeighbourState::InitAts | NeighbourState::NotConnected => {
                    // Messages that ran out of time while no path was ever
                    // available fail with a distinct kind.
                    let mut expired = Vec::new();
                    let mut index = 0;
                    while index < neighbour.queue.len() {
                        if neighbour.queue[index].deadline <= now {
                            if let Some(message) = neighbour.queue.remove(index) {
                                expired.push(message);
                            }
                        } else {
                            index += 1;
                        }
                    }
                    let deadline_passed = now >= neighbour.state_deadline;
                    for message in expired {
                        self.outbox.event(Event::SendCompleted {
                            client: message.client,
                            peer,
                            bytes_payload: message.payload.len() as u32,
                            bytes_on_wire: 0,
                            result: Err(SendError::NoAddress),
                        });
                    }
                    if deadline_passed {
                        self.disconnect(peer, DisconnectReason::Timeout("no-path"));
                    }
                }
                NeighbourState::Connected => {
                    if now.duration_since(neighbour.last_received) >= self.config.idle_timeout {
                        self.disconnect(peer, DisconnectReason::Timeout("idle"));
                        continue;
                    }
                    // Probes that never answered: a failed path switch keeps
                    // the old path.
                    if let Some(probe) = neighbour.probe {
                        if now.duration_since(probe.sent_at) >= self.config.keepalive_interval * 2 {
                            if neighbour.alternate.as_ref().map(|(_, s)| *s)
                                == Some(probe.session)
                            {
                                debug!(
                                    target: "p2p",
                                    "{}: path switch probe timed out, keeping old path", peer
                                );
                                neighbour.alternate = None;
                            }
                            neighbour.probe = None;
                        }
                    }
                    if neighbour.probe.is_none()
                        && now.duration_since(neighbour.last_keepalive)
                            >= self.config.keepalive_interval
                    {
                        if let Some(session) = neighbour.primary_session() {
                            let nonce = self.rng.u32(..);
                            neighbour.last_keepalive = now;
                            neighbour.probe = Some(Probe {
                                session,
                                nonce,
                                sent_at: now,
                            });
                            self.outbox.message(session, Message::Keepalive { nonce });
                        }
                    }
                    // Expire queued messages past their deadline.
                    let mut expired = Vec::new();
                    if let Some(neighbour) = self.neighbours.get_mut(&peer) {
                        let mut index = 0;
                        while index < neighbour.queue.len() {
                            if neighbour.queue[index].deadline <= now {
                                if let Some(message) = neighbour.queue.remove(index) {
                                    expired.push(message);
                                }
                            } else {
                                index += 1;
                            }
                        }
                    }
                    for message in expired {
                        self.outbox.event(Event::SendCompleted {
                            client: message.client,
                            peer,
                            bytes_payload: message.payload.len() as u32,
                            bytes_on_wire: 0,
                            result: Err(SendError::Timeout),
                        });
                    }
                }
                NeighbourState::AckSent => {}
            }
        }

        if self
            .last_idle
            .map_or(true, |last| now.duration_since(last) >= TICK)
        {
            self.last_idle = Some(now);
            if !self.neighbours.is_empty() {
                self.outbox.set_timer(TICK);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Link;
    use crate::session::SessionInfo;
    use switchyard_common::time::RefClock;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 32])
    }

    struct Fixture {
        mgr: NeighbourManager<RefClock>,
        sessions: SessionTable,
        clock: RefClock,
        client: ClientId,
    }

    fn fixture(local: PeerId) -> Fixture {
        let clock = RefClock::from(LocalTime::from_secs(1_000));
        let mgr = NeighbourManager::new(
            Config {
                local_id: local,
                neighbour_limit: 10,
                default_quota_in: 32 * 1024,
                default_quota_out: 32 * 1024,
                keepalive_interval: KEEPALIVE_INTERVAL,
                idle_timeout: IDLE_TIMEOUT,
                setup_timeout: SETUP_TIMEOUT,
            },
            fastrand::Rng::with_seed(7),
            clock.clone(),
        );
        let mut registry = crate::client::ClientRegistry::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let client = registry.register(crate::client::ClientKind::Core, tx);

        Fixture {
            mgr,
            sessions: SessionTable::new(),
            clock,
            client,
        }
    }

    fn session_to(f: &mut Fixture, p: PeerId) -> SessionId {
        f.sessions.insert(SessionInfo {
            plugin: "tcp".to_owned(),
            peer: p,
            address: Address::new("tcp", vec![10, 0, 0, 1], p),
            link: Link::Inbound,
            since: f.clock.local_time(),
        })
    }

    fn drain(mgr: &mut NeighbourManager<RefClock>) -> Vec<Io> {
        std::iter::from_fn(|| mgr.next()).collect()
    }

    fn writes(ios: &[Io]) -> Vec<&Message> {
        ios.iter()
            .filter_map(|io| match io {
                Io::Write(_, m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn connect_outbound(f: &mut Fixture, p: PeerId) -> SessionId {
        let session = session_to(f, p);
        let address = Address::new("tcp", vec![10, 0, 0, 1], p);

        f.mgr
            .enqueue(f.client, p, vec![1, 2, 3], 0, LocalDuration::from_secs(30));
        f.mgr.set_cleared(p, true);
        f.mgr
            .use_address(p, address, Some(session), 32 * 1024, 32 * 1024, &f.sessions);

        let ios = drain(&mut f.mgr);
        assert!(writes(&ios)
            .iter()
            .any(|m| matches!(m, Message::Syn { .. })));

        f.mgr
            .received_syn_ack(p, session, f.mgr.neighbours[&p].connect_ts);
        session
    }

    #[test]
    fn test_outbound_handshake_completes() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let session = connect_outbound(&mut f, p);

        assert!(f.mgr.is_connected(&p));
        let ios = drain(&mut f.mgr);
        let sent = writes(&ios);
        // The ACK, the quota advertisement and the queued payload all went
        // out on the session.
        assert!(sent.iter().any(|m| matches!(m, Message::Ack)));
        assert!(sent.iter().any(|m| matches!(m, Message::Quota { .. })));
        assert!(sent.iter().any(|m| matches!(m, Message::Payload(_))));
        assert!(ios.iter().any(|io| matches!(
            io,
            Io::Event(Event::SendCompleted { result: Ok(()), .. })
        )));
        let _ = session;
    }

    #[test]
    fn test_inbound_handshake_completes() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let session = session_to(&mut f, p);

        f.mgr
            .received_syn(p, session, LocalTime::from_secs(999), &f.sessions)
            .unwrap();
        let ios = drain(&mut f.mgr);
        assert!(writes(&ios).iter().any(
            |m| matches!(m, Message::SynAck { timestamp } if *timestamp == LocalTime::from_secs(999))
        ));

        f.mgr.received_ack(p, session);
        assert!(f.mgr.is_connected(&p));
    }

    #[test]
    fn test_simultaneous_connect_tie_break() {
        // We are Q (larger); P (smaller) must win the tie-break.
        let q = peer(9);
        let p = peer(1);
        let mut f = fixture(q);
        let session = session_to(&mut f, p);
        let address = Address::new("tcp", vec![10, 0, 0, 1], p);

        f.mgr
            .enqueue(f.client, p, vec![0], 0, LocalDuration::from_secs(30));
        f.mgr.set_cleared(p, true);
        f.mgr
            .use_address(p, address, Some(session), 1024, 1024, &f.sessions);
        let _ = drain(&mut f.mgr);

        // Their SYN arrives while we are in SYN_SENT: it is canonical.
        f.mgr
            .received_syn(p, session, LocalTime::from_secs(998), &f.sessions)
            .unwrap();
        let ios = drain(&mut f.mgr);
        assert!(writes(&ios).iter().any(
            |m| matches!(m, Message::SynAck { timestamp } if *timestamp == LocalTime::from_secs(998))
        ));

        f.mgr.received_ack(p, session);
        assert!(f.mgr.is_connected(&p));

        // The mirror image: we are P (smaller); their SYN is ignored and
        // our own SYN stays canonical.
        let mut g = fixture(p);
        let session = session_to(&mut g, q);
        let address = Address::new("tcp", vec![10, 0, 0, 2], q);
        g.mgr
            .enqueue(g.client, q, vec![0], 0, LocalDuration::from_secs(30));
        g.mgr.set_cleared(q, true);
        g.mgr
            .use_address(q, address, Some(session), 1024, 1024, &g.sessions);
        let _ = drain(&mut g.mgr);

        g.mgr
            .received_syn(q, session, LocalTime::from_secs(998), &g.sessions)
            .unwrap();
        let ios = drain(&mut g.mgr);
        // No SYN-ACK: we wait for theirs.
        assert!(!writes(&ios)
            .iter()
            .any(|m| matches!(m, Message::SynAck { .. })));

        let ts = g.mgr.neighbours[&q].connect_ts;
        g.mgr.received_syn_ack(q, session, ts);
        assert!(g.mgr.is_connected(&q));
    }

    #[test]
    fn test_syn_retransmit_gives_up() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let session = session_to(&mut f, p);
        let address = Address::new("tcp", vec![10, 0, 0, 1], p);

        f.mgr
            .enqueue(f.client, p, vec![0], 0, LocalDuration::from_secs(60));
        f.mgr.set_cleared(p, true);
        f.mgr
            .use_address(p, address, Some(session), 1024, 1024, &f.sessions);
        let _ = drain(&mut f.mgr);

        // Let the handshake run out entirely.
        for _ in 0..30 {
            f.clock.elapse(LocalDuration::from_secs(1));
            f.mgr.timer_expired();
        }
        let ios = drain(&mut f.mgr);
        assert!(ios.iter().any(|io| matches!(
            io,
            Io::Event(Event::NeighbourDisconnected {
                reason: DisconnectReason::Timeout(_),
                ..
            })
        )));
        // Queued messages were failed back.
        assert!(ios.iter().any(|io| matches!(
            io,
            Io::Event(Event::SendCompleted {
                result: Err(SendError::NotConnected),
                ..
            })
        )));

        // The record is reaped one tick later.
        f.clock.elapse(LocalDuration::from_secs(2));
        f.mgr.timer_expired();
        assert!(!f.mgr.contains(&p));
    }

    #[test]
    fn test_priority_order_fifo_ties() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let session = session_to(&mut f, p);
        let address = Address::new("tcp", vec![10, 0, 0, 1], p);

        f.mgr
            .enqueue(f.client, p, vec![1], 1, LocalDuration::from_secs(30));
        f.mgr.set_cleared(p, true);
        // Not yet connected: these stack up in the queue.
        f.mgr
            .enqueue(f.client, p, vec![2], 1, LocalDuration::from_secs(30));
        f.mgr
            .enqueue(f.client, p, vec![9], 5, LocalDuration::from_secs(30));
        f.mgr
            .use_address(p, address, Some(session), 1024, 1024, &f.sessions);
        let _ = drain(&mut f.mgr);

        f.mgr
            .received_syn_ack(p, session, f.mgr.neighbours[&p].connect_ts);
        let ios = drain(&mut f.mgr);
        let payloads: Vec<Vec<u8>> = writes(&ios)
            .iter()
            .filter_map(|m| match m {
                Message::Payload(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        // Highest priority first, FIFO among equals.
        assert_eq!(payloads, vec![vec![9], vec![1], vec![2]]);
    }

    #[test]
    fn test_quota_drop_path() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let session = connect_outbound(&mut f, p);
        let _ = drain(&mut f.mgr);

        let mut dropped = false;
        for _ in 0..600 {
            let outcome =
                f.mgr
                    .payload_received(p, session, Arc::new(vec![0; 1024]));
            if outcome.dropped {
                dropped = true;
                assert!(outcome.delay > LocalDuration::default());
                break;
            }
        }
        assert!(dropped, "sustained overrun must eventually drop");
    }

    #[test]
    fn test_session_end_fails_queue_when_no_fallback() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let session = connect_outbound(&mut f, p);
        let _ = drain(&mut f.mgr);

        // Queue a message, then kill the path before dispatch can run.
        f.mgr.session_ended(session, &[]);
        f.mgr
            .enqueue(f.client, p, vec![7; 16], 0, LocalDuration::from_secs(30));
        f.mgr.session_ended(session, &[]);

        let ios = drain(&mut f.mgr);
        assert!(ios.iter().any(|io| matches!(
            io,
            Io::Event(Event::AddressRequested { .. })
        )));
    }

    #[test]
    fn test_soft_switch_completes_on_probe_answer() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let old = connect_outbound(&mut f, p);
        let _ = drain(&mut f.mgr);

        let new = session_to(&mut f, p);
        let address = Address::new("tcp", vec![10, 0, 0, 2], p);
        f.mgr
            .use_address(p, address, Some(new), 2048, 2048, &f.sessions);

        let ios = drain(&mut f.mgr);
        let nonce = writes(&ios)
            .iter()
            .find_map(|m| match m {
                Message::Keepalive { nonce } => Some(*nonce),
                _ => None,
            })
            .expect("a probe goes out on the armed path");

        f.mgr.received_keepalive_response(p, new, nonce);
        let ios = drain(&mut f.mgr);

        // The old path is released, an RTT sample is produced.
        assert!(ios
            .iter()
            .any(|io| matches!(io, Io::Disconnect(s, DisconnectReason::AddressSwitch) if *s == old)));
        assert!(ios
            .iter()
            .any(|io| matches!(io, Io::Event(Event::RttMeasured { .. }))));
        assert_eq!(
            f.mgr.neighbours[&p].primary_session(),
            Some(new)
        );
    }

    #[test]
    fn test_failed_switch_keeps_old_path() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let old = connect_outbound(&mut f, p);
        let _ = drain(&mut f.mgr);

        let new = session_to(&mut f, p);
        let address = Address::new("tcp", vec![10, 0, 0, 2], p);
        f.mgr
            .use_address(p, address, Some(new), 2048, 2048, &f.sessions);
        let _ = drain(&mut f.mgr);

        // The probe never answers. Keep the neighbour alive with traffic so
        // only the switch fails.
        for _ in 0..12 {
            f.clock.elapse(LocalDuration::from_secs(1));
            f.mgr.received_keepalive(p, old, 1);
            f.mgr.timer_expired();
        }
        assert!(f.mgr.is_connected(&p));
        assert_eq!(f.mgr.neighbours[&p].primary_session(), Some(old));
        assert!(f.mgr.neighbours[&p].alternate.is_none());
    }

    #[test]
    fn test_idle_timeout_disconnects() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let _session = connect_outbound(&mut f, p);
        let _ = drain(&mut f.mgr);

        f.clock.elapse(IDLE_TIMEOUT + LocalDuration::from_secs(1));
        f.mgr.timer_expired();

        let ios = drain(&mut f.mgr);
        assert!(ios.iter().any(|io| matches!(
            io,
            Io::Event(Event::NeighbourDisconnected {
                reason: DisconnectReason::Timeout("idle"),
                ..
            })
        )));
    }

    #[test]
    fn test_duplicate_neighbour_never_exists() {
        let mut f = fixture(peer(1));
        let p = peer(2);
        let s1 = session_to(&mut f, p);
        let s2 = session_to(&mut f, p);

        f.mgr
            .received_syn(p, s1, LocalTime::from_secs(990), &f.sessions)
            .unwrap();
        f.mgr
            .received_syn(p, s2, LocalTime::from_secs(991), &f.sessions)
            .unwrap();

        assert_eq!(f.mgr.len(), 1);
    }
}
