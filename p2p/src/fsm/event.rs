//! Protocol events.
//!
//! Events serve two audiences: they are fanned back into every sub-manager
//! (the only way managers hear about each other), and the umbrella turns the
//! client-relevant ones into notices.
use std::fmt;
use std::sync::Arc;

use switchyard_common::address::{Address, OwnAddress};
use switchyard_common::hello::Hello;
use switchyard_common::identity::PeerId;
use switchyard_common::time::{LocalDuration, LocalTime};

use super::blacklistmgr::{CheckContext, CheckOutcome};
use super::neighbourmgr::NeighbourState;
use super::DisconnectReason;
use crate::client::{ClientId, SendError};
use crate::plugin::Link;
use crate::session::SessionId;

/// An event emitted by the protocol core.
#[derive(Debug, Clone)]
pub enum Event {
    /// The state machine is initializing.
    Initializing,
    /// The state machine finished initializing.
    Ready {
        /// Local time at readiness.
        time: LocalTime,
    },
    /// A carrier registered a new session.
    SessionStarted {
        /// Remote peer.
        peer: PeerId,
        /// The new session.
        session: SessionId,
        /// Address the session is bound to.
        address: Address,
        /// Who initiated.
        link: Link,
    },
    /// A carrier is about to destroy a session. After this event no output
    /// may reference the session.
    SessionEnded {
        /// Remote peer.
        peer: PeerId,
        /// The dying session.
        session: SessionId,
    },
    /// A neighbour needs an address suggestion from the scheduler.
    AddressRequested {
        /// The peer in question.
        peer: PeerId,
    },
    /// The scheduler proposes a path for a peer.
    AddressSuggested {
        /// The peer in question.
        peer: PeerId,
        /// Suggested address.
        address: Address,
        /// Live session for the address, when one exists.
        session: Option<SessionId>,
        /// Assigned inbound bandwidth, bytes/second.
        bandwidth_in: u32,
        /// Assigned outbound bandwidth, bytes/second.
        bandwidth_out: u32,
    },
    /// An address passed PONG verification.
    AddressValidated {
        /// Peer the address belongs to.
        peer: PeerId,
        /// The validated address.
        address: Address,
    },
    /// A previously validated address expired or failed.
    AddressInvalidated {
        /// Peer the address belonged to.
        peer: PeerId,
        /// The invalidated address.
        address: Address,
    },
    /// Our own HELLO changed.
    OwnHelloChanged {
        /// The new HELLO.
        hello: Arc<Hello>,
    },
    /// A PONG-USING reply told us how the outside world sees us.
    ExternalAddressLearned {
        /// Our externally visible address, as reported by a peer.
        address: OwnAddress,
    },
    /// A HELLO was written into an outgoing frame for a neighbour.
    HelloAdvertised {
        /// The neighbour it was offered to.
        peer: PeerId,
    },
    /// We learned a (possibly third-party) peer's HELLO.
    HelloDiscovered {
        /// The peer the HELLO describes.
        peer: PeerId,
        /// The HELLO.
        hello: Arc<Hello>,
    },
    /// A neighbour changed state.
    NeighbourStateChanged {
        /// The neighbour.
        peer: PeerId,
        /// The state entered.
        state: NeighbourState,
        /// When the state times out on its own.
        timeout: LocalTime,
    },
    /// A neighbour completed the handshake.
    NeighbourConnected {
        /// The neighbour.
        peer: PeerId,
        /// Session the handshake completed on.
        session: SessionId,
        /// Assigned inbound bandwidth, bytes/second.
        bandwidth_in: u32,
        /// Assigned outbound bandwidth, bytes/second.
        bandwidth_out: u32,
    },
    /// A neighbour was torn down.
    NeighbourDisconnected {
        /// The neighbour.
        peer: PeerId,
        /// Why.
        reason: DisconnectReason,
    },
    /// Payload arrived from a connected neighbour and passed the quota
    /// tracker.
    PayloadReceived {
        /// Origin peer.
        peer: PeerId,
        /// Opaque payload.
        payload: Arc<Vec<u8>>,
    },
    /// Outcome of a client-submitted send.
    SendCompleted {
        /// Submitting client.
        client: ClientId,
        /// Destination peer.
        peer: PeerId,
        /// Payload size as submitted.
        bytes_payload: u32,
        /// Bytes handed to the carrier.
        bytes_on_wire: u32,
        /// Delivery outcome.
        result: Result<(), SendError>,
    },
    /// A neighbour overdrew its inbound quota.
    QuotaViolation {
        /// The neighbour.
        peer: PeerId,
        /// Its violation counter after the overdraw.
        violations: u32,
    },
    /// A round-trip time sample was measured on a session.
    RttMeasured {
        /// The neighbour.
        peer: PeerId,
        /// Session the sample was measured on.
        session: SessionId,
        /// The sample.
        latency: LocalDuration,
    },
    /// A blacklist oracle must be asked about a peer.
    BlacklistQuery {
        /// The oracle to ask.
        oracle: ClientId,
        /// Peer to authorise.
        peer: PeerId,
    },
    /// A blacklist check concluded.
    BlacklistResult {
        /// Peer the check was about.
        peer: PeerId,
        /// Session the check was guarding, if any.
        session: Option<SessionId>,
        /// What the check was gating.
        context: CheckContext,
        /// The decision.
        outcome: CheckOutcome,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready { .. } => write!(f, "ready"),
            Self::SessionStarted {
                peer,
                session,
                link,
                ..
            } => write!(f, "{}: session {} started ({})", peer, session, link),
            Self::SessionEnded { peer, session } => {
                write!(f, "{}: session {} ended", peer, session)
            }
            Self::AddressRequested { peer } => write!(f, "{}: address requested", peer),
            Self::AddressSuggested { peer, address, .. } => {
                write!(f, "{}: suggested {}", peer, address)
            }
            Self::AddressValidated { peer, address } => {
                write!(f, "{}: validated {}", peer, address)
            }
            Self::AddressInvalidated { peer, address } => {
                write!(f, "{}: invalidated {}", peer, address)
            }
            Self::OwnHelloChanged { hello } => {
                write!(f, "own hello changed ({} addresses)", hello.addresses.len())
            }
            Self::ExternalAddressLearned { address } => {
                write!(f, "external address learned: {}", address)
            }
            Self::HelloAdvertised { peer } => write!(f, "{}: hello advertised", peer),
            Self::HelloDiscovered { peer, .. } => write!(f, "{}: hello discovered", peer),
            Self::NeighbourStateChanged { peer, state, .. } => {
                write!(f, "{}: entered {}", peer, state)
            }
            Self::NeighbourConnected { peer, .. } => write!(f, "{}: connected", peer),
            Self::NeighbourDisconnected { peer, reason } => {
                write!(f, "{}: disconnected ({})", peer, reason)
            }
            Self::PayloadReceived { peer, payload } => {
                write!(f, "{}: {} payload bytes", peer, payload.len())
            }
            Self::SendCompleted { peer, result, .. } => match result {
                Ok(()) => write!(f, "{}: send completed", peer),
                Err(err) => write!(f, "{}: send failed: {}", peer, err),
            },
            Self::QuotaViolation { peer, violations } => {
                write!(f, "{}: quota violation #{}", peer, violations)
            }
            Self::RttMeasured { peer, latency, .. } => {
                write!(f, "{}: rtt {}", peer, latency)
            }
            Self::BlacklistQuery { oracle, peer } => {
                write!(f, "{}: asking {} about {}", peer, oracle, peer)
            }
            Self::BlacklistResult { peer, outcome, .. } => {
                write!(f, "{}: blacklist check {}", peer, outcome)
            }
        }
    }
}
