//! The surface between carrier drivers and the protocol core.
//!
//! A carrier driver ("plugin") owns its sockets and sessions; the core is
//! driven through four entry points on the state machine: message receipt,
//! local address changes, session start and session end. Everything the core
//! wants a carrier to *do* comes back out as [`Io`](crate::fsm::Io) intents,
//! never as a call made from inside a carrier's own callback.
use std::fmt;

use switchyard_common::time::LocalDuration;

/// Direction of a session: who initiated it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Link {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

impl Link {
    /// Whether we initiated the session.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Whether the remote initiated the session.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// Whether a local binding appeared or went away.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressChange {
    /// The carrier acquired the binding.
    Added,
    /// The binding expired or was torn down.
    Removed,
}

/// The core's answer to a delivery: how long the carrier should hold off
/// before delivering more payload, and whether this message was dropped.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Suggested delay before the next delivery. Zero means "keep going".
    pub delay: LocalDuration,
    /// Set when the message was discarded instead of processed.
    pub dropped: bool,
}

impl ReceiveOutcome {
    /// Accept with no backpressure.
    pub fn accepted() -> Self {
        Self::default()
    }

    /// Accept, but ask the carrier to pause.
    pub fn throttled(delay: LocalDuration) -> Self {
        Self {
            delay,
            dropped: false,
        }
    }

    /// The message was discarded; the carrier must honour the delay.
    pub fn dropped(delay: LocalDuration) -> Self {
        Self {
            delay,
            dropped: true,
        }
    }
}
