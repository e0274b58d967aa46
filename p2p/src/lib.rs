//! Peer-to-peer transport protocol core.
//!
//! A deterministic state machine multiplexing pluggable carriers behind a
//! peer-addressed message bus: address validation, neighbour handshakes,
//! bandwidth quotas, blacklist policy and HELLO gossip. Drive it with a
//! reactor; it performs no I/O of its own.
#![warn(missing_docs)]

pub mod client;
pub mod fsm;
pub mod message;
pub mod plugin;
pub mod revocation;
pub mod session;
pub mod stats;

pub use client::{ClientId, ClientKind, ClientNotice, SendError};
pub use fsm::{Command, Config, DisconnectReason, Event, Io, Limits, StateMachine};
pub use plugin::{AddressChange, Link, ReceiveOutcome};
pub use session::SessionId;
