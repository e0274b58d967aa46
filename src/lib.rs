//! Switchyard is a peer-to-peer transport multiplexer: pluggable link-layer
//! carriers hand their sessions to a deterministic protocol core that
//! validates advertised addresses, maintains one logical neighbour per remote
//! peer and enforces per-peer bandwidth quotas.
//!
//! This crate re-exports the workspace members.
#[cfg(feature = "switchyard-common")]
pub use switchyard_common as common;
#[cfg(feature = "switchyard-node")]
pub use switchyard_node as node;
#[cfg(feature = "switchyard-p2p")]
pub use switchyard_p2p as p2p;
