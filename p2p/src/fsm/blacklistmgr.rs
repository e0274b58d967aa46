//! The blacklist check pipeline.
//!
//! Two layers gate every new peer relationship: a static table loaded from
//! configuration, and any number of subscribed oracle clients, each of which
//! must answer before the guarded action may proceed. Checks are held open
//! until every oracle answered, and aborted when the session they guard
//! disappears.
use std::collections::VecDeque;
use std::fmt;

use log::*;

use switchyard_common::identity::PeerId;
use switchyard_common::time::LocalTime;

use super::event::Event;
use super::output::{Io, Outbox};
use crate::client::ClientId;
use crate::session::SessionId;

/// One static deny rule: a peer, optionally narrowed to a single carrier.
/// A rule without a transport denies the peer on every carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEntry {
    /// The denied peer.
    pub peer: PeerId,
    /// Carrier the denial is limited to, if any.
    pub transport: Option<String>,
}

/// Decision of a completed check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Every consulted party allowed the peer.
    Allowed,
    /// The static table or an oracle denied the peer.
    Denied,
    /// An oracle answered "don't know", or the guarded session vanished.
    /// Callers must treat this as deny-without-confirmation.
    Aborted,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed => write!(f, "allowed"),
            Self::Denied => write!(f, "denied"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// What the caller was doing when it started the check; echoed back with the
/// result so the right continuation runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CheckContext {
    /// A carrier registered a new session.
    SessionAdmission,
    /// An inbound SYN is waiting to be answered.
    Handshake {
        /// The SYN's timestamp, replayed to the neighbour engine on allow.
        timestamp: LocalTime,
    },
    /// An outbound neighbour is about to be set up.
    Outbound,
    /// An existing neighbour is re-examined after an oracle subscribed.
    Recheck,
}

#[derive(Debug)]
struct Check {
    peer: PeerId,
    transport: Option<String>,
    session: Option<SessionId>,
    context: CheckContext,
    /// Oracles not yet consulted, front first.
    remaining: VecDeque<ClientId>,
    /// Oracle whose answer we are waiting for.
    waiting_on: Option<ClientId>,
}

/// Serialises authorization decisions across the static table and all
/// registered oracles.
#[derive(Debug, Default)]
pub struct BlacklistManager {
    static_entries: Vec<StaticEntry>,
    checks: Vec<Check>,
    outbox: Outbox,
}

impl BlacklistManager {
    /// Create a manager with the given static table.
    pub fn new(static_entries: Vec<StaticEntry>) -> Self {
        Self {
            static_entries,
            checks: Vec::new(),
            outbox: Outbox::new(),
        }
    }

    /// Drain the next output.
    pub fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }

    /// Whether the static table denies the peer on the given carrier.
    pub fn is_statically_denied(&self, peer: &PeerId, transport: Option<&str>) -> bool {
        self.static_entries.iter().any(|entry| {
            entry.peer == *peer
                && match (&entry.transport, transport) {
                    (None, _) => true,
                    (Some(denied), Some(used)) => denied == used,
                    (Some(_), None) => false,
                }
        })
    }

    /// Whether a check guarding this peer/session pair is already open.
    pub fn has_pending(&self, peer: &PeerId, session: Option<SessionId>) -> bool {
        self.checks
            .iter()
            .any(|c| c.peer == *peer && c.session == session)
    }

    /// Number of open checks.
    pub fn pending(&self) -> usize {
        self.checks.len()
    }

    /// Start a check. The result arrives as a
    /// [`Event::BlacklistResult`]; when neither the static table nor any
    /// oracle objects, it is emitted immediately.
    pub fn check(
        &mut self,
        peer: PeerId,
        transport: Option<String>,
        session: Option<SessionId>,
        context: CheckContext,
        oracles: Vec<ClientId>,
    ) {
        if self.is_statically_denied(&peer, transport.as_deref()) {
            info!(target: "p2p", "{}: statically blacklisted", peer);
            self.conclude(peer, session, context, CheckOutcome::Denied);
            return;
        }
        let mut check = Check {
            peer,
            transport,
            session,
            context,
            remaining: oracles.into(),
            waiting_on: None,
        };
        match check.remaining.pop_front() {
            None => {
                self.conclude(peer, session, context, CheckOutcome::Allowed);
            }
            Some(oracle) => {
                check.waiting_on = Some(oracle);
                self.outbox.event(Event::BlacklistQuery { oracle, peer });
                self.checks.push(check);
            }
        }
    }

    fn conclude(
        &mut self,
        peer: PeerId,
        session: Option<SessionId>,
        context: CheckContext,
        outcome: CheckOutcome,
    ) {
        self.outbox.event(Event::BlacklistResult {
            peer,
            session,
            context,
            outcome,
        });
    }

    /// An oracle answered. `None` means "abort, I don't know".
    pub fn reply(&mut self, oracle: ClientId, peer: PeerId, allowed: Option<bool>) {
        let Some(pos) = self
            .checks
            .iter()
            .position(|c| c.waiting_on == Some(oracle) && c.peer == peer)
        else {
            debug!(target: "p2p", "{}: unsolicited blacklist reply from {}", peer, oracle);
            return;
        };

        match allowed {
            None => {
                let check = self.checks.remove(pos);
                warn!(target: "p2p", "{}: oracle {} aborted the check", peer, oracle);
                self.conclude(check.peer, check.session, check.context, CheckOutcome::Aborted);
            }
            Some(false) => {
                let check = self.checks.remove(pos);
                info!(target: "p2p", "{}: denied by oracle {}", peer, oracle);
                self.conclude(check.peer, check.session, check.context, CheckOutcome::Denied);
            }
            Some(true) => {
                let check = &mut self.checks[pos];
                match check.remaining.pop_front() {
                    Some(next) => {
                        check.waiting_on = Some(next);
                        self.outbox.event(Event::BlacklistQuery { oracle: next, peer });
                    }
                    None => {
                        let check = self.checks.remove(pos);
                        self.conclude(
                            check.peer,
                            check.session,
                            check.context,
                            CheckOutcome::Allowed,
                        );
                    }
                }
            }
        }
    }

    /// An oracle client went away; its open queries move on to the next
    /// oracle in line.
    pub fn oracle_gone(&mut self, oracle: ClientId) {
        let mut concluded = Vec::new();

        for (index, check) in self.checks.iter_mut().enumerate() {
            check.remaining.retain(|o| *o != oracle);
            if check.waiting_on == Some(oracle) {
                match check.remaining.pop_front() {
                    Some(next) => {
                        check.waiting_on = Some(next);
                        self.outbox.event(Event::BlacklistQuery {
                            oracle: next,
                            peer: check.peer,
                        });
                    }
                    None => concluded.push(index),
                }
            }
        }
        for index in concluded.into_iter().rev() {
            let check = self.checks.remove(index);
            self.conclude(
                check.peer,
                check.session,
                check.context,
                CheckOutcome::Allowed,
            );
        }
    }

    /// The session a check was guarding vanished: abort the check so the
    /// caller knows the target is gone.
    pub fn session_ended(&mut self, session: SessionId) {
        let mut aborted = Vec::new();

        self.checks.retain(|check| {
            if check.session == Some(session) {
                aborted.push((check.peer, check.context));
                false
            } else {
                true
            }
        });
        for (peer, context) in aborted {
            debug!(target: "p2p", "{}: blacklist check aborted, session gone", peer);
            self.conclude(peer, Some(session), context, CheckOutcome::Aborted);
        }
    }

}
