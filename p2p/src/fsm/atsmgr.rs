//! Scheduler adapter.
//!
//! Publishes address and session facts for the external address scheduler
//! and turns its "use address X with bandwidth (in, out)" suggestions into
//! neighbour-engine input. When no external scheduler is attached, a
//! built-in fallback proposes the lowest-latency validated path in
//! round-robin order.
use log::*;

use switchyard_common::address::Address;
use switchyard_common::collections::HashMap;
use switchyard_common::identity::PeerId;
use switchyard_common::time::LocalDuration;

use super::output::{Io, Outbox};
use super::Event;
use crate::session::SessionId;

/// Scheduler adapter configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inbound bandwidth granted when the fallback makes a proposal.
    pub default_bandwidth_in: u32,
    /// Outbound bandwidth granted when the fallback makes a proposal.
    pub default_bandwidth_out: u32,
}

#[derive(Debug, Clone)]
struct AddressFact {
    address: Address,
    session: Option<SessionId>,
    latency: Option<LocalDuration>,
    validated: bool,
}

/// Tracks the facts published to the scheduler and produces suggestions.
pub struct AtsManager {
    config: Config,
    facts: HashMap<PeerId, Vec<AddressFact>>,
    /// Round-robin cursor per peer.
    cursor: HashMap<PeerId, usize>,
    /// Latency overrides installed by the traffic manipulation hook.
    latency_override: HashMap<PeerId, LocalDuration>,
    outbox: Outbox,
}

impl AtsManager {
    /// Create a new scheduler adapter.
    pub fn new(config: Config, rng: fastrand::Rng) -> Self {
        Self {
            config,
            facts: HashMap::with_hasher(rng.clone().into()),
            cursor: HashMap::with_hasher(rng.clone().into()),
            latency_override: HashMap::with_hasher(rng.into()),
            outbox: Outbox::new(),
        }
    }

    /// Drain the next output.
    pub fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }

    /// React to protocol events.
    pub fn received_event(&mut self, event: &Event) {
        match event {
            Event::AddressValidated { peer, address } => {
                let facts = self.facts.entry(*peer).or_default();
                match facts
                    .iter_mut()
                    .find(|f| f.address.endpoint() == address.endpoint())
                {
                    Some(fact) => fact.validated = true,
                    None => facts.push(AddressFact {
                        address: address.clone(),
                        session: None,
                        latency: None,
                        validated: true,
                    }),
                }
            }
            Event::AddressInvalidated { peer, address } => {
                if let Some(facts) = self.facts.get_mut(peer) {
                    facts.retain(|f| f.address.endpoint() != address.endpoint());
                    if facts.is_empty() {
                        self.facts.remove(peer);
                    }
                }
            }
            Event::SessionStarted {
                peer,
                session,
                address,
                ..
            } => {
                let facts = self.facts.entry(*peer).or_default();
                match facts
                    .iter_mut()
                    .find(|f| f.address.endpoint() == address.endpoint())
                {
                    Some(fact) => fact.session = Some(*session),
                    None => facts.push(AddressFact {
                        address: address.clone(),
                        session: Some(*session),
                        latency: None,
                        validated: false,
                    }),
                }
            }
            Event::SessionEnded { peer, session } => {
                if let Some(facts) = self.facts.get_mut(peer) {
                    for fact in facts.iter_mut() {
                        if fact.session == Some(*session) {
                            fact.session = None;
                        }
                    }
                }
            }
            Event::RttMeasured {
                peer,
                session,
                latency,
            } => {
                if let Some(facts) = self.facts.get_mut(peer) {
                    for fact in facts.iter_mut() {
                        if fact.session == Some(*session) {
                            fact.latency = Some(*latency);
                        }
                    }
                }
            }
            Event::AddressRequested { peer } => {
                self.suggest(*peer);
            }
            _ => {}
        }
    }

    /// Fallback suggestion: prefer validated facts with a live session,
    /// lowest observed latency first, round-robin among peers' equal
    /// choices.
    fn suggest(&mut self, peer: PeerId) {
        let overridden = self.latency_override.get(&peer).copied();
        let Some(facts) = self.facts.get(&peer) else {
            trace!(target: "p2p", "{}: no facts to suggest from", peer);
            return;
        };
        let mut usable: Vec<&AddressFact> = facts
            .iter()
            .filter(|f| f.validated || f.session.is_some())
            .collect();
        if usable.is_empty() {
            return;
        }
        usable.sort_by_key(|f| {
            (
                f.session.is_none(),
                !f.validated,
                overridden.or(f.latency).unwrap_or(LocalDuration::from_secs(u64::MAX / 1000)),
            )
        });

        let cursor = self.cursor.entry(peer).or_insert(0);
        // Rotate only among the equally-attractive head entries.
        let best = usable[0];
        let tied = usable
            .iter()
            .take_while(|f| {
                f.session.is_some() == best.session.is_some() && f.validated == best.validated
            })
            .count();
        let chosen = usable[*cursor % tied];
        *cursor = (*cursor + 1) % tied.max(1);

        debug!(target: "p2p", "{}: suggesting {}", peer, chosen.address);
        self.outbox.event(Event::AddressSuggested {
            peer,
            address: chosen.address.clone(),
            session: chosen.session,
            bandwidth_in: self.config.default_bandwidth_in,
            bandwidth_out: self.config.default_bandwidth_out,
        });
    }

    /// Validated fallback paths for a peer that still have a live session.
    pub fn candidates(&self, peer: &PeerId) -> Vec<(Address, SessionId)> {
        self.facts
            .get(peer)
            .map(|facts| {
                facts
                    .iter()
                    .filter(|f| f.validated)
                    .filter_map(|f| f.session.map(|s| (f.address.clone(), s)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Traffic manipulation hook: pin the observed latency of a peer.
    pub fn set_latency(&mut self, peer: PeerId, latency: Option<LocalDuration>) {
        match latency {
            Some(latency) => {
                self.latency_override.insert(peer, latency);
            }
            None => {
                self.latency_override.remove(&peer);
            }
        }
    }

    /// Number of peers with published facts.
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Whether no facts are published.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Link;
    use switchyard_common::time::LocalTime;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 32])
    }

    fn manager() -> AtsManager {
        AtsManager::new(
            Config {
                default_bandwidth_in: 64 * 1024,
                default_bandwidth_out: 64 * 1024,
            },
            fastrand::Rng::with_seed(3),
        )
    }

    fn suggestions(mgr: &mut AtsManager) -> Vec<Event> {
        std::iter::from_fn(|| mgr.next())
            .filter_map(|io| match io {
                Io::Event(e @ Event::AddressSuggested { .. }) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_suggests_validated_session_path() {
        let mut mgr = manager();
        let p = peer(1);
        let mut sessions = crate::session::SessionTable::new();
        let address = Address::new("tcp", vec![1], p);
        let session = sessions.insert(crate::session::SessionInfo {
            plugin: "tcp".to_owned(),
            peer: p,
            address: address.clone(),
            link: Link::Outbound,
            since: LocalTime::from_secs(100),
        });

        mgr.received_event(&Event::AddressValidated {
            peer: p,
            address: address.clone(),
        });
        mgr.received_event(&Event::SessionStarted {
            peer: p,
            session,
            address: address.clone(),
            link: Link::Outbound,
        });
        mgr.received_event(&Event::AddressRequested { peer: p });

        let got = suggestions(&mut mgr);
        assert_eq!(got.len(), 1);
        assert!(matches!(
            &got[0],
            Event::AddressSuggested { session: Some(s), .. } if *s == session
        ));
        assert_eq!(mgr.candidates(&p).len(), 1);
    }

    #[test]
    fn test_no_facts_no_suggestion() {
        let mut mgr = manager();
        mgr.received_event(&Event::AddressRequested { peer: peer(1) });
        assert!(suggestions(&mut mgr).is_empty());
    }

    #[test]
    fn test_lower_latency_wins() {
        let mut mgr = manager();
        let p = peer(1);
        let mut sessions = crate::session::SessionTable::new();
        let near = Address::new("tcp", vec![1], p);
        let far = Address::new("tcp", vec![2], p);

        for (address, millis) in [(&near, 10u64), (&far, 500)] {
            let session = sessions.insert(crate::session::SessionInfo {
                plugin: "tcp".to_owned(),
                peer: p,
                address: address.clone(),
                link: Link::Outbound,
                since: LocalTime::from_secs(100),
            });
            mgr.received_event(&Event::AddressValidated {
                peer: p,
                address: address.clone(),
            });
            mgr.received_event(&Event::SessionStarted {
                peer: p,
                session,
                address: address.clone(),
                link: Link::Outbound,
            });
            mgr.received_event(&Event::RttMeasured {
                peer: p,
                session,
                latency: LocalDuration::from_millis(millis),
            });
        }
        mgr.received_event(&Event::AddressRequested { peer: p });

        let got = suggestions(&mut mgr);
        assert!(matches!(
            &got[0],
            Event::AddressSuggested { address, .. } if address.bytes == vec![1]
        ));
    }

    #[test]
    fn test_invalidation_withdraws_fact() {
        let mut mgr = manager();
        let p = peer(1);
        let address = Address::new("tcp", vec![1], p);

        mgr.received_event(&Event::AddressValidated {
            peer: p,
            address: address.clone(),
        });
        assert_eq!(mgr.len(), 1);

        mgr.received_event(&Event::AddressInvalidated {
            peer: p,
            address,
        });
        assert!(mgr.is_empty());
    }
}
