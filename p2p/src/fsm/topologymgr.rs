//! Connection topology and HELLO advertising.
//!
//! Keeps the connection count near its target, honours the friends policy,
//! paces peer search, and gossips known HELLOs to neighbours with a
//! per-HELLO bloom filter so nobody is offered the same HELLO twice.
use std::sync::Arc;

use log::*;

use switchyard_common::address::Address;
use switchyard_common::bloom::BloomFilter;
use switchyard_common::collections::{HashMap, HashSet};
use switchyard_common::hello::Hello;
use switchyard_common::identity::PeerId;
use switchyard_common::time::{Clock, LocalDuration, LocalTime};

use super::hellomgr::HelloManager;
use super::output::{Io, Outbox};
use super::{DisconnectReason, Event};
use crate::message::Message;
use crate::session::SessionId;

/// Floor of the peer-search retry delay.
pub const SEARCH_DELAY_MIN: LocalDuration = LocalDuration::from_secs(15);
/// Scale of the quadratic search slowdown.
const SEARCH_DELAY_SCALE: LocalDuration = LocalDuration::from_secs(15 * 60);
/// How long a failed stranger is left alone.
pub const STRANGER_HOLDDOWN: LocalDuration = LocalDuration::from_mins(60);
/// How long a failed friend is left alone.
pub const FRIEND_HOLDDOWN: LocalDuration = LocalDuration::from_mins(15);
/// Advertisement candidates expire after this long, at the latest.
pub const ADVERT_TTL: LocalDuration = LocalDuration::from_secs(60 * 60);
/// Minimum delay between candidate gathering sweeps.
pub const GATHER_INTERVAL: LocalDuration = LocalDuration::from_secs(5);

/// Topology configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Peers we treat as friends.
    pub friends: Vec<PeerId>,
    /// Whether only friends may be connected at all.
    pub friends_only: bool,
    /// Below this many connected friends, strangers are not admitted.
    pub minimum_friends: usize,
    /// Connection count we steer towards.
    pub target_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            friends: Vec::new(),
            friends_only: false,
            minimum_friends: 0,
            target_connections: 16,
        }
    }
}

#[derive(Debug)]
struct Advert {
    hello: Arc<Hello>,
    /// Neighbours this HELLO has already been offered to.
    offered: BloomFilter,
    expires: LocalTime,
}

/// Maintains the connection target and the HELLO advertisement state.
pub struct TopologyManager<C> {
    config: Config,
    friends: HashSet<PeerId>,
    adverts: HashMap<PeerId, Advert>,
    /// Peers we must not re-attempt until the given time.
    holddown: HashMap<PeerId, LocalTime>,
    next_search: LocalTime,
    last_gather: Option<LocalTime>,
    outbox: Outbox,
    rng: fastrand::Rng,
    clock: C,
}

impl<C: Clock> TopologyManager<C> {
    /// Create a new topology manager.
    pub fn new(config: Config, rng: fastrand::Rng, clock: C) -> Self {
        let mut friends = HashSet::with_hasher(rng.clone().into());
        friends.extend(config.friends.iter().copied());

        Self {
            config,
            friends,
            adverts: HashMap::with_hasher(rng.clone().into()),
            holddown: HashMap::with_hasher(rng.clone().into()),
            next_search: LocalTime::default(),
            last_gather: None,
            outbox: Outbox::new(),
            rng,
            clock,
        }
    }

    /// Initialize; arms the first search.
    pub fn initialize(&mut self) {
        self.next_search = self.clock.local_time();
        self.outbox.set_timer(SEARCH_DELAY_MIN);
    }

    /// Drain the next output.
    pub fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }

    /// Whether the peer is a friend.
    pub fn is_friend(&self, peer: &PeerId) -> bool {
        self.friends.contains(peer)
    }

    /// Whether policy admits connecting this peer, given how many friends
    /// are currently connected.
    pub fn admits(&self, peer: &PeerId, connected_friends: usize) -> bool {
        if self.is_friend(peer) {
            return true;
        }
        if self.config.friends_only {
            return false;
        }
        connected_friends >= self.config.minimum_friends
    }

    /// React to protocol events.
    pub fn received_event(&mut self, event: &Event) {
        match event {
            Event::HelloDiscovered { peer, hello } => {
                self.candidate(*peer, hello.clone());
            }
            Event::NeighbourConnected { peer, session, .. } => {
                self.advertise_to(*peer, *session);
            }
            Event::NeighbourDisconnected { peer, reason } => {
                if matches!(reason, DisconnectReason::Timeout(_)) {
                    self.connect_failed(*peer);
                }
            }
            _ => {}
        }
    }

    /// Remember a peer's HELLO as an advertisement candidate.
    fn candidate(&mut self, peer: PeerId, hello: Arc<Hello>) {
        let now = self.clock.local_time();
        if hello.addresses.is_empty() {
            return;
        }
        let expires = hello.latest_expiration(now).min(now + ADVERT_TTL);
        let tweak = self.rng.u32(..);

        self.adverts
            .entry(peer)
            .and_modify(|advert| {
                advert.hello = hello.clone();
                advert.expires = expires;
            })
            .or_insert_with(|| Advert {
                hello,
                offered: BloomFilter::new(tweak),
                expires,
            });
    }

    /// Offer one HELLO to a freshly connected neighbour, bloom-suppressed.
    fn advertise_to(&mut self, neighbour: PeerId, session: SessionId) {
        let pick = self.adverts.iter_mut().find(|(owner, advert)| {
            **owner != neighbour && !advert.offered.contains(neighbour.as_bytes())
        });
        let Some((owner, advert)) = pick else {
            return;
        };
        let owner = *owner;

        advert.offered.insert(neighbour.as_bytes());
        let hello = (*advert.hello).clone();
        self.outbox.message(session, Message::Hello(hello));
        self.outbox.event(Event::HelloAdvertised { peer: neighbour });
        debug!(target: "p2p", "{}: advertised hello of {}", neighbour, owner);
    }

    /// Record a failed connect attempt; the peer is left alone for a while.
    pub fn connect_failed(&mut self, peer: PeerId) {
        let now = self.clock.local_time();
        let holddown = if self.is_friend(&peer) {
            FRIEND_HOLDDOWN
        } else {
            STRANGER_HOLDDOWN
        };
        debug!(target: "p2p", "{}: connect failed, holding down for {}", peer, holddown);
        self.holddown.insert(peer, now + holddown);
    }

    /// Retry delay: slows quadratically above target, speeds up far below.
    fn search_delay(&self, connected: usize) -> LocalDuration {
        let target = self.config.target_connections.max(1) as u64;
        let current = connected as u64;
        let scaled = SEARCH_DELAY_SCALE.as_millis() * current * current / (target * target);

        (SEARCH_DELAY_MIN + LocalDuration::from_millis(scaled)).max(SEARCH_DELAY_MIN)
    }

    /// Periodic maintenance: expire adverts and holddowns, search for new
    /// peers when below target, and gossip to connected neighbours.
    pub fn timer_expired(
        &mut self,
        hellos: &HelloManager<C>,
        connected: &[(PeerId, Option<SessionId>)],
        connected_friends: usize,
    ) {
        let now = self.clock.local_time();

        self.adverts.retain(|_, advert| advert.expires > now);
        self.holddown.retain(|_, until| *until > now);

        // Top up advertisement candidates from the HELLO store, bounded by
        // a minimum inter-gather delay.
        if self
            .last_gather
            .map_or(true, |last| now.duration_since(last) >= GATHER_INTERVAL)
        {
            self.last_gather = Some(now);
            let fresh: Vec<(PeerId, Arc<Hello>)> = hellos
                .hellos()
                .filter(|(peer, _)| !self.adverts.contains_key(*peer))
                .map(|(peer, hello)| (*peer, hello.clone()))
                .collect();
            for (peer, hello) in fresh {
                self.candidate(peer, hello);
            }
        }

        // Search for a connectable peer when below target.
        if now >= self.next_search {
            self.next_search = now + self.search_delay(connected.len());
            self.outbox.set_timer(self.search_delay(connected.len()));

            if connected.len() < self.config.target_connections {
                let connected_set: Vec<PeerId> = connected.iter().map(|(p, _)| *p).collect();
                let pick = self
                    .adverts
                    .iter()
                    .filter(|(peer, _)| !connected_set.contains(*peer))
                    .filter(|(peer, _)| !self.holddown.contains_key(*peer))
                    .filter(|(peer, _)| self.admits(*peer, connected_friends))
                    .find_map(|(peer, advert)| {
                        advert
                            .hello
                            .live_addresses(now)
                            .next()
                            .map(|a| (*peer, a.transport.clone(), a.bytes.clone()))
                    });
                if let Some((peer, transport, bytes)) = pick {
                    info!(target: "p2p", "{}: attempting connection via {}", peer, transport);
                    self.outbox.connect(Address::new(transport, bytes, peer));
                }
            }
        }

        // Keep gossiping to connected neighbours.
        let targets: Vec<(PeerId, SessionId)> = connected
            .iter()
            .filter_map(|(p, s)| s.map(|s| (*p, s)))
            .collect();
        for (peer, session) in targets {
            self.advertise_to(peer, session);
        }
    }

    /// Number of advertisement candidates.
    pub fn len(&self) -> usize {
        self.adverts.len()
    }

    /// Whether there are no candidates.
    pub fn is_empty(&self) -> bool {
        self.adverts.is_empty()
    }
}
