//! Own-HELLO maintenance and the peer HELLO store.
//!
//! Our HELLO is a pure function of the live local bindings across all
//! carriers; it is rebuilt and re-broadcast on every change. HELLOs learned
//! from the network are kept here for the validator and the topology
//! component to draw from.
use std::rc::Rc;
use std::sync::Arc;

use log::*;

use switchyard_common::address::OwnAddress;
use switchyard_common::collections::HashMap;
use switchyard_common::hello::Hello;
use switchyard_common::identity::{Identity, PeerId};
use switchyard_common::time::{Clock, LocalDuration, LocalTime};

use super::event::Event;
use super::output::Outbox;
use crate::plugin::AddressChange;

/// How long the addresses in our own HELLO stay valid. Configuration may
/// raise or lower this but never to zero.
pub const DEFAULT_HELLO_EXPIRATION: LocalDuration = LocalDuration::from_secs(12 * 60 * 60);

/// HELLO manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Validity interval of our own HELLO.
    pub hello_expiration: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hello_expiration: DEFAULT_HELLO_EXPIRATION,
        }
    }
}

/// Maintains our own HELLO and the store of peer HELLOs.
#[derive(Debug)]
pub struct HelloManager<C> {
    config: Config,
    identity: Rc<Identity>,
    /// Live local bindings, in announcement order.
    own_addresses: Vec<OwnAddress>,
    /// Externally confirmed addresses learned from PONG-USING replies.
    confirmed_external: Vec<OwnAddress>,
    /// Our current self-description.
    own_hello: Arc<Hello>,
    /// Latest known HELLO per peer.
    peers: HashMap<PeerId, Arc<Hello>>,
    outbox: Outbox,
    clock: C,
}

impl<C: Clock> HelloManager<C> {
    /// Create a new HELLO manager.
    pub fn new(config: Config, identity: Rc<Identity>, rng: fastrand::Rng, clock: C) -> Self {
        let own_hello = Arc::new(Hello::new(identity.public_key()));

        Self {
            config,
            identity,
            own_addresses: Vec::new(),
            confirmed_external: Vec::new(),
            own_hello,
            peers: HashMap::with_hasher(rng.into()),
            outbox: Outbox::new(),
            clock,
        }
    }

    /// Initialize; announces the (empty) initial HELLO.
    pub fn initialize(&mut self) {
        self.rebuild();
    }

    /// Drain the next output.
    pub fn next(&mut self) -> Option<super::output::Io> {
        self.outbox.next()
    }

    /// A carrier announced or withdrew a local binding.
    pub fn address_changed(&mut self, change: AddressChange, address: OwnAddress) {
        match change {
            AddressChange::Added => {
                if self.own_addresses.contains(&address) {
                    return;
                }
                debug!(target: "p2p", "Local address added: {}", address);
                self.own_addresses.push(address);
            }
            AddressChange::Removed => {
                let before = self.own_addresses.len();
                self.own_addresses.retain(|a| *a != address);
                self.confirmed_external.retain(|a| *a != address);
                if self.own_addresses.len() == before {
                    return;
                }
                debug!(target: "p2p", "Local address removed: {}", address);
            }
        }
        self.rebuild();
    }

    /// A PONG-USING reply confirmed how the outside world sees us.
    pub fn external_address_confirmed(&mut self, address: OwnAddress) {
        if self.own_addresses.contains(&address) || self.confirmed_external.contains(&address) {
            return;
        }
        info!(target: "p2p", "Externally visible address confirmed: {}", address);
        self.confirmed_external.push(address);
        self.rebuild();
    }

    /// Rebuild the self-HELLO from a snapshot of every carrier's bindings,
    /// each visited exactly once, and announce the change.
    fn rebuild(&mut self) {
        let now = self.clock.local_time();
        let expiration = now + self.config.hello_expiration;
        let addresses: Vec<&OwnAddress> = self
            .own_addresses
            .iter()
            .chain(self.confirmed_external.iter())
            .collect();

        let hello = Hello::from_own_addresses(
            self.identity.public_key(),
            addresses.into_iter(),
            expiration,
        );

        self.own_hello = Arc::new(hello);
        self.outbox.event(Event::OwnHelloChanged {
            hello: self.own_hello.clone(),
        });
    }

    /// Our current HELLO.
    pub fn own_hello(&self) -> Arc<Hello> {
        self.own_hello.clone()
    }

    /// Whether the endpoint is one of our bindings, announced by a carrier
    /// or confirmed from outside.
    pub fn is_own_address(&self, transport: &str, bytes: &[u8]) -> bool {
        self.own_addresses
            .iter()
            .chain(self.confirmed_external.iter())
            .any(|a| a.transport == transport && a.bytes == bytes)
    }

    /// Ingest a HELLO received from the network. It may describe the sender
    /// or a third party. Returns the peer it describes when it taught us
    /// something new.
    pub fn received_hello(&mut self, hello: Hello) -> Option<(PeerId, Arc<Hello>)> {
        let peer = hello.peer_id();
        let now = self.clock.local_time();

        if peer == self.identity.peer_id() {
            return None;
        }
        if hello.is_expired(now) {
            debug!(target: "p2p", "{}: discarding expired hello", peer);
            return None;
        }

        let changed = match self.peers.get_mut(&peer) {
            Some(existing) => {
                let mut merged = (**existing).clone();
                if merged.merge(&hello) {
                    *existing = Arc::new(merged);
                    true
                } else {
                    false
                }
            }
            None => {
                self.peers.insert(peer, Arc::new(hello));
                true
            }
        };

        if changed {
            let hello = self.peers[&peer].clone();
            self.outbox.event(Event::HelloDiscovered {
                peer,
                hello: hello.clone(),
            });
            Some((peer, hello))
        } else {
            None
        }
    }

    /// The stored HELLO of a peer.
    pub fn hello_of(&self, peer: &PeerId) -> Option<Arc<Hello>> {
        self.peers.get(peer).cloned()
    }

    /// Iterate over all stored peer HELLOs.
    pub fn hellos(&self) -> impl Iterator<Item = (&PeerId, &Arc<Hello>)> {
        self.peers.iter()
    }

    /// Number of stored peer HELLOs.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Drop peer HELLOs whose every address expired.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();
        self.peers.retain(|_, hello| !hello.is_expired(now));

        // Re-stamp our own HELLO before its addresses run out.
        let refresh_at = self.own_hello.latest_expiration(now)
            - self.config.hello_expiration / 4;
        if !self.own_hello.addresses.is_empty() && now >= refresh_at {
            self.rebuild();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Io;
    use switchyard_common::time::RefClock;

    fn manager() -> HelloManager<RefClock> {
        let mut rng = fastrand::Rng::with_seed(17);
        let identity = Rc::new(Identity::generate(&mut rng));
        let clock = RefClock::from(LocalTime::from_secs(1000));

        HelloManager::new(Config::default(), identity, fastrand::Rng::with_seed(18), clock)
    }

    fn drain_hello_events<C: Clock>(mgr: &mut HelloManager<C>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(io) = mgr.next() {
            if let Io::Event(e) = io {
                events.push(e);
            }
        }
        events
    }

    #[test]
    fn test_rebuild_includes_every_binding_once() {
        let mut mgr = manager();
        mgr.initialize();
        mgr.address_changed(AddressChange::Added, OwnAddress::new("tcp", vec![1]));
        mgr.address_changed(AddressChange::Added, OwnAddress::new("udp", vec![2]));
        // Duplicate announcement is ignored.
        mgr.address_changed(AddressChange::Added, OwnAddress::new("tcp", vec![1]));

        let hello = mgr.own_hello();
        assert_eq!(hello.addresses.len(), 2);
        assert!(mgr.is_own_address("tcp", &[1]));
        assert!(mgr.is_own_address("udp", &[2]));

        mgr.address_changed(AddressChange::Removed, OwnAddress::new("tcp", vec![1]));
        assert_eq!(mgr.own_hello().addresses.len(), 1);
        assert!(!mgr.is_own_address("tcp", &[1]));
    }

    #[test]
    fn test_change_announcements() {
        let mut mgr = manager();
        mgr.initialize();
        let _ = drain_hello_events(&mut mgr);

        mgr.address_changed(AddressChange::Added, OwnAddress::new("tcp", vec![1]));
        let events = drain_hello_events(&mut mgr);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::OwnHelloChanged { .. })));
    }

    #[test]
    fn test_received_hello_store() {
        let mut mgr = manager();
        mgr.initialize();

        let mut rng = fastrand::Rng::with_seed(77);
        let other = Identity::generate(&mut rng);
        let hello = Hello::from_own_addresses(
            other.public_key(),
            [OwnAddress::new("tcp", vec![9])].iter(),
            LocalTime::from_secs(5000),
        );

        let learned = mgr.received_hello(hello.clone());
        assert!(learned.is_some());
        assert_eq!(mgr.len(), 1);

        // The same hello teaches nothing new.
        assert!(mgr.received_hello(hello).is_none());

        // Our own hello is never stored.
        let own = (*mgr.own_hello()).clone();
        assert!(mgr.received_hello(own).is_none());
    }

    #[test]
    fn test_expired_hellos_are_pruned() {
        let mut mgr = manager();
        mgr.initialize();

        let mut rng = fastrand::Rng::with_seed(78);
        let other = Identity::generate(&mut rng);
        let hello = Hello::from_own_addresses(
            other.public_key(),
            [OwnAddress::new("tcp", vec![9])].iter(),
            LocalTime::from_secs(2000),
        );
        mgr.received_hello(hello);
        assert_eq!(mgr.len(), 1);

        mgr.clock.set(LocalTime::from_secs(2001));
        mgr.timer_expired();
        assert_eq!(mgr.len(), 0);
    }
}
