//! Address validation.
//!
//! Before we believe that a binary address belongs to a claimed peer we must
//! see a fresh signature from that peer's key over the claim. Validation
//! entries track outstanding PING challenges and the revalidation schedule
//! of confirmed addresses.
use std::rc::Rc;

use log::*;

use switchyard_common::address::{Address, OwnAddress};
use switchyard_common::collections::HashMap;
use switchyard_common::identity::{self, Identity, PeerId, SignaturePurpose};
use switchyard_common::secp256k1::ecdsa;
use switchyard_common::time::{Clock, LocalDuration, LocalTime};

use super::hellomgr::HelloManager;
use super::output::{Io, Outbox};
use super::{DisconnectReason, Event};
use crate::message::{pong_signed_payload, Message, Ping, Pong};
use crate::session::{SessionId, SessionTable};

/// Lifetime of a signature we hand out in a PONG.
pub const SIGNATURE_LIFETIME: LocalDuration = LocalDuration::from_secs(60 * 60);
/// How long we wait for a PONG before dropping the entry.
pub const PING_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Floor of the revalidation delay.
pub const MIN_REVALIDATION: LocalDuration = LocalDuration::from_secs(1);
/// Ceiling of the revalidation delay.
pub const MAX_REVALIDATION: LocalDuration = LocalDuration::from_secs(60 * 60);
/// Ceiling of the revalidation delay while the address is in active use.
pub const CONNECTED_REVALIDATION: LocalDuration = LocalDuration::from_secs(60);

/// What became of a received PONG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PongDisposition {
    /// The PONG validated an address.
    Validated(Address),
    /// The PONG matched nothing or failed verification; counted.
    Discarded,
    /// The signature had already expired; the sender's (or our) clock is
    /// off.
    ClockSkew,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Validity {
    /// PING sent, awaiting the PONG.
    Probing { timeout: LocalTime },
    /// Signature verified; revalidate before `until` runs out.
    Valid {
        until: LocalTime,
        revalidate_at: LocalTime,
    },
}

/// One candidate address undergoing or holding validation. Multiple entries
/// per peer are disambiguated by challenge nonce.
#[derive(Debug, Clone)]
struct ValidationEntry {
    transport: String,
    bytes: Vec<u8>,
    challenge: u32,
    send_time: LocalTime,
    session: Option<SessionId>,
    /// Entries created for a session-reachability probe (PING without an
    /// address) die with their session.
    session_bound: bool,
    state: Validity,
}

impl ValidationEntry {
    fn address(&self, peer: PeerId) -> Address {
        Address::new(self.transport.clone(), self.bytes.clone(), peer)
    }

    fn is_valid(&self) -> bool {
        matches!(self.state, Validity::Valid { .. })
    }
}

struct CachedSignature {
    signature: ecdsa::Signature,
    expiration: LocalTime,
}

/// Runs the PING/PONG protocol and keeps the validation map.
pub struct ValidationManager<C> {
    identity: Rc<Identity>,
    /// Multimap: candidate addresses per peer.
    entries: HashMap<PeerId, Vec<ValidationEntry>>,
    /// Signatures we handed out, re-usable while fresh enough.
    signatures: HashMap<(u32, String, Vec<u8>), CachedSignature>,
    outbox: Outbox,
    rng: fastrand::Rng,
    clock: C,
}

impl<C: Clock> ValidationManager<C> {
    /// Create a new validation manager.
    pub fn new(identity: Rc<Identity>, rng: fastrand::Rng, clock: C) -> Self {
        Self {
            identity,
            entries: HashMap::with_hasher(rng.clone().into()),
            signatures: HashMap::with_hasher(rng.clone().into()),
            outbox: Outbox::new(),
            rng,
            clock,
        }
    }

    /// Drain the next output.
    pub fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }

    /// Fresh challenge nonce, unique within the peer's entry list.
    fn fresh_challenge(&mut self, peer: &PeerId) -> u32 {
        loop {
            let nonce = self.rng.u32(1..);
            let taken = self
                .entries
                .get(peer)
                .map_or(false, |es| es.iter().any(|e| e.challenge == nonce));
            if !taken {
                return nonce;
            }
        }
    }

    /// Begin validating a candidate address for a peer. A no-op when an
    /// entry for the same endpoint already exists.
    pub fn start(
        &mut self,
        peer: PeerId,
        transport: &str,
        bytes: &[u8],
        session: Option<SessionId>,
        sessions: &SessionTable,
    ) {
        if peer == self.identity.peer_id() {
            return;
        }
        if let Some(entries) = self.entries.get(&peer) {
            if entries
                .iter()
                .any(|e| e.transport == transport && e.bytes == bytes)
            {
                return;
            }
        }
        let now = self.clock.local_time();
        let challenge = self.fresh_challenge(&peer);
        let entry = ValidationEntry {
            transport: transport.to_owned(),
            bytes: bytes.to_vec(),
            challenge,
            send_time: now,
            session,
            session_bound: false,
            state: Validity::Probing {
                timeout: now + PING_TIMEOUT,
            },
        };
        debug!(
            target: "p2p",
            "{}: probing {}:{} bytes with challenge {}",
            peer, transport, bytes.len(), challenge
        );
        self.send_ping(&peer, &entry, sessions);
        self.entries.entry(peer).or_default().push(entry);
        self.outbox.set_timer(PING_TIMEOUT);
    }

    /// Begin a session-reachability probe: PING without an address, over the
    /// session itself. The peer confirms with a PONG-USING.
    pub fn start_session_probe(
        &mut self,
        peer: PeerId,
        session: SessionId,
        sessions: &SessionTable,
    ) {
        let Some(info) = sessions.get(session) else {
            return;
        };
        if let Some(entries) = self.entries.get(&peer) {
            if entries
                .iter()
                .any(|e| e.session == Some(session) && e.session_bound)
            {
                return;
            }
        }
        let now = self.clock.local_time();
        let challenge = self.fresh_challenge(&peer);
        let entry = ValidationEntry {
            transport: info.address.transport.clone(),
            bytes: info.address.bytes.clone(),
            challenge,
            send_time: now,
            session: Some(session),
            session_bound: true,
            state: Validity::Probing {
                timeout: now + PING_TIMEOUT,
            },
        };
        self.outbox.message(
            session,
            Message::Ping(Ping {
                nonce: challenge,
                target: peer,
                address: None,
            }),
        );
        self.entries.entry(peer).or_default().push(entry);
        self.outbox.set_timer(PING_TIMEOUT);
    }

    /// Deliver a PING: over a live session for the entry if one exists,
    /// otherwise over every known session to the peer, otherwise by asking
    /// for a dial.
    fn send_ping(&mut self, peer: &PeerId, entry: &ValidationEntry, sessions: &SessionTable) {
        let ping = Message::Ping(Ping {
            nonce: entry.challenge,
            target: *peer,
            address: Some((entry.transport.clone(), entry.bytes.clone())),
        });

        if let Some(session) = entry.session {
            if sessions.get(session).is_some() {
                self.outbox.message(session, ping);
                return;
            }
        }
        let candidates: Vec<SessionId> = sessions.by_peer(peer).map(|(id, _)| id).collect();
        if candidates.is_empty() {
            self.outbox.connect(entry.address(*peer));
            return;
        }
        for session in candidates {
            self.outbox.message(session, ping.clone());
        }
    }

    /// A session to a peer appeared; flush probes that were waiting for a
    /// path.
    pub fn session_started(&mut self, peer: PeerId, session: SessionId, sessions: &SessionTable) {
        let pending: Vec<ValidationEntry> = self
            .entries
            .get_mut(&peer)
            .map(|entries| {
                entries
                    .iter_mut()
                    .filter(|e| e.session.is_none() && !e.is_valid())
                    .map(|e| {
                        e.session = Some(session);
                        e.clone()
                    })
                    .collect()
            })
            .unwrap_or_default();

        for entry in pending {
            self.send_ping(&peer, &entry, sessions);
        }
    }

    /// Answer a PING addressed to us.
    pub fn received_ping(
        &mut self,
        peer: PeerId,
        session: SessionId,
        ping: &Ping,
        hellos: &HelloManager<C>,
        sessions: &SessionTable,
    ) -> Result<(), DisconnectReason> {
        if ping.target != self.identity.peer_id() {
            warn!(
                target: "p2p",
                "{}: PING for {} is not addressed to us", peer, ping.target
            );
            return Err(DisconnectReason::Misbehaving("ping for wrong target"));
        }

        let (purpose, transport, bytes) = match &ping.address {
            Some((transport, bytes)) => {
                // The pinger wants proof that this is one of our bindings.
                if !hellos.is_own_address(transport, bytes) {
                    debug!(
                        target: "p2p",
                        "{}: PING for an address we do not own", peer
                    );
                    return Err(DisconnectReason::Misbehaving("ping for foreign address"));
                }
                (SignaturePurpose::PongOwn, transport.clone(), bytes.clone())
            }
            None => {
                // The pinger is confirming the session path; sign over its
                // source address as we perceive it.
                let Some(info) = sessions.get(session) else {
                    return Ok(());
                };
                (
                    SignaturePurpose::PongUsing,
                    info.address.transport.clone(),
                    info.address.bytes.clone(),
                )
            }
        };

        let (signature, expiration) = self.sign_or_reuse(purpose, &transport, &bytes);
        let pong = Message::Pong(Box::new(Pong {
            nonce: ping.nonce,
            purpose,
            expiration,
            peer: self.identity.peer_id(),
            public_key: self.identity.public_key(),
            transport,
            address: bytes,
            signature,
        }));

        // Reply over the session the challenge arrived on; it is the one
        // path known to reach the pinger.
        self.outbox.message(session, pong);
        Ok(())
    }

    /// Sign a claim, or reuse a cached signature with more than a quarter of
    /// its lifetime remaining.
    fn sign_or_reuse(
        &mut self,
        purpose: SignaturePurpose,
        transport: &str,
        bytes: &[u8],
    ) -> (ecdsa::Signature, LocalTime) {
        let now = self.clock.local_time();
        let key = (purpose.code(), transport.to_owned(), bytes.to_vec());

        if let Some(cached) = self.signatures.get(&key) {
            if cached.expiration > now + SIGNATURE_LIFETIME / 4 {
                return (cached.signature, cached.expiration);
            }
        }

        let expiration = now + SIGNATURE_LIFETIME;
        let payload =
            pong_signed_payload(expiration, &self.identity.peer_id(), transport, bytes);
        let signature = self.identity.sign(purpose, &payload);

        self.signatures.insert(
            key,
            CachedSignature {
                signature,
                expiration,
            },
        );
        (signature, expiration)
    }

    /// Process a PONG from an authenticated sender.
    pub fn received_pong(&mut self, sender: PeerId, pong: &Pong) -> PongDisposition {
        let now = self.clock.local_time();

        if pong.peer != sender {
            warn!(
                target: "p2p",
                "{}: PONG claims to be from {}; discarding", sender, pong.peer
            );
            return PongDisposition::Discarded;
        }
        if PeerId::from_public_key(&pong.public_key) != pong.peer {
            warn!(target: "p2p", "{}: PONG key does not match identity", sender);
            return PongDisposition::Discarded;
        }
        if pong.expiration <= now {
            warn!(
                target: "p2p",
                "{}: PONG signature expired at {}; check your clock", sender, pong.expiration
            );
            return PongDisposition::ClockSkew;
        }
        if identity::verify(
            &pong.public_key,
            pong.purpose,
            &pong.signed_payload(),
            &pong.signature,
        )
        .is_err()
        {
            warn!(target: "p2p", "{}: PONG signature invalid", sender);
            return PongDisposition::Discarded;
        }

        // Locate the matching entry: nonce, and for ownership claims the
        // confirmed endpoint. Only the first match wins; the rest are
        // silently discarded.
        let Some(entries) = self.entries.get_mut(&sender) else {
            return PongDisposition::Discarded;
        };
        let matched = entries.iter_mut().find(|e| {
            e.challenge == pong.nonce
                && match pong.purpose {
                    SignaturePurpose::PongOwn => {
                        e.transport == pong.transport && e.bytes == pong.address
                    }
                    SignaturePurpose::PongUsing => e.session_bound,
                    SignaturePurpose::Revocation => false,
                }
        });
        let Some(entry) = matched else {
            debug!(target: "p2p", "{}: PONG matches no open challenge", sender);
            return PongDisposition::Discarded;
        };

        let revalidate_at = revalidation_deadline(now, pong.expiration, false, &mut self.rng);
        entry.state = Validity::Valid {
            until: pong.expiration,
            revalidate_at,
        };
        let address = entry.address(sender);

        if pong.purpose == SignaturePurpose::PongUsing {
            // The peer told us which address *we* appear at from its side.
            self.outbox.event(Event::ExternalAddressLearned {
                address: OwnAddress::new(pong.transport.clone(), pong.address.clone()),
            });
        }

        info!(target: "p2p", "{}: validated address {}", sender, address);
        self.outbox.event(Event::AddressValidated {
            peer: sender,
            address: address.clone(),
        });
        self.outbox.set_timer(revalidate_at - now);

        PongDisposition::Validated(address)
    }

    /// Walk a snapshot of the validation map: drop timed-out probes, expire
    /// stale validations, re-probe addresses nearing expiry.
    pub fn timer_expired(&mut self, connected: &dyn Fn(&PeerId) -> bool, sessions: &SessionTable) {
        let now = self.clock.local_time();
        let peers: Vec<PeerId> = self.entries.keys().copied().collect();

        for peer in peers {
            let is_connected = connected(&peer);
            let mut expired: Vec<Address> = Vec::new();
            let mut reprobe: Vec<ValidationEntry> = Vec::new();

            if let Some(entries) = self.entries.get_mut(&peer) {
                entries.retain_mut(|entry| match entry.state {
                    Validity::Probing { timeout } => {
                        if now >= timeout {
                            debug!(
                                target: "p2p",
                                "{}: validation probe timed out (challenge {})",
                                peer, entry.challenge
                            );
                            false
                        } else {
                            true
                        }
                    }
                    Validity::Valid {
                        until,
                        revalidate_at,
                    } => {
                        if now >= until {
                            expired.push(entry.address(peer));
                            false
                        } else {
                            if now >= revalidate_at {
                                reprobe.push(entry.clone());
                            }
                            true
                        }
                    }
                });
            }

            for address in expired {
                self.outbox.event(Event::AddressInvalidated { peer, address });
            }
            for stale in reprobe {
                let challenge = self.fresh_challenge(&peer);
                if let Some(entries) = self.entries.get_mut(&peer) {
                    if let Some(entry) = entries
                        .iter_mut()
                        .find(|e| e.challenge == stale.challenge)
                    {
                        entry.challenge = challenge;
                        entry.send_time = now;
                        if let Validity::Valid { until, .. } = entry.state {
                            // Stay valid while the refresh is in flight; back
                            // off the next attempt.
                            entry.state = Validity::Valid {
                                until,
                                revalidate_at: revalidation_deadline(
                                    now,
                                    until,
                                    is_connected,
                                    &mut self.rng,
                                ),
                            };
                        }
                        let refreshed = entry.clone();
                        self.send_ping(&peer, &refreshed, sessions);
                    }
                }
            }
            if let Some(entries) = self.entries.get(&peer) {
                if entries.is_empty() {
                    self.entries.remove(&peer);
                }
            }
        }
        self.outbox.set_timer(MIN_REVALIDATION);
    }

    /// A session died: unbind it everywhere; probes that only made sense
    /// over that session are dropped.
    pub fn session_ended(&mut self, session: SessionId) {
        for entries in self.entries.values_mut() {
            entries.retain_mut(|entry| {
                if entry.session == Some(session) {
                    entry.session = None;
                    if entry.session_bound && !entry.is_valid() {
                        return false;
                    }
                }
                true
            });
        }
        self.entries.retain(|_, entries| !entries.is_empty());
    }

    /// Addresses of a peer currently holding a valid signature.
    pub fn validated_addresses(&self, peer: &PeerId) -> Vec<Address> {
        self.entries
            .get(peer)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.is_valid())
                    .map(|e| e.address(*peer))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of validated addresses, across all peers.
    pub fn validated_count(&self) -> usize {
        self.entries
            .values()
            .map(|entries| entries.iter().filter(|e| e.is_valid()).count())
            .sum()
    }
}

/// When to refresh a validation: half the remaining lifetime, clamped, plus
/// up to a second of jitter; sooner when the address is in active use.
fn revalidation_deadline(
    now: LocalTime,
    until: LocalTime,
    connected: bool,
    rng: &mut fastrand::Rng,
) -> LocalTime {
    let remaining = until.duration_since(now);
    let mut delay = (remaining / 2).clamp(MIN_REVALIDATION, MAX_REVALIDATION);
    if connected {
        delay = delay.min(CONNECTED_REVALIDATION);
    }
    delay = delay.max(MIN_REVALIDATION) + LocalDuration::from_millis(rng.u64(0..1000));

    now + delay
}
