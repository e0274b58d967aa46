//! HELLOs: a peer's signed, self-describing set of reachable addresses.
use std::io;

use secp256k1::PublicKey;

use crate::address::OwnAddress;
use crate::identity::PeerId;
use crate::time::LocalTime;
use crate::wire::{self, decode_seq, encode_seq, Decodable, Encodable};

/// One advertised address inside a HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAddress {
    /// Carrier name.
    pub transport: String,
    /// Opaque address bytes.
    pub bytes: Vec<u8>,
    /// When this address stops being advertised.
    pub expiration: LocalTime,
}

impl Encodable for HelloAddress {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.transport.encode(w)?;
        len += self.bytes.encode(w)?;
        len += self.expiration.encode(w)?;

        Ok(len)
    }
}

impl Decodable for HelloAddress {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            transport: String::decode(r)?,
            bytes: Vec::<u8>::decode(r)?,
            expiration: LocalTime::decode(r)?,
        })
    }
}

/// A peer's self-description: identity key plus the addresses it claims to
/// be reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// The public key of the peer this HELLO describes.
    pub public_key: PublicKey,
    /// Advertised addresses.
    pub addresses: Vec<HelloAddress>,
}

impl Hello {
    /// Construct a HELLO for a key with no addresses yet.
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            addresses: Vec::new(),
        }
    }

    /// Construct from local bindings, all expiring at the same time.
    pub fn from_own_addresses<'a>(
        public_key: PublicKey,
        addresses: impl Iterator<Item = &'a OwnAddress>,
        expiration: LocalTime,
    ) -> Self {
        Self {
            public_key,
            addresses: addresses
                .map(|a| HelloAddress {
                    transport: a.transport.clone(),
                    bytes: a.bytes.clone(),
                    expiration,
                })
                .collect(),
        }
    }

    /// The identity this HELLO describes.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }

    /// Addresses that have not expired by `now`.
    pub fn live_addresses(&self, now: LocalTime) -> impl Iterator<Item = &HelloAddress> {
        self.addresses.iter().filter(move |a| a.expiration > now)
    }

    /// Whether every advertised address has expired.
    pub fn is_expired(&self, now: LocalTime) -> bool {
        self.live_addresses(now).next().is_none()
    }

    /// The latest expiration among the advertised addresses, or `now` if
    /// there are none.
    pub fn latest_expiration(&self, now: LocalTime) -> LocalTime {
        self.addresses
            .iter()
            .map(|a| a.expiration)
            .max()
            .unwrap_or(now)
    }

    /// Merge addresses from `other` into `self`, keeping the later
    /// expiration when both advertise the same endpoint. Returns `true` if
    /// anything changed.
    pub fn merge(&mut self, other: &Hello) -> bool {
        let mut changed = false;

        for addr in &other.addresses {
            match self
                .addresses
                .iter_mut()
                .find(|a| a.transport == addr.transport && a.bytes == addr.bytes)
            {
                Some(existing) => {
                    if addr.expiration > existing.expiration {
                        existing.expiration = addr.expiration;
                        changed = true;
                    }
                }
                None => {
                    self.addresses.push(addr.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}

impl Encodable for Hello {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.public_key.encode(w)?;
        len += encode_seq(&self.addresses, w)?;

        Ok(len)
    }
}

impl Decodable for Hello {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            public_key: PublicKey::decode(r)?,
            addresses: decode_seq(r)?,
        })
    }
}
