//! Carrier addresses.
//!
//! The core treats the binary part of an address as opaque: only the carrier
//! driver that described it can interpret it.
use std::fmt;
use std::io;

use crate::identity::PeerId;
use crate::wire::{self, Decodable, Encodable};

/// Address property flags.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct AddressFlags(u16);

impl AddressFlags {
    /// No flags set.
    pub const NONE: AddressFlags = AddressFlags(0);
    /// The address was learned from an inbound session and may not be
    /// reachable from the outside.
    pub const INBOUND: AddressFlags = AddressFlags(1);

    /// Check whether all flags in `other` are set.
    pub fn has(&self, other: AddressFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Construct from raw bits.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for AddressFlags {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A peer-qualified carrier address: which carrier, which bytes, which peer
/// claims it. Two addresses are equal iff all fields and flags match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Name of the carrier that understands `bytes`, eg. `"tcp"`.
    pub transport: String,
    /// Opaque carrier-level address bytes.
    pub bytes: Vec<u8>,
    /// The peer this address claims to terminate at.
    pub peer: PeerId,
    /// Property flags.
    pub flags: AddressFlags,
}

impl Address {
    /// Construct an address with no flags.
    pub fn new(transport: impl Into<String>, bytes: Vec<u8>, peer: PeerId) -> Self {
        Self {
            transport: transport.into(),
            bytes,
            peer,
            flags: AddressFlags::NONE,
        }
    }

    /// Whether this address was learned from an inbound session.
    pub fn is_inbound(&self) -> bool {
        self.flags.has(AddressFlags::INBOUND)
    }

    /// The `(transport, bytes)` pair without the peer qualification.
    pub fn endpoint(&self) -> (&str, &[u8]) {
        (&self.transport, &self.bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        for byte in &self.bytes {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "@{}", self.peer)
    }
}

impl Encodable for Address {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.transport.encode(w)?;
        len += self.bytes.encode(w)?;
        len += self.peer.encode(w)?;
        len += self.flags.bits().encode(w)?;

        Ok(len)
    }
}

impl Decodable for Address {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, wire::Error> {
        let transport = String::decode(r)?;
        let bytes = Vec::<u8>::decode(r)?;
        let peer = PeerId::decode(r)?;
        let flags = AddressFlags::from_bits(u16::decode(r)?);

        Ok(Self {
            transport,
            bytes,
            peer,
            flags,
        })
    }
}

/// A local carrier binding, as announced by a plugin. Unlike [`Address`] it
/// carries no peer: it is ours by definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnAddress {
    /// Name of the carrier holding the binding.
    pub transport: String,
    /// Opaque carrier-level address bytes.
    pub bytes: Vec<u8>,
}

impl OwnAddress {
    /// Construct a local binding.
    pub fn new(transport: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            transport: transport.into(),
            bytes,
        }
    }

    /// Qualify with a peer, producing a full [`Address`].
    pub fn for_peer(&self, peer: PeerId) -> Address {
        Address::new(self.transport.clone(), self.bytes.clone(), peer)
    }
}

impl fmt::Display for OwnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        for byte in &self.bytes {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
