//! Wire messages exchanged between transport cores.
use std::io;

use switchyard_common::hello::Hello;
use switchyard_common::identity::{PeerId, SignaturePurpose};
use switchyard_common::secp256k1::{ecdsa, PublicKey};
use switchyard_common::time::LocalTime;
use switchyard_common::wire::{self, Decodable, Encodable};

/// Message type tags. These values are wire-visible and must never change.
pub mod tags {
    /// A peer's self-description.
    pub const HELLO: u16 = 1;
    /// Address validation challenge.
    pub const PING: u16 = 2;
    /// Address validation response.
    pub const PONG: u16 = 3;
    /// Connection handshake: initiator's intent.
    pub const SESSION_SYN: u16 = 4;
    /// Connection handshake: responder's acceptance.
    pub const SESSION_SYN_ACK: u16 = 5;
    /// Connection handshake: initiator's confirmation.
    pub const SESSION_ACK: u16 = 6;
    /// Graceful close.
    pub const SESSION_DISCONNECT: u16 = 7;
    /// Liveness probe.
    pub const SESSION_KEEPALIVE: u16 = 8;
    /// Liveness reply.
    pub const SESSION_KEEPALIVE_RESPONSE: u16 = 9;
    /// Peer-advertised inbound quota.
    pub const SESSION_QUOTA: u16 = 10;
    /// Opaque upper-layer payload.
    pub const PAYLOAD: u16 = 11;
}

/// An address validation challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Challenge nonce, echoed back in the PONG.
    pub nonce: u32,
    /// The identity the sender believes it is talking to.
    pub target: PeerId,
    /// The `(transport, address bytes)` to confirm ownership of. Absent when
    /// the sender is asking "am I reachable via the session we're on?".
    pub address: Option<(String, Vec<u8>)>,
}

/// An address validation response. The signature covers
/// `(purpose, expiration, peer, transport, address)`; the nonce is outside
/// the signature and only used for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// Nonce copied from the PING.
    pub nonce: u32,
    /// Which claim is being signed.
    pub purpose: SignaturePurpose,
    /// When the signature stops being valid.
    pub expiration: LocalTime,
    /// The identity making the claim.
    pub peer: PeerId,
    /// The signer's public key; must digest to `peer`.
    pub public_key: PublicKey,
    /// Carrier name of the confirmed address.
    pub transport: String,
    /// Confirmed address bytes.
    pub address: Vec<u8>,
    /// Signature over the claim.
    pub signature: ecdsa::Signature,
}

impl Pong {
    /// The byte blob the signature covers.
    pub fn signed_payload(&self) -> Vec<u8> {
        pong_signed_payload(
            self.expiration,
            &self.peer,
            &self.transport,
            &self.address,
        )
    }
}

/// Assemble the blob a PONG signature covers.
pub fn pong_signed_payload(
    expiration: LocalTime,
    peer: &PeerId,
    transport: &str,
    address: &[u8],
) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(&expiration.as_millis().to_be_bytes());
    blob.extend_from_slice(peer.as_bytes());
    blob.extend_from_slice(transport.as_bytes());
    blob.push(0);
    blob.extend_from_slice(address);
    blob
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A peer's self-description.
    Hello(Hello),
    /// Address validation challenge.
    Ping(Ping),
    /// Address validation response.
    Pong(Box<Pong>),
    /// Handshake: the initiator's intent to connect. The timestamp
    /// identifies this connection attempt.
    Syn {
        /// Initiator's send time; echoed in the SYN-ACK.
        timestamp: LocalTime,
    },
    /// Handshake: the responder's acceptance.
    SynAck {
        /// Timestamp of the SYN being answered.
        timestamp: LocalTime,
    },
    /// Handshake: the initiator's confirmation.
    Ack,
    /// Graceful close.
    Disconnect {
        /// Close time, to discard stale disconnects.
        timestamp: LocalTime,
    },
    /// Liveness probe.
    Keepalive {
        /// Matched against the response.
        nonce: u32,
    },
    /// Liveness reply; the receiver derives a round-trip time sample.
    KeepaliveResponse {
        /// Nonce copied from the probe.
        nonce: u32,
    },
    /// The sender's inbound bandwidth allowance for us, in bytes/second.
    Quota {
        /// Bytes per second we may send.
        bandwidth: u32,
    },
    /// Opaque upper-layer payload.
    Payload(Vec<u8>),
}

impl Message {
    /// The wire tag of this message.
    pub fn tag(&self) -> u16 {
        match self {
            Self::Hello(_) => tags::HELLO,
            Self::Ping(_) => tags::PING,
            Self::Pong(_) => tags::PONG,
            Self::Syn { .. } => tags::SESSION_SYN,
            Self::SynAck { .. } => tags::SESSION_SYN_ACK,
            Self::Ack => tags::SESSION_ACK,
            Self::Disconnect { .. } => tags::SESSION_DISCONNECT,
            Self::Keepalive { .. } => tags::SESSION_KEEPALIVE,
            Self::KeepaliveResponse { .. } => tags::SESSION_KEEPALIVE_RESPONSE,
            Self::Quota { .. } => tags::SESSION_QUOTA,
            Self::Payload(_) => tags::PAYLOAD,
        }
    }

    /// Short name for logging.
    pub fn cmd(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Syn { .. } => "syn",
            Self::SynAck { .. } => "syn-ack",
            Self::Ack => "ack",
            Self::Disconnect { .. } => "disconnect",
            Self::Keepalive { .. } => "keepalive",
            Self::KeepaliveResponse { .. } => "keepalive-response",
            Self::Quota { .. } => "quota",
            Self::Payload(_) => "payload",
        }
    }

    /// Size of the encoded message in bytes.
    pub fn encoded_size(&self) -> usize {
        wire::serialize(self).len()
    }
}

impl Encodable for Ping {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.nonce.encode(w)?;
        len += self.target.encode(w)?;
        match &self.address {
            None => len += false.encode(w)?,
            Some((transport, bytes)) => {
                len += true.encode(w)?;
                len += transport.encode(w)?;
                len += bytes.encode(w)?;
            }
        }
        Ok(len)
    }
}

impl Decodable for Ping {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, wire::Error> {
        let nonce = u32::decode(r)?;
        let target = PeerId::decode(r)?;
        let address = if bool::decode(r)? {
            Some((String::decode(r)?, Vec::<u8>::decode(r)?))
        } else {
            None
        };

        Ok(Self {
            nonce,
            target,
            address,
        })
    }
}

impl Encodable for Pong {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.nonce.encode(w)?;
        len += self.purpose.code().encode(w)?;
        len += self.expiration.encode(w)?;
        len += self.peer.encode(w)?;
        len += self.public_key.encode(w)?;
        len += self.transport.encode(w)?;
        len += self.address.encode(w)?;
        len += self.signature.encode(w)?;

        Ok(len)
    }
}

impl Decodable for Pong {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, wire::Error> {
        let nonce = u32::decode(r)?;
        let purpose = SignaturePurpose::from_code(u32::decode(r)?)
            .ok_or(wire::Error::InvalidValue("signature purpose"))?;
        let expiration = LocalTime::decode(r)?;
        let peer = PeerId::decode(r)?;
        let public_key = PublicKey::decode(r)?;
        let transport = String::decode(r)?;
        let address = Vec::<u8>::decode(r)?;
        let signature = ecdsa::Signature::decode(r)?;

        Ok(Self {
            nonce,
            purpose,
            expiration,
            peer,
            public_key,
            transport,
            address,
            signature,
        })
    }
}

impl Encodable for Message {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.tag().encode(w)?;

        len += match self {
            Self::Hello(hello) => hello.encode(w)?,
            Self::Ping(ping) => ping.encode(w)?,
            Self::Pong(pong) => pong.encode(w)?,
            Self::Syn { timestamp } => timestamp.encode(w)?,
            Self::SynAck { timestamp } => timestamp.encode(w)?,
            Self::Ack => 0,
            Self::Disconnect { timestamp } => timestamp.encode(w)?,
            Self::Keepalive { nonce } => nonce.encode(w)?,
            Self::KeepaliveResponse { nonce } => nonce.encode(w)?,
            Self::Quota { bandwidth } => bandwidth.encode(w)?,
            Self::Payload(bytes) => bytes.encode(w)?,
        };
        Ok(len)
    }
}

impl Decodable for Message {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, wire::Error> {
        let tag = u16::decode(r)?;

        match tag {
            tags::HELLO => Ok(Self::Hello(Hello::decode(r)?)),
            tags::PING => Ok(Self::Ping(Ping::decode(r)?)),
            tags::PONG => Ok(Self::Pong(Box::new(Pong::decode(r)?))),
            tags::SESSION_SYN => Ok(Self::Syn {
                timestamp: LocalTime::decode(r)?,
            }),
            tags::SESSION_SYN_ACK => Ok(Self::SynAck {
                timestamp: LocalTime::decode(r)?,
            }),
            tags::SESSION_ACK => Ok(Self::Ack),
            tags::SESSION_DISCONNECT => Ok(Self::Disconnect {
                timestamp: LocalTime::decode(r)?,
            }),
            tags::SESSION_KEEPALIVE => Ok(Self::Keepalive {
                nonce: u32::decode(r)?,
            }),
            tags::SESSION_KEEPALIVE_RESPONSE => Ok(Self::KeepaliveResponse {
                nonce: u32::decode(r)?,
            }),
            tags::SESSION_QUOTA => Ok(Self::Quota {
                bandwidth: u32::decode(r)?,
            }),
            tags::PAYLOAD => Ok(Self::Payload(Vec::<u8>::decode(r)?)),
            unknown => Err(wire::Error::UnknownTag(unknown)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_common::identity::Identity;
    use switchyard_common::wire::{deserialize, serialize};

    #[test]
    fn test_tags_roundtrip() {
        let mut rng = fastrand::Rng::with_seed(2);
        let identity = Identity::generate(&mut rng);
        let peer = identity.peer_id();

        let pong_payload =
            pong_signed_payload(LocalTime::from_secs(900), &peer, "tcp", &[1, 2, 3]);
        let messages = vec![
            Message::Hello(Hello::new(identity.public_key())),
            Message::Ping(Ping {
                nonce: 7,
                target: peer,
                address: Some(("tcp".to_owned(), vec![1, 2, 3])),
            }),
            Message::Pong(Box::new(Pong {
                nonce: 7,
                purpose: SignaturePurpose::PongOwn,
                expiration: LocalTime::from_secs(900),
                peer,
                public_key: identity.public_key(),
                transport: "tcp".to_owned(),
                address: vec![1, 2, 3],
                signature: identity.sign(SignaturePurpose::PongOwn, &pong_payload),
            })),
            Message::Syn {
                timestamp: LocalTime::from_secs(10),
            },
            Message::SynAck {
                timestamp: LocalTime::from_secs(10),
            },
            Message::Ack,
            Message::Disconnect {
                timestamp: LocalTime::from_secs(11),
            },
            Message::Keepalive { nonce: 1 },
            Message::KeepaliveResponse { nonce: 1 },
            Message::Quota { bandwidth: 65536 },
            Message::Payload(vec![0xaa; 128]),
        ];

        for message in messages {
            let encoded = serialize(&message);
            // The tag is the first two bytes, unchanged by the roundtrip.
            assert_eq!(
                u16::from_be_bytes([encoded[0], encoded[1]]),
                message.tag()
            );
            assert_eq!(deserialize::<Message>(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let encoded = serialize(&999u16);
        assert!(matches!(
            deserialize::<Message>(&encoded),
            Err(wire::Error::UnknownTag(999))
        ));
    }
}
