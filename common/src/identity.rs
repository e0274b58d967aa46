//! Peer identities and the signatures the transport protocol relies on.
//!
//! A peer is addressed by the digest of its public key; the key itself
//! travels inside HELLOs and PONGs so that receivers can verify signatures
//! against the claimed identity.
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use bitcoin_hashes::{sha256, Hash};
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use crate::time::LocalTime;

/// Size in bytes of a peer identity digest.
pub const PEER_ID_SIZE: usize = 32;
/// Size in bytes of a serialized (compressed) public key.
pub const PUBLIC_KEY_SIZE: usize = 33;
/// Size in bytes of a compact signature.
pub const SIGNATURE_SIZE: usize = 64;

/// The stable address of a remote participant: the SHA-256 digest of its
/// public key. Equality is bytewise; the derived ordering is used for
/// deterministic tie-breaking between two peers.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Derive a peer identity from a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = sha256::Hash::hash(&key.serialize());
        Self(digest.into_inner())
    }

    /// Construct from raw digest bytes.
    pub const fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// The all-zero identity, used on the wire to mean "every peer".
    pub const fn zero() -> Self {
        Self([0; PEER_ID_SIZE])
    }

    /// Whether this is the all-zero wildcard identity.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; PEER_ID_SIZE]
    }

    /// The raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PEER_ID_SIZE * 2 {
            return Err(IdentityError::InvalidPeerId);
        }
        let mut bytes = [0; PEER_ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| IdentityError::InvalidPeerId)?;
        }
        Ok(Self(bytes))
    }
}

/// Hex rendering of the full identity, for the friends file and logs.
pub fn encode_peer_id(id: &PeerId) -> String {
    let mut s = String::with_capacity(PEER_ID_SIZE * 2);
    for byte in id.as_bytes() {
        s.push_str(&format!("{:02x}", byte));
    }
    s
}

/// What a signature covers. The code is bound into the signed blob so a
/// signature produced for one purpose can never be replayed for another.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SignaturePurpose {
    /// "This address belongs to me."
    PongOwn,
    /// "I am reaching you via the address you showed me."
    PongUsing,
    /// Key revocation.
    Revocation,
}

impl SignaturePurpose {
    /// Fixed wire code of the purpose.
    pub fn code(&self) -> u32 {
        match self {
            Self::PongOwn => 1,
            Self::PongUsing => 2,
            Self::Revocation => 3,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PongOwn),
            2 => Some(Self::PongUsing),
            3 => Some(Self::Revocation),
            _ => None,
        }
    }
}

impl fmt::Display for SignaturePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PongOwn => write!(f, "pong-own"),
            Self::PongUsing => write!(f, "pong-using"),
            Self::Revocation => write!(f, "revocation"),
        }
    }
}

/// An identity error.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// An I/O error reading or writing the key file.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The key file contents are not a usable secret key.
    #[error("invalid secret key material")]
    InvalidKey,
    /// A peer identity string or digest could not be parsed.
    #[error("invalid peer identity")]
    InvalidPeerId,
    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// The signed payload's expiration is already past.
    #[error("signature expired at {0}; check your clock")]
    Expired(LocalTime),
}

/// The local peer's key pair.
pub struct Identity {
    secret: SecretKey,
    public: PublicKey,
    id: PeerId,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.id)
    }
}

impl Identity {
    /// Construct an identity from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| IdentityError::InvalidKey)?;
        Ok(Self::from_secret(secret))
    }

    /// Construct an identity from a secret key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        let id = PeerId::from_public_key(&public);

        Self { secret, public, id }
    }

    /// Generate a fresh identity from the given entropy source.
    pub fn generate(rng: &mut fastrand::Rng) -> Self {
        loop {
            let mut bytes = [0u8; 32];
            for byte in bytes.iter_mut() {
                *byte = rng.u8(..);
            }
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                return Self::from_secret(secret);
            }
        }
    }

    /// Load the identity from a key file, creating a fresh one if the file
    /// does not exist yet.
    pub fn load_or_generate(
        path: &Path,
        rng: &mut fastrand::Rng,
    ) -> Result<Self, IdentityError> {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_secret_bytes(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate(rng);
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(path, identity.secret.secret_bytes())?;
                Ok(identity)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Our peer identity.
    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    /// Our public key.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Sign a payload under the given purpose.
    pub fn sign(&self, purpose: SignaturePurpose, payload: &[u8]) -> ecdsa::Signature {
        let secp = Secp256k1::new();
        let msg = signed_digest(purpose, payload);
        secp.sign_ecdsa(&msg, &self.secret)
    }
}

/// Digest of a purpose-prefixed payload: `purpose_size ‖ purpose_code ‖ payload`,
/// all integers big-endian.
fn signed_digest(purpose: SignaturePurpose, payload: &[u8]) -> Message {
    let mut blob = Vec::with_capacity(8 + payload.len());
    blob.extend_from_slice(&(8u32 + payload.len() as u32).to_be_bytes());
    blob.extend_from_slice(&purpose.code().to_be_bytes());
    blob.extend_from_slice(payload);

    let digest = sha256::Hash::hash(&blob);
    Message::from_slice(&digest.into_inner()).expect("sha256 digest is a valid message")
}

/// Verify a signature over a purpose-prefixed payload.
pub fn verify(
    key: &PublicKey,
    purpose: SignaturePurpose,
    payload: &[u8],
    signature: &ecdsa::Signature,
) -> Result<(), IdentityError> {
    let secp = Secp256k1::verification_only();
    let msg = signed_digest(purpose, payload);

    secp.verify_ecdsa(&msg, signature, key)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let mut rng = fastrand::Rng::with_seed(1);
        let identity = Identity::generate(&mut rng);

        let sig = identity.sign(SignaturePurpose::PongOwn, b"10.0.0.1:1024");

        assert!(verify(
            &identity.public_key(),
            SignaturePurpose::PongOwn,
            b"10.0.0.1:1024",
            &sig
        )
        .is_ok());
        // A different purpose over the same payload does not verify.
        assert!(verify(
            &identity.public_key(),
            SignaturePurpose::PongUsing,
            b"10.0.0.1:1024",
            &sig
        )
        .is_err());
        // Neither does a different payload.
        assert!(verify(
            &identity.public_key(),
            SignaturePurpose::PongOwn,
            b"10.0.0.2:1024",
            &sig
        )
        .is_err());
    }

    #[test]
    fn test_peer_id_roundtrip() {
        let mut rng = fastrand::Rng::with_seed(7);
        let identity = Identity::generate(&mut rng);
        let id = identity.peer_id();

        let encoded = encode_peer_id(&id);
        assert_eq!(encoded.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_key_file_roundtrip() {
        let mut rng = fastrand::Rng::with_seed(3);
        let dir = std::env::temp_dir().join("switchyard-identity-test");
        let path = dir.join("private.key");
        let _ = std::fs::remove_file(&path);

        let first = Identity::load_or_generate(&path, &mut rng).unwrap();
        let second = Identity::load_or_generate(&path, &mut rng).unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_tie_break_ordering_is_total() {
        let mut rng = fastrand::Rng::with_seed(11);
        let a = Identity::generate(&mut rng).peer_id();
        let b = Identity::generate(&mut rng).peer_id();

        assert_ne!(a, b);
        assert_eq!(a < b, !(b < a));
    }
}
