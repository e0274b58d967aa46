//! Key revocation with proof-of-work.
//!
//! Before the network accepts a revocation it must carry evidence of
//! computational effort: a nonce such that `sha256(key ‖ nonce)` has a
//! configured number of leading zero bits, alongside a signature by the
//! revoked key itself.
use std::io;
use std::path::Path;

use switchyard_common::bitcoin_hashes::{sha256, Hash};
use thiserror::Error;

use switchyard_common::identity::{self, Identity, SignaturePurpose};
use switchyard_common::secp256k1::{ecdsa, PublicKey};
use switchyard_common::wire::{self, Decodable, Encodable};

/// Default difficulty, in leading zero bits.
pub const DEFAULT_WORKBITS: u32 = 22;

/// A revocation error.
#[derive(Debug, Error)]
pub enum RevocationError {
    /// An I/O error reading or writing the certificate.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The certificate file does not decode.
    #[error("malformed certificate: {0}")]
    Decode(#[from] wire::Error),
    /// The nonce does not meet the required difficulty.
    #[error("proof of work has {got} leading zero bits, {want} required")]
    InsufficientWork {
        /// Bits achieved by the stored nonce.
        got: u32,
        /// Bits demanded by configuration.
        want: u32,
    },
    /// The signature does not verify under the revoked key.
    #[error("invalid revocation signature")]
    BadSignature,
    /// The certificate revokes a different key.
    #[error("certificate is not for this ego")]
    WrongKey,
}

/// A self-signed, work-backed revocation of a public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationCertificate {
    /// The key being revoked.
    pub public_key: PublicKey,
    /// Signature by the revoked key over itself.
    pub signature: ecdsa::Signature,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl Encodable for RevocationCertificate {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.public_key.encode(w)?;
        len += self.signature.encode(w)?;
        len += self.nonce.encode(w)?;

        Ok(len)
    }
}

impl Decodable for RevocationCertificate {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            public_key: PublicKey::decode(r)?,
            signature: ecdsa::Signature::decode(r)?,
            nonce: u64::decode(r)?,
        })
    }
}

/// Leading zero bits of `sha256(key ‖ nonce)`.
fn work_bits(key: &PublicKey, nonce: u64) -> u32 {
    let mut blob = Vec::with_capacity(41);
    blob.extend_from_slice(&key.serialize());
    blob.extend_from_slice(&nonce.to_be_bytes());
    let digest = sha256::Hash::hash(&blob);

    let mut bits = 0;
    for byte in digest.into_inner() {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Search for a nonce meeting the difficulty. Starts from a random offset
/// so parallel searches don't collide.
pub fn search_nonce(key: &PublicKey, workbits: u32, rng: &mut fastrand::Rng) -> u64 {
    let mut nonce = rng.u64(..);
    loop {
        if work_bits(key, nonce) >= workbits {
            return nonce;
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Produce a revocation certificate for our own key.
pub fn revoke(identity: &Identity, workbits: u32, rng: &mut fastrand::Rng) -> RevocationCertificate {
    let public_key = identity.public_key();
    let nonce = search_nonce(&public_key, workbits, rng);
    let signature = identity.sign(SignaturePurpose::Revocation, &public_key.serialize());

    RevocationCertificate {
        public_key,
        signature,
        nonce,
    }
}

/// Check a certificate's work and signature.
pub fn validate(
    certificate: &RevocationCertificate,
    workbits: u32,
) -> Result<(), RevocationError> {
    let got = work_bits(&certificate.public_key, certificate.nonce);
    if got < workbits {
        return Err(RevocationError::InsufficientWork { got, want: workbits });
    }
    identity::verify(
        &certificate.public_key,
        SignaturePurpose::Revocation,
        &certificate.public_key.serialize(),
        &certificate.signature,
    )
    .map_err(|_| RevocationError::BadSignature)
}

/// Check that a certificate revokes the given key.
pub fn validate_for(
    certificate: &RevocationCertificate,
    key: &PublicKey,
    workbits: u32,
) -> Result<(), RevocationError> {
    if certificate.public_key != *key {
        return Err(RevocationError::WrongKey);
    }
    validate(certificate, workbits)
}

/// Write a certificate to disk.
pub fn store(certificate: &RevocationCertificate, path: &Path) -> Result<(), RevocationError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, wire::serialize(certificate))?;
    Ok(())
}

/// Read a certificate back from disk.
pub fn load(path: &Path) -> Result<RevocationCertificate, RevocationError> {
    let bytes = std::fs::read(path)?;
    Ok(wire::deserialize(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_WORKBITS: u32 = 5;

    fn identity(seed: u64) -> Identity {
        let mut rng = fastrand::Rng::with_seed(seed);
        Identity::generate(&mut rng)
    }

    #[test]
    fn test_revoke_and_validate() {
        let identity = identity(1);
        let mut rng = fastrand::Rng::with_seed(2);

        let certificate = revoke(&identity, TEST_WORKBITS, &mut rng);
        assert!(validate(&certificate, TEST_WORKBITS).is_ok());
        assert!(validate_for(&certificate, &identity.public_key(), TEST_WORKBITS).is_ok());
    }

    #[test]
    fn test_insufficient_work_is_rejected() {
        let identity = identity(1);
        let mut rng = fastrand::Rng::with_seed(2);
        let mut certificate = revoke(&identity, TEST_WORKBITS, &mut rng);

        // Find a nonce that does *not* meet a high difficulty.
        while work_bits(&certificate.public_key, certificate.nonce) >= 24 {
            certificate.nonce = certificate.nonce.wrapping_add(1);
        }
        assert!(matches!(
            validate(&certificate, 24),
            Err(RevocationError::InsufficientWork { want: 24, .. })
        ));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let ours = identity(1);
        let theirs = identity(2);
        let mut rng = fastrand::Rng::with_seed(3);

        let certificate = revoke(&theirs, TEST_WORKBITS, &mut rng);
        assert!(matches!(
            validate_for(&certificate, &ours.public_key(), TEST_WORKBITS),
            Err(RevocationError::WrongKey)
        ));
    }

    #[test]
    fn test_forged_signature_is_rejected() {
        let identity = identity(1);
        let forger = self::identity(2);
        let mut rng = fastrand::Rng::with_seed(3);

        let mut certificate = revoke(&identity, TEST_WORKBITS, &mut rng);
        certificate.signature =
            forger.sign(SignaturePurpose::Revocation, &identity.public_key().serialize());

        assert!(matches!(
            validate(&certificate, TEST_WORKBITS),
            Err(RevocationError::BadSignature)
        ));
    }

    #[test]
    fn test_store_is_idempotent() {
        let identity = identity(1);
        let mut rng = fastrand::Rng::with_seed(2);
        let certificate = revoke(&identity, TEST_WORKBITS, &mut rng);

        let dir = std::env::temp_dir().join("switchyard-revocation-test");
        let path = dir.join("revocation.cert");

        store(&certificate, &path).unwrap();
        let first = load(&path).unwrap();
        store(&first, &path).unwrap();
        let second = load(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, certificate);
        assert!(validate(&second, TEST_WORKBITS).is_ok());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_low_difficulty_found_quickly() {
        // With W=5 a nonce is found within ~32 attempts on average; the
        // search over a few seeds stays well under a generous cap.
        let identity = identity(7);
        for seed in 0..4 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let start = rng.clone().u64(..);
            let nonce = search_nonce(&identity.public_key(), TEST_WORKBITS, &mut rng);
            let attempts = nonce.wrapping_sub(start);
            assert!(attempts < 10_000, "took {} attempts", attempts);
        }
    }
}
