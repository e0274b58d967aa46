//! Binary wire codec primitives.
//!
//! All integers are big-endian; variable-length fields carry a `u32` length
//! prefix. Types implement [`Encodable`] and [`Decodable`] next to their
//! definition.
use std::io;

use secp256k1::{ecdsa, PublicKey};
use thiserror::Error;

use crate::identity::{PeerId, PEER_ID_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::time::{LocalDuration, LocalTime};

/// Upper bound on any single length-prefixed field. Protects decoders from
/// hostile length prefixes.
pub const MAX_FIELD_SIZE: u32 = 1024 * 1024;

/// A decoding error.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A message type tag we don't understand.
    #[error("unknown message type tag: {0}")]
    UnknownTag(u16),
    /// A length prefix exceeding [`MAX_FIELD_SIZE`].
    #[error("field length {0} exceeds maximum")]
    OversizedField(u32),
    /// A string field that is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    /// A public key or signature that does not parse.
    #[error("invalid cryptographic material")]
    InvalidKeyMaterial,
    /// A value outside its domain, eg. an unknown enum discriminant.
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

/// Types that can be serialized to a byte stream.
pub trait Encodable {
    /// Encode into the writer, returning the number of bytes written.
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize>;
}

/// Types that can be deserialized from a byte stream.
pub trait Decodable: Sized {
    /// Decode from the reader.
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error>;
}

/// Encode a value into a fresh byte vector.
pub fn serialize<T: Encodable>(value: &T) -> Vec<u8> {
    let mut bytes = Vec::new();
    value
        .encode(&mut bytes)
        .expect("in-memory encoding does not fail");
    bytes
}

/// Decode a value from a byte slice, requiring the slice to be fully consumed.
pub fn deserialize<T: Decodable>(bytes: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(bytes);
    let value = T::decode(&mut cursor)?;

    if cursor.position() != bytes.len() as u64 {
        return Err(Error::InvalidValue("trailing bytes"));
    }
    Ok(value)
}

macro_rules! impl_int {
    ($ty:ty) => {
        impl Encodable for $ty {
            fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
                w.write_all(&self.to_be_bytes())?;
                Ok(std::mem::size_of::<$ty>())
            }
        }

        impl Decodable for $ty {
            fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
                let mut buf = [0; std::mem::size_of::<$ty>()];
                r.read_exact(&mut buf)?;
                Ok(<$ty>::from_be_bytes(buf))
            }
        }
    };
}

impl_int!(u8);
impl_int!(u16);
impl_int!(u32);
impl_int!(u64);

impl Encodable for bool {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        (*self as u8).encode(w)
    }
}

impl Decodable for bool {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        match u8::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidValue("bool")),
        }
    }
}

impl Encodable for Vec<u8> {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = (self.len() as u32).encode(w)?;
        w.write_all(self)?;
        len += self.len();

        Ok(len)
    }
}

impl Decodable for Vec<u8> {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let len = u32::decode(r)?;
        if len > MAX_FIELD_SIZE {
            return Err(Error::OversizedField(len));
        }
        let mut bytes = vec![0; len as usize];
        r.read_exact(&mut bytes)?;

        Ok(bytes)
    }
}

impl Encodable for String {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = (self.len() as u32).encode(w)?;
        w.write_all(self.as_bytes())?;
        len += self.len();

        Ok(len)
    }
}

impl Decodable for String {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let bytes = Vec::<u8>::decode(r)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }
}

impl Encodable for PeerId {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_all(self.as_bytes())?;
        Ok(PEER_ID_SIZE)
    }
}

impl Decodable for PeerId {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let mut bytes = [0; PEER_ID_SIZE];
        r.read_exact(&mut bytes)?;
        Ok(PeerId::from_bytes(bytes))
    }
}

impl Encodable for PublicKey {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_all(&self.serialize())?;
        Ok(PUBLIC_KEY_SIZE)
    }
}

impl Decodable for PublicKey {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let mut bytes = [0; PUBLIC_KEY_SIZE];
        r.read_exact(&mut bytes)?;
        PublicKey::from_slice(&bytes).map_err(|_| Error::InvalidKeyMaterial)
    }
}

impl Encodable for ecdsa::Signature {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_all(&self.serialize_compact())?;
        Ok(SIGNATURE_SIZE)
    }
}

impl Decodable for ecdsa::Signature {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let mut bytes = [0; SIGNATURE_SIZE];
        r.read_exact(&mut bytes)?;
        ecdsa::Signature::from_compact(&bytes).map_err(|_| Error::InvalidKeyMaterial)
    }
}

impl Encodable for LocalTime {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        self.as_millis().encode(w)
    }
}

impl Decodable for LocalTime {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        Ok(LocalTime::from_millis(u64::decode(r)?))
    }
}

impl Encodable for LocalDuration {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        self.as_millis().encode(w)
    }
}

impl Decodable for LocalDuration {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        Ok(LocalDuration::from_millis(u64::decode(r)?))
    }
}

impl<T: Encodable> Encodable for Option<T> {
    fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<usize> {
        match self {
            None => false.encode(w),
            Some(value) => Ok(true.encode(w)? + value.encode(w)?),
        }
    }
}

impl<T: Decodable> Decodable for Option<T> {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        if bool::decode(r)? {
            Ok(Some(T::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

/// Encode a sequence as a `u32` count followed by the items.
pub fn encode_seq<W: io::Write, T: Encodable>(items: &[T], w: &mut W) -> io::Result<usize> {
    let mut len = (items.len() as u32).encode(w)?;
    for item in items {
        len += item.encode(w)?;
    }
    Ok(len)
}

/// Decode a sequence encoded by [`encode_seq`].
pub fn decode_seq<R: io::Read, T: Decodable>(r: &mut R) -> Result<Vec<T>, Error> {
    let len = u32::decode(r)?;
    if len > MAX_FIELD_SIZE {
        return Err(Error::OversizedField(len));
    }
    let mut items = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        items.push(T::decode(r)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        assert_eq!(serialize(&0xdeadbeefu32), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(deserialize::<u32>(&[0xde, 0xad, 0xbe, 0xef]).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let bytes = vec![1u8, 2, 3];
        assert_eq!(deserialize::<Vec<u8>>(&serialize(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = serialize(&7u16);
        encoded.push(0);

        assert!(matches!(
            deserialize::<u16>(&encoded),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn test_hostile_length_prefix() {
        let encoded = serialize(&(MAX_FIELD_SIZE + 1));
        assert!(matches!(
            deserialize::<Vec<u8>>(&encoded),
            Err(Error::OversizedField(_))
        ));
    }

    #[test]
    fn test_option_roundtrip() {
        let value: Option<String> = Some("udp".to_owned());
        assert_eq!(deserialize::<Option<String>>(&serialize(&value)).unwrap(), value);

        let none: Option<String> = None;
        assert_eq!(deserialize::<Option<String>>(&serialize(&none)).unwrap(), none);
    }
}
