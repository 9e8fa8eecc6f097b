use std::fmt;

use anyhow::{bail, Error};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Digest width in bytes (SHA-256).
pub const DIGEST_LEN: usize = 32;

/// Content digest of a chunk.
///
/// Fixed-width byte string; ordering and equality are lexicographic
/// over the raw bytes. Rendered as lowercase hex everywhere.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, Error> {
        let bytes = hex::decode(text)?;
        Self::try_from(&bytes[..])
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != DIGEST_LEN {
            bail!("invalid digest length {}", bytes.len());
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(bytes);
        Ok(Self(digest))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Digest::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Chunk digest function, optionally keyed.
///
/// A seeded hasher derives a 32 byte id key and appends it to the
/// hashed data. This moves chunk identities into a per-seed name space
/// without opening the door to length extension (the key goes last).
/// Unkeyed hashing is plain SHA-256.
pub struct Hasher {
    id_key: Option<[u8; 32]>,
}

impl Hasher {
    /// Plain SHA-256, no keying.
    pub fn unkeyed() -> Self {
        Self { id_key: None }
    }

    /// Derive the id key from arbitrary seed bytes.
    pub fn with_seed(seed: &[u8]) -> Result<Self, Error> {
        let mut id_key = [0u8; 32];
        pbkdf2_hmac(seed, b"_chunk_id_key", 10, MessageDigest::sha256(), &mut id_key)?;
        Ok(Self {
            id_key: Some(id_key),
        })
    }

    pub fn digest_len(&self) -> usize {
        DIGEST_LEN
    }

    /// One-shot digest over a byte slice.
    pub fn hash_bytes(&self, data: &[u8]) -> Digest {
        let mut state = self.streaming();
        state.update(data);
        state.finalize()
    }

    /// Incremental digest state; equivalent to [`Hasher::hash_bytes`]
    /// over the concatenation of all `update` inputs.
    pub fn streaming(&self) -> HasherState {
        HasherState {
            sha: openssl::sha::Sha256::new(),
            id_key: self.id_key,
        }
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::unkeyed()
    }
}

pub struct HasherState {
    sha: openssl::sha::Sha256,
    id_key: Option<[u8; 32]>,
}

impl HasherState {
    pub fn update(&mut self, data: &[u8]) {
        self.sha.update(data);
    }

    pub fn finalize(mut self) -> Digest {
        if let Some(ref id_key) = self.id_key {
            self.sha.update(id_key);
        }
        Digest(self.sha.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_equals_one_shot() {
        let hasher = Hasher::unkeyed();

        let one_shot = hasher.hash_bytes(b"hello chunked world");

        let mut state = hasher.streaming();
        state.update(b"hello ");
        state.update(b"chunked ");
        state.update(b"world");

        assert_eq!(state.finalize(), one_shot);
    }

    #[test]
    fn seeded_hashers_use_distinct_name_spaces() {
        let plain = Hasher::unkeyed();
        let seeded_a = Hasher::with_seed(b"alpha").unwrap();
        let seeded_b = Hasher::with_seed(b"beta").unwrap();

        let data = b"same bytes";
        let d0 = plain.hash_bytes(data);
        let d1 = seeded_a.hash_bytes(data);
        let d2 = seeded_b.hash_bytes(data);

        assert_ne!(d0, d1);
        assert_ne!(d1, d2);

        // deterministic per seed
        assert_eq!(Hasher::with_seed(b"alpha").unwrap().hash_bytes(data), d1);
    }

    #[test]
    fn hex_round_trip() {
        let digest = Hasher::unkeyed().hash_bytes(b"x");
        let parsed = Digest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(parsed, digest);

        assert!(Digest::from_hex("abcd").is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let digest = Hasher::unkeyed().hash_bytes(b"payload");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));

        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
