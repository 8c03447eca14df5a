//! Content digests.
//!
//! A [`Digest`] is a SHA-256 [`Fingerprint`] plus the length of the content it
//! identifies. Two digests are equal iff both parts match.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of a [`Fingerprint`].
pub const FINGERPRINT_SIZE: usize = 32;

/// A SHA-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Hash the given bytes
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Parse from a 64-character hex string
    ///
    /// # Errors
    ///
    /// Returns error if the hex string is invalid or wrong length
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != FINGERPRINT_SIZE * 2 {
            return Err(Error::invalid_digest(format!(
                "fingerprint must be {} hex characters, got {}",
                FINGERPRINT_SIZE * 2,
                hex_str.len()
            )));
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| Error::invalid_digest(format!("fingerprint is not hex: {e}")))?;
        Ok(Self(bytes))
    }

    /// Hex representation
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw hash bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 of the empty byte string.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// Digest of the empty byte string.
pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

/// Identifier for immutable content: hash plus size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    /// SHA-256 of the content
    pub hash: Fingerprint,
    /// Length of the content in bytes
    pub size_bytes: usize,
}

impl Digest {
    /// Create a digest from its parts
    #[must_use]
    pub const fn new(hash: Fingerprint, size_bytes: usize) -> Self {
        Self { hash, size_bytes }
    }

    /// Compute the digest of some bytes
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            hash: Fingerprint::from_data(data),
            size_bytes: data.len(),
        }
    }

    /// Parse a fingerprint and size given separately
    ///
    /// # Errors
    ///
    /// Returns error if the fingerprint is not valid hex
    pub fn from_parts(hex_str: &str, size_bytes: usize) -> Result<Self> {
        Ok(Self::new(Fingerprint::from_hex(hex_str)?, size_bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest<{}-{}>", self.hash, self.size_bytes)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hash, size) = s
            .split_once('-')
            .ok_or_else(|| Error::invalid_digest(format!("expected <hash>-<size>, got '{s}'")))?;
        let size_bytes = size
            .parse::<usize>()
            .map_err(|e| Error::invalid_digest(format!("invalid size '{size}': {e}")))?;
        Self::from_parts(hash, size_bytes)
    }
}
