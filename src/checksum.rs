//! State digest utilities.
//!
//! Peers periodically submit a digest of their observable state to the relay,
//! which compares them and reports divergence. For that to work the digest must
//! be **deterministic across all peers**:
//!
//! - Same logical state → same serialized bytes → same digest
//! - Serialization is platform-independent (bincode with fixed-size integers)
//! - Map-like data is held in `BTreeMap`, so key order is stable
//! - The hash has no random seed (FNV-1a 128)
//!
//! # Usage
//!
//! ```
//! use lockstep_sync::checksum::compute_digest;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Projection {
//!     frame: i32,
//!     score: f64,
//! }
//!
//! let a = compute_digest(&Projection { frame: 3, score: 1.5 }).unwrap();
//! let b = compute_digest(&Projection { frame: 3, score: 1.5 }).unwrap();
//! assert_eq!(a, b);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::fnv1a_128;
use crate::network::codec::{encode, CodecError};

/// A 128-bit digest of a peer's canonical state projection.
///
/// Digests are only ever compared for equality; they are never used to resume
/// execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StateDigest(u128);

impl StateDigest {
    /// Wraps a raw digest value.
    #[must_use]
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw digest value.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Returns the digest as 32 lowercase hex characters.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Display for StateDigest {
    /// Displays the first 8 hex characters, which is enough to tell digests apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        f.write_str(hex.get(..8).unwrap_or(&hex))
    }
}

/// Computes the deterministic digest of a serializable projection.
///
/// The value is serialized with the crate codec (bincode, fixed-int encoding)
/// and the bytes are hashed with FNV-1a 128.
pub fn compute_digest<T: Serialize>(value: &T) -> Result<StateDigest, ChecksumError> {
    let bytes = encode(value)?;
    Ok(StateDigest(fnv1a_128(&bytes)))
}

/// Hashes already-serialized bytes into a digest.
#[inline]
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> StateDigest {
    StateDigest(fnv1a_128(bytes))
}

/// Errors that can occur during digest computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// Serialization of the projection failed.
    SerializationFailed(String),
}

impl From<CodecError> for ChecksumError {
    fn from(err: CodecError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationFailed(msg) => write!(f, "digest failed: {msg}"),
        }
    }
}

impl std::error::Error for ChecksumError {}

impl From<ChecksumError> for crate::LockstepError {
    fn from(err: ChecksumError) -> Self {
        Self::Serialization {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize, Clone)]
    struct TestProjection {
        episode: u32,
        frame: i32,
        rewards: BTreeMap<String, f64>,
    }

    fn sample() -> TestProjection {
        let mut rewards = BTreeMap::new();
        rewards.insert("p1".to_owned(), 1.0);
        rewards.insert("p2".to_owned(), -0.5);
        TestProjection {
            episode: 0,
            frame: 12,
            rewards,
        }
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(
            compute_digest(&sample()).unwrap(),
            compute_digest(&sample()).unwrap()
        );
    }

    #[test]
    fn digest_changes_with_state() {
        let mut other = sample();
        other.frame = 13;
        assert_ne!(
            compute_digest(&sample()).unwrap(),
            compute_digest(&other).unwrap()
        );
    }

    #[test]
    fn digest_ignores_insertion_order() {
        let mut reversed = BTreeMap::new();
        reversed.insert("p2".to_owned(), -0.5);
        reversed.insert("p1".to_owned(), 1.0);
        let other = TestProjection {
            rewards: reversed,
            ..sample()
        };
        assert_eq!(
            compute_digest(&sample()).unwrap(),
            compute_digest(&other).unwrap()
        );
    }

    #[test]
    fn digest_bytes_matches_compute_digest() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(digest_bytes(&bytes), compute_digest(&sample()).unwrap());
    }

    #[test]
    fn display_is_short_prefix() {
        let digest = StateDigest::new(0x1234_5678_9abc_def0_1122_3344_5566_7788);
        assert_eq!(digest.to_string(), "12345678");
        assert_eq!(digest.to_hex().len(), 32);
    }
}
