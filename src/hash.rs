//! Deterministic hashing utilities.
//!
//! State digests must be identical on every peer that holds the same logical
//! state. `std::collections::hash_map::DefaultHasher` is randomly seeded per
//! process, so it cannot be used; these hashers use fixed algorithms instead.
//!
//! # Usage
//!
//! ```
//! use lockstep_sync::hash::{fnv1a_hash, fnv1a_128};
//!
//! // 64-bit hash of any `Hash` value
//! assert_eq!(fnv1a_hash(&"hello"), fnv1a_hash(&"hello"));
//!
//! // 128-bit hash of raw bytes, used for state digests
//! assert_eq!(fnv1a_128(b"state"), fnv1a_128(b"state"));
//! ```
//!
//! # Algorithm
//!
//! FNV-1a (Fowler-Noll-Vo, variant 1a), in its 64-bit and 128-bit forms.
//! FNV-1a is NOT cryptographically secure. Digests only need to detect
//! accidental divergence between cooperating peers.

use std::hash::{Hash, Hasher};

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// FNV-1a 128-bit offset basis constant.
const FNV128_OFFSET_BASIS: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;

/// FNV-1a 128-bit prime constant (2^88 + 2^8 + 0x3b).
const FNV128_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

/// A deterministic hasher using the FNV-1a algorithm.
///
/// # Example
///
/// ```
/// use lockstep_sync::hash::DeterministicHasher;
/// use std::hash::{Hash, Hasher};
///
/// let mut hasher = DeterministicHasher::new();
/// 42u32.hash(&mut hasher);
/// let hash = hasher.finish();
///
/// let mut hasher2 = DeterministicHasher::new();
/// 42u32.hash(&mut hasher2);
/// assert_eq!(hash, hasher2.finish());
/// ```
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a new `DeterministicHasher` with the standard FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Computes a deterministic FNV-1a hash of the given value.
///
/// # Example
///
/// ```
/// use lockstep_sync::hash::fnv1a_hash;
///
/// let hash = fnv1a_hash(&42u32);
/// assert_eq!(hash, fnv1a_hash(&42u32));
/// assert_ne!(hash, fnv1a_hash(&43u32));
/// ```
#[inline]
pub fn fnv1a_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DeterministicHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Computes the 128-bit FNV-1a hash of a byte slice.
///
/// The wider variant keeps accidental collisions between diverged states
/// negligible over long sessions.
#[inline]
#[must_use]
pub fn fnv1a_128(bytes: &[u8]) -> u128 {
    let mut state = FNV128_OFFSET_BASIS;
    for &byte in bytes {
        state ^= u128::from(byte);
        state = state.wrapping_mul(FNV128_PRIME);
    }
    state
}
