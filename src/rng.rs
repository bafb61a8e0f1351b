//! Deterministic random number generation based on PCG32.
//!
//! Every peer in a lockstep session draws randomness from generators seeded with
//! the same shared seed, so the same seed and the same joint actions always yield
//! the same trajectory. Generator state is plain data: it is part of the state
//! digest and is carried verbatim in full snapshots.
//!
//! # PCG32 Algorithm
//!
//! PCG (Permuted Congruential Generator) is a family of simple fast space-efficient
//! statistically good algorithms for random number generation. PCG32 specifically:
//! - Has 64 bits of state, producing 32-bit output
//! - Period of 2^64
//! - Supports independent streams selected by the increment
//!
//! Reference: <https://www.pcg-random.org/>
//!
//! # Usage
//!
//! ```rust
//! use lockstep_sync::rng::{Pcg32, Rng, SeedableRng};
//!
//! let mut env_rng = Pcg32::with_stream(42, Pcg32::ENVIRONMENT_STREAM);
//! let mut policy_rng = Pcg32::with_stream(42, Pcg32::POLICY_STREAM);
//!
//! // Independent streams from the same seed
//! assert_ne!(env_rng.next_u32(), policy_rng.next_u32());
//!
//! // Same seed, same stream, same sequence
//! let mut a = Pcg32::seed_from_u64(7);
//! let mut b = Pcg32::seed_from_u64(7);
//! assert_eq!(a.gen_range(0..100), b.gen_range(0..100));
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

/// PCG32 random number generator.
///
/// A minimal implementation of the PCG-XSH-RR variant with 64-bit state.
/// Suitable for simulations and policies, but NOT cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Default increment for single-stream PCG32.
/// This is a standard value from the PCG paper.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Multiplier constant for the LCG step.
/// This is the standard multiplier for 64-bit state PCG.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Stream used by the environment's own randomness.
    pub const ENVIRONMENT_STREAM: u64 = 1;

    /// Stream used by policies that draw randomness while choosing actions.
    pub const POLICY_STREAM: u64 = 2;

    /// Creates a new PCG32 generator with the given state and stream.
    ///
    /// The stream (increment) allows for multiple independent sequences.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        // The increment must be odd
        let inc = (stream << 1) | 1;
        // Standard PCG seeding: step from zero, add the seed, step again
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a generator for `seed` on one of the named streams.
    #[must_use]
    pub const fn with_stream(seed: u64, stream: u64) -> Self {
        Self::new(seed, stream)
    }

    /// Returns the raw `(state, increment)` pair.
    ///
    /// Two generators with equal raw state produce identical sequences.
    #[must_use]
    pub const fn raw_state(&self) -> (u64, u64) {
        (self.state, self.inc)
    }

    /// Generates the next 32-bit random value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        // XSH-RR output permutation
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Generates the next 64-bit random value by combining two 32-bit values.
    #[inline]
    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }
}

/// Trait for seeding random number generators.
pub trait SeedableRng: Sized {
    /// Creates a new RNG seeded from a 64-bit value.
    ///
    /// Different seeds produce different (statistically independent) sequences.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }
}

/// Trait for random number generation.
///
/// Environments and policies are handed a `&mut Pcg32` directly; code generic
/// over the generator can use this trait instead.
pub trait Rng {
    /// Returns the next 32-bit random value.
    fn next_u32(&mut self) -> u32;

    /// Returns the next 64-bit random value.
    fn next_u64(&mut self) -> u64;

    /// Generates a random value of type `T`.
    fn gen<T: RandomValue>(&mut self) -> T {
        T::random(self)
    }

    /// Generates a random `u32` value in the given range `[low, high)`.
    ///
    /// # Empty Range Behavior
    /// If `range.is_empty()`, reports a violation via telemetry and returns `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if span == 0 || range.end < range.start {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        // Rejection sampling to avoid modulo bias
        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u32();
            if random_value >= threshold {
                return range.start.wrapping_add(random_value % span);
            }
        }
    }

    /// Generates a random `usize` index in `[0, len)`.
    ///
    /// # Empty Range Behavior
    /// If `len == 0`, reports a violation via telemetry and returns 0.
    fn gen_index(&mut self, len: usize) -> usize {
        if len == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_index called with len 0"
            );
            return 0;
        }
        let span = len as u64;
        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u64();
            if random_value >= threshold {
                return (random_value % span) as usize;
            }
        }
    }

    /// Generates a random boolean with the given probability of being `true`.
    ///
    /// Values outside `[0.0, 1.0]` are clamped.
    fn gen_bool(&mut self, probability: f64) -> bool {
        let p = probability.clamp(0.0, 1.0);
        let threshold = (p * f64::from(u32::MAX)) as u32;
        self.next_u32() < threshold
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Self::next_u32(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        Self::next_u64(self)
    }
}

/// Trait for types that can be randomly generated.
pub trait RandomValue {
    /// Generates a random value of this type.
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl RandomValue for u32 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32()
    }
}

impl RandomValue for u64 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u64()
    }
}

impl RandomValue for f32 {
    /// Generates a random `f32` in the range `[0.0, 1.0)`.
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        // f32 has 24 bits of mantissa precision
        let val = rng.next_u32() >> 8;
        val as Self / (1u32 << 24) as Self
    }
}

impl RandomValue for f64 {
    /// Generates a random `f64` in the range `[0.0, 1.0)`.
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        // f64 has 53 bits of mantissa precision
        let val = rng.next_u64() >> 11;
        val as Self / (1u64 << 53) as Self
    }
}

impl RandomValue for bool {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32() & 1 == 1
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

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let seq_a: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let seq_b: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn streams_are_independent() {
        let mut env = Pcg32::with_stream(42, Pcg32::ENVIRONMENT_STREAM);
        let mut policy = Pcg32::with_stream(42, Pcg32::POLICY_STREAM);
        let seq_env: Vec<u32> = (0..8).map(|_| env.next_u32()).collect();
        let seq_policy: Vec<u32> = (0..8).map(|_| policy.next_u32()).collect();
        assert_ne!(seq_env, seq_policy);
    }

    #[test]
    fn clone_resumes_identically() {
        let mut original = Pcg32::seed_from_u64(99);
        for _ in 0..17 {
            let _ = original.next_u32();
        }
        let mut copy = original.clone();
        assert_eq!(original.raw_state(), copy.raw_state());
        for _ in 0..50 {
            assert_eq!(original.next_u64(), copy.next_u64());
        }
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(5);
        for _ in 0..1000 {
            let v = rng.gen_range(10..20);
            assert!((10..20).contains(&v));
        }
    }

    #[test]
    fn gen_range_empty_returns_start() {
        let mut rng = Pcg32::seed_from_u64(5);
        assert_eq!(rng.gen_range(7..7), 7);
    }

    #[test]
    fn gen_index_zero_len_returns_zero() {
        let mut rng = Pcg32::seed_from_u64(5);
        assert_eq!(rng.gen_index(0), 0);
    }

    #[test]
    fn gen_bool_extremes() {
        let mut rng = Pcg32::seed_from_u64(11);
        for _ in 0..100 {
            assert!(!rng.gen_bool(0.0));
        }
        assert!((0..100).filter(|_| rng.gen_bool(1.0)).count() > 95);
    }

    #[test]
    fn unit_floats_in_range() {
        let mut rng = Pcg32::seed_from_u64(3);
        for _ in 0..1000 {
            let f: f64 = rng.gen();
            assert!((0.0..1.0).contains(&f));
            let g: f32 = rng.gen();
            assert!((0.0..1.0).contains(&g));
        }
    }

    #[test]
    fn serde_round_trip_preserves_sequence() {
        let mut rng = Pcg32::with_stream(42, Pcg32::ENVIRONMENT_STREAM);
        let _ = rng.next_u32();
        let bytes = crate::network::codec::encode(&rng).unwrap();
        let mut restored: Pcg32 = crate::network::codec::decode_value(&bytes).unwrap();
        assert_eq!(rng, restored);
        assert_eq!(rng.next_u32(), restored.next_u32());
    }
}
