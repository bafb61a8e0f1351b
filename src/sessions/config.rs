//! Configuration types for lockstep sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `SessionConfig` | Verification cadence, stall warnings, episode count | `strict()`, `relaxed()` |
//! | `VerificationMode` | Self-initiated digest submission | `Every { interval }`, `Off` |
//!
//! # Example
//!
//! ```
//! use lockstep_sync::{SessionConfig, VerificationMode};
//!
//! let config = SessionConfig {
//!     num_episodes: 3,
//!     ..SessionConfig::strict()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.verification, VerificationMode::Every { interval: 30 });
//! ```

use web_time::Duration;

use crate::LockstepError;

/// Smallest accepted event queue size.
pub const MIN_EVENT_QUEUE_SIZE: usize = 10;

/// Whether the local peer submits digests on its own schedule.
///
/// Verification requests from the relay are always honored, whatever the mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerificationMode {
    /// Submit a digest after every frame that is a multiple of `interval`.
    Every {
        /// Frames between submissions. Must be at least 1.
        interval: u32,
    },
    /// Only submit digests when the relay asks.
    Off,
}

impl VerificationMode {
    /// Returns `true` if a digest should be submitted for `frame` without being asked.
    #[must_use]
    pub fn should_verify(self, frame: crate::Frame) -> bool {
        match self {
            Self::Every { interval } => {
                let frame = i64::from(frame.as_i32());
                interval > 0 && frame > 0 && frame % i64::from(interval) == 0
            },
            Self::Off => false,
        }
    }
}

/// Session-wide settings.
///
/// New fields may be added in future versions. Construct with `..SessionConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SessionConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct SessionConfig {
    /// Self-initiated verification cadence.
    ///
    /// Default: `Off` (relay-driven only)
    pub verification: VerificationMode,

    /// How long to wait for a joint action before emitting a stall warning.
    /// The wait itself never times out.
    ///
    /// Default: 5s
    pub stall_warning_after: Duration,

    /// Maximum number of events kept before the oldest are dropped.
    ///
    /// Default: 100
    pub event_queue_size: usize,

    /// Episodes to play before the session is done.
    ///
    /// Default: 1
    pub num_episodes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verification: VerificationMode::Off,
            stall_warning_after: Duration::from_secs(5),
            event_queue_size: 100,
            num_episodes: 1,
        }
    }
}

impl SessionConfig {
    /// Creates a new `SessionConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset that verifies often and warns early about stalls.
    ///
    /// Useful while developing an environment, when nondeterminism should surface fast.
    pub fn strict() -> Self {
        Self {
            verification: VerificationMode::Every { interval: 30 },
            stall_warning_after: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Preset that relies on the relay for verification and tolerates slow peers.
    pub fn relaxed() -> Self {
        Self {
            verification: VerificationMode::Off,
            stall_warning_after: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `LockstepError::InvalidConfig` if the verification interval is 0, if no
    /// episodes are configured, if the event queue is smaller than
    /// [`MIN_EVENT_QUEUE_SIZE`], or if the stall warning window is zero.
    pub fn validate(&self) -> Result<(), LockstepError> {
        if let VerificationMode::Every { interval: 0 } = self.verification {
            return Err(LockstepError::InvalidConfig {
                info: "verification interval must be at least 1".to_owned(),
            });
        }
        if self.num_episodes == 0 {
            return Err(LockstepError::InvalidConfig {
                info: "num_episodes must be at least 1".to_owned(),
            });
        }
        if self.event_queue_size < MIN_EVENT_QUEUE_SIZE {
            return Err(LockstepError::InvalidConfig {
                info: format!(
                    "event_queue_size must be at least {}, got {}",
                    MIN_EVENT_QUEUE_SIZE, self.event_queue_size
                ),
            });
        }
        if self.stall_warning_after.is_zero() {
            return Err(LockstepError::InvalidConfig {
                info: "stall_warning_after must be non-zero".to_owned(),
            });
        }
        Ok(())
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
    use crate::Frame;

    #[test]
    fn presets_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::strict().validate().is_ok());
        assert!(SessionConfig::relaxed().validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = SessionConfig {
            verification: VerificationMode::Every { interval: 0 },
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LockstepError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn zero_episodes_is_rejected() {
        let config = SessionConfig {
            num_episodes: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_event_queue_is_rejected() {
        let config = SessionConfig {
            event_queue_size: MIN_EVENT_QUEUE_SIZE - 1,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_stall_window_is_rejected() {
        let config = SessionConfig {
            stall_warning_after: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cadence() {
        let every = VerificationMode::Every { interval: 10 };
        assert!(!every.should_verify(Frame::new(0)));
        assert!(!every.should_verify(Frame::new(9)));
        assert!(every.should_verify(Frame::new(10)));
        assert!(every.should_verify(Frame::new(20)));
        assert!(!VerificationMode::Off.should_verify(Frame::new(10)));
    }

    #[test]
    fn intervals_beyond_the_frame_range_never_fire() {
        for interval in [u32::MAX, 1 << 31] {
            let every = VerificationMode::Every { interval };
            assert!(!every.should_verify(Frame::new(1)));
            assert!(!every.should_verify(Frame::new(4)));
            assert!(!every.should_verify(Frame::new(i32::MAX)));
        }
    }
}
