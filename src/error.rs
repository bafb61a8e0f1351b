use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::{Frame, PeerId};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), LockstepError>`].
///
/// [`Result<(), LockstepError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum LockstepError {
    /// The environment could not produce a usable instance. This is fatal to the local session
    /// and is never retried automatically.
    InitializationFailed {
        /// A description of what went wrong while creating the environment.
        context: String,
    },
    /// No `HostElected` message has been received yet, so the session has no seed and no role.
    NotElected,
    /// The session is paused waiting for a resync. Nothing is submitted or stepped while paused.
    Paused {
        /// The frame at which the divergence was reported.
        frame: Frame,
    },
    /// The local action for this frame has already been submitted to the relay.
    ActionAlreadySubmitted {
        /// The frame the action was submitted for.
        frame: Frame,
    },
    /// The runner was handed a joint action that does not cover every expected peer.
    IncompleteJointAction {
        /// The frame the joint action was meant for.
        frame: Frame,
        /// The peers without an entry.
        missing: Vec<PeerId>,
    },
    /// A full snapshot failed validation and was not applied.
    SnapshotRejected {
        /// Why the snapshot was rejected.
        reason: String,
    },
    /// A host-only operation was attempted by a peer that is not the host.
    NotHost,
    /// All configured episodes have completed.
    SessionDone,
    /// The session configuration is invalid.
    InvalidConfig {
        /// Further specifies why the configuration was invalid.
        info: String,
    },
    /// Serialization or deserialization of data failed.
    Serialization {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// The environment reported an error while resetting, stepping or restoring.
    Environment {
        /// The message reported by the environment.
        context: String,
    },
}

impl Display for LockstepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed { context } => {
                write!(f, "Environment initialization failed: {}", context)
            },
            Self::NotElected => {
                write!(
                    f,
                    "No host election has been received; the session has no seed yet."
                )
            },
            Self::Paused { frame } => {
                write!(f, "Session is paused for resync (divergence at frame {})", frame)
            },
            Self::ActionAlreadySubmitted { frame } => {
                write!(f, "Local action for frame {} was already submitted", frame)
            },
            Self::IncompleteJointAction { frame, missing } => {
                write!(
                    f,
                    "Joint action for frame {} is missing peers: {:?}",
                    frame, missing
                )
            },
            Self::SnapshotRejected { reason } => {
                write!(f, "Snapshot rejected: {}", reason)
            },
            Self::NotHost => {
                write!(f, "Operation is only permitted on the host peer.")
            },
            Self::SessionDone => {
                write!(f, "All configured episodes have completed.")
            },
            Self::InvalidConfig { info } => {
                write!(f, "Invalid configuration: {}", info)
            },
            Self::Serialization { context } => {
                write!(f, "Serialization error: {}", context)
            },
            Self::Environment { context } => {
                write!(f, "Environment error: {}", context)
            },
        }
    }
}

impl Error for LockstepError {}

impl From<CodecError> for LockstepError {
    fn from(err: CodecError) -> Self {
        Self::Serialization {
            context: err.to_string(),
        }
    }
}

/// Error reported by an [`Environment`](crate::Environment) implementation.
///
/// Environments are opaque to the protocol, so all they can tell us is a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentError {
    message: String,
}

impl EnvironmentError {
    /// Creates a new environment error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the message reported by the environment.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for EnvironmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for EnvironmentError {}

impl From<EnvironmentError> for LockstepError {
    fn from(err: EnvironmentError) -> Self {
        Self::Environment {
            context: err.message,
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

    #[test]
    fn display_mentions_frame_for_paused() {
        let err = LockstepError::Paused {
            frame: Frame::new(10),
        };
        assert!(err.to_string().contains("frame 10"));
    }

    #[test]
    fn display_lists_missing_peers() {
        let err = LockstepError::IncompleteJointAction {
            frame: Frame::new(3),
            missing: vec![PeerId::from("p2")],
        };
        let text = err.to_string();
        assert!(text.contains("frame 3"));
        assert!(text.contains("p2"));
    }

    #[test]
    fn environment_error_converts_with_message() {
        let err: LockstepError = EnvironmentError::new("bad action").into();
        assert_eq!(
            err,
            LockstepError::Environment {
                context: "bad action".to_owned()
            }
        );
    }

    #[test]
    fn codec_error_converts_to_serialization() {
        let codec = CodecError::decode(
            "unexpected end",
            crate::network::codec::CodecOperation::Decode,
        );
        let err: LockstepError = codec.into();
        assert!(matches!(err, LockstepError::Serialization { .. }));
    }
}
