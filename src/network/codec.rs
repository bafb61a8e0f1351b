//! Binary codec for relay messages, snapshots and digest projections.
//!
//! All serialization in the crate goes through this module so that every peer
//! uses the same bincode configuration. The digest of a state projection is only
//! meaningful if the bytes it hashes are identical on every peer.
//!
//! # Examples
//!
//! ```
//! use lockstep_sync::network::codec::{encode, decode, encode_append};
//!
//! let data: u32 = 42;
//! let bytes = encode(&data).expect("encoding should succeed");
//!
//! let (decoded, _bytes_read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(data, decoded);
//!
//! let mut buffer = Vec::new();
//! let len = encode_append(&data, &mut buffer).expect("encoding should succeed");
//! assert_eq!(len, buffer.len());
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-size integers keep the byte layout independent of the values involved,
// so equal states always serialize to equal bytes on every platform.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a relay message.
    EncodeMessage,
    /// Decoding a relay message.
    DecodeMessage,
    /// Encoding a full snapshot.
    EncodeSnapshot,
    /// Decoding a full snapshot.
    DecodeSnapshot,
    /// Appending to a buffer.
    AppendToBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding relay message"),
            Self::DecodeMessage => write!(f, "decoding relay message"),
            Self::EncodeSnapshot => write!(f, "encoding snapshot"),
            Self::DecodeSnapshot => write!(f, "decoding snapshot"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque and only expose a human-readable message, so the
/// message is kept as a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }

    /// Returns the same error, relabelled with a more specific operation.
    #[must_use]
    pub fn during(self, operation: CodecOperation) -> Self {
        match self {
            Self::EncodeError { message, .. } => Self::EncodeError { message, operation },
            Self::DecodeError { message, .. } => Self::DecodeError { message, operation },
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
///
/// # Examples
///
/// ```
/// use lockstep_sync::network::codec::encode;
///
/// let bytes = encode(&42u32).expect("encoding should succeed");
/// assert_eq!(bytes.len(), 4);
/// ```
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`.
///
/// Returns the number of bytes appended.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
///
/// ```
/// use lockstep_sync::network::codec::{encode, decode_value};
///
/// let bytes = encode(&7u64).expect("encoding should succeed");
/// let decoded: u64 = decode_value(&bytes).expect("decoding should succeed");
/// assert_eq!(decoded, 7);
/// ```
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
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
    use crate::network::messages::InboundMessage;
    use crate::{Frame, PeerId};
    use std::collections::BTreeMap;

    type Inbound = InboundMessage<u8, Vec<u8>>;

    #[test]
    fn test_encode_decode_primitive() {
        let original: u32 = 12345;
        let bytes = encode(&original).unwrap();
        let (decoded, len): (u32, _) = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn test_encode_decode_message() {
        let mut joint_action = BTreeMap::new();
        joint_action.insert(PeerId::from("p1"), 2u8);
        joint_action.insert(PeerId::from("p2"), 0u8);
        let original: Inbound = InboundMessage::JointActionReady {
            frame: Frame::new(4),
            joint_action,
        };
        let bytes = encode(&original).unwrap();
        let decoded: Inbound = decode_value(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_fixed_int_encoding_width() {
        assert_eq!(encode(&1u32).unwrap().len(), 4);
        assert_eq!(encode(&u32::MAX).unwrap().len(), 4);
        assert_eq!(encode(&1u64).unwrap().len(), 8);
    }

    #[test]
    fn test_encode_append() {
        let mut buffer = Vec::new();
        let len1 = encode_append(&42u32, &mut buffer).unwrap();
        let len2 = encode_append(&"test", &mut buffer).unwrap();
        assert_eq!(buffer.len(), len1 + len2);
    }

    #[test]
    fn test_decode_invalid_data() {
        let invalid_bytes = [0xFF, 0xFF, 0xFF];
        let result: CodecResult<(u64, _)> = decode(&invalid_bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_unknown_message_variant() {
        let bytes = encode(&250u32).unwrap();
        let result: CodecResult<Inbound> = decode_value(&bytes);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::encode("test error", CodecOperation::EncodeSnapshot);
        assert!(err.to_string().contains("encoding failed"));
        assert!(err.to_string().contains("snapshot"));

        let err = CodecError::decode("test error", CodecOperation::DecodeMessage);
        assert!(err.to_string().contains("decoding failed"));
        assert!(err.to_string().contains("relay message"));
    }

    #[test]
    fn test_during_relabels_operation() {
        let err = CodecError::decode("eof", CodecOperation::Decode).during(CodecOperation::DecodeSnapshot);
        assert_eq!(err, CodecError::decode("eof", CodecOperation::DecodeSnapshot));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let msg: Inbound = InboundMessage::VerifyState {
            frame: Frame::new(10),
        };
        assert_eq!(encode(&msg).unwrap(), encode(&msg).unwrap());
    }
}
