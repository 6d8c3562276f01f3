//! Error types for the wormhole wire protocol.

use thiserror::Error;

use crate::protocol::{MAX_NAME_SIZE, MAX_PAYLOAD_SIZE};

/// A value that cannot be serialized, or bytes that cannot be deserialized,
/// without desynchronizing the peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unsupported protocol version {0:#04x}")]
    InvalidVersion(u8),

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte limit")]
    PayloadTooLarge(u64),

    #[error("reserved header byte is {0:#04x}, must be zero")]
    ReservedNonZero(u8),

    #[error("unknown protocol selector {0:#04x}")]
    UnknownProto(u8),

    #[error("unknown response status {0:#04x}")]
    UnknownStatus(u8),

    #[error("name must not be empty")]
    EmptyName,

    #[error("domain must not be empty on an ok response")]
    EmptyDomain,

    #[error("declared length {declared} does not match actual length {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("string of {0} bytes exceeds the {MAX_NAME_SIZE}-byte limit")]
    StringTooLong(usize),

    #[error("buffer holds {actual} bytes but {expected} were declared")]
    Truncated { expected: usize, actual: usize },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Failure while reading a length-delimited frame off a byte stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended before the declared byte count arrived.
    #[error("stream ended after {read} of {expected} bytes")]
    UnexpectedEof { expected: usize, read: usize },

    /// The underlying transport reported an error.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// The bytes arrived but did not decode.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl FrameError {
    /// Whether this error just means the peer went away. Disconnects during
    /// session teardown are expected and callers usually swallow them.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            FrameError::UnexpectedEof { .. } => true,
            FrameError::Stream(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            FrameError::Wire(_) => false,
        }
    }
}
