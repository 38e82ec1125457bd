//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the wire codec and the control protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame could not be parsed. The stream stays usable.
    #[error("malformed {tag} frame: {reason}")]
    Parse { tag: String, reason: String },

    /// A frame grew beyond the decoder limit and was discarded.
    #[error("frame too large: more than {max} bytes")]
    FrameTooLarge { max: usize },

    /// A message could not be rendered.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Control message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Failed to (de)serialize a control message.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed before a full control message was received.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    #[error("empty message")]
    EmptyMessage,

    #[error("timeout during {operation}")]
    Timeout { operation: String },
}

impl ProtocolError {
    /// Creates a parse error for the given tag.
    pub fn parse(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Returns true if the stream can continue after this error.
    ///
    /// Malformed and oversized frames are skipped; everything else is fatal
    /// to the connection that produced it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::FrameTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors() {
        assert!(ProtocolError::parse("defTextVector", "missing device").is_recoverable());
        assert!(ProtocolError::FrameTooLarge { max: 10 }.is_recoverable());
        assert!(!ProtocolError::EmptyMessage.is_recoverable());
        assert!(
            !ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
                .is_recoverable()
        );
    }

    #[test]
    fn parse_error_display() {
        let err = ProtocolError::parse("delProperty", "missing attribute device");
        assert_eq!(
            err.to_string(),
            "malformed delProperty frame: missing attribute device"
        );
    }
}
