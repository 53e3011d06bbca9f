//! Protocol error types.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Outbound message could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),

    /// Inbound frame is not valid JSON or does not match the envelope shape
    #[error("decode failed: {0}")]
    Decode(String),

    /// Inbound frame is a JSON value without a string `type` field
    #[error("frame has no `type` discriminator")]
    MissingType,

    /// Inbound frame carries a discriminator this client does not know
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    /// Returns true if the frame itself is broken.
    ///
    /// An unknown discriminator is a well-formed frame from a peer speaking a
    /// newer protocol, so it is not considered malformed.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::MissingType)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_not_malformed() {
        assert!(!ProtocolError::UnknownType("Ping".to_string()).is_malformed());
        assert!(!ProtocolError::Encode("boom".to_string()).is_malformed());
    }

    #[test]
    fn broken_frames_are_malformed() {
        assert!(ProtocolError::Decode("eof".to_string()).is_malformed());
        assert!(ProtocolError::MissingType.is_malformed());
    }
}
