//! Hub error types.

use crate::codec::CodecError;
use crate::identity::PeerId;

/// Errors surfaced by the hub and its components.
///
/// Only the caller-facing precondition failures (`AlreadyRunning`,
/// `BindError`, `UnknownPeer`, `PeerUnreachable`, `QueueFull`,
/// `MalformedFrame`, `InvalidLevel`) reach the public control plane.
/// `ConnectionFailed` stays inside the connection manager, where it is logged
/// and turned into a backoff.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// `start` was called while the hub was not Stopped.
    #[error("Hub already running")]
    AlreadyRunning,

    /// The hub is not running, so nothing can be sent.
    #[error("Hub not running")]
    NotRunning,

    /// The listener could not be bound to the requested local address.
    #[error("Cannot bind listener on {addr}: {reason}")]
    BindError { addr: String, reason: String },

    /// No PeerRecord exists for the requested key.
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// A PeerRecord exists but no live connection can carry the payload.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    /// The peer's outbound queue is at capacity.
    #[error("Outbound queue full for peer {0}")]
    QueueFull(PeerId),

    /// A frame could not be encoded or decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),

    /// The requested log level is not one of error|warn|info|debug|trace.
    #[error("Invalid log level: {0:?}")]
    InvalidLevel(String),

    /// Dial, handshake or mid-session I/O failure. Internal only.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A public key was empty, too long or not valid hex.
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// A configuration value is out of range.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A network address string could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Whether this error is one of the synchronous, caller-facing failures.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning
                | Self::NotRunning
                | Self::BindError { .. }
                | Self::UnknownPeer(_)
                | Self::PeerUnreachable(_)
                | Self::QueueFull(_)
                | Self::MalformedFrame(_)
                | Self::InvalidLevel(_)
                | Self::InvalidPeerId(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let peer = PeerId::from_bytes(vec![0xab, 0xcd]).unwrap();
        assert_eq!(
            HubError::UnknownPeer(peer.clone()).to_string(),
            "Unknown peer: abcd"
        );
        assert_eq!(
            HubError::QueueFull(peer).to_string(),
            "Outbound queue full for peer abcd"
        );
        assert_eq!(
            HubError::InvalidLevel("loud".into()).to_string(),
            "Invalid log level: \"loud\""
        );
    }

    #[test]
    fn test_codec_error_converts_to_malformed_frame() {
        let err: HubError = CodecError::FrameTooLarge { len: 10, max: 5 }.into();
        assert!(matches!(err, HubError::MalformedFrame(_)));
        assert!(err.is_caller_facing());
    }

    #[test]
    fn test_connection_failed_is_internal() {
        let err = HubError::ConnectionFailed("reset".into());
        assert!(!err.is_caller_facing());
    }
}
