use crate::types::{CorrelationId, PeerId};

/// Protocol-level errors for botlink.
///
/// Correlation and handshake failures are local to the affected peer
/// session; only `AuthenticationExpired` requires external intervention
/// (re-login). Everything else self-heals via retry or re-handshake.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(CorrelationId),

    #[error("call {0} timed out")]
    Timeout(CorrelationId),

    #[error("call {0} was cancelled")]
    Cancelled(CorrelationId),

    #[error("pending-call table is full")]
    PendingTableFull,

    #[error("handshake with {0} already in progress")]
    HandshakeInProgress(PeerId),

    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: PeerId, reason: String },

    #[error("channel to {0} is not secure")]
    ChannelNotSecure(PeerId),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("authentication expired")]
    AuthenticationExpired,

    #[error("connection to {0} lost")]
    ConnectionLost(PeerId),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("middleware rejected call: {0}")]
    MiddlewareRejected(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

impl ProtocolError {
    /// Whether a refresh failure with this error means the session's
    /// credentials are gone (vs. a transient problem worth retrying).
    ///
    /// Remote rejections count only when the message names the refresh
    /// token as expired, revoked or invalid — a remote "internal error"
    /// keeps the credentials, like a transport failure does.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ProtocolError::AuthenticationExpired => true,
            ProtocolError::Remote(message) => {
                let message = message.to_ascii_lowercase();
                ["expired", "revoked", "invalid"]
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_duplicate_correlation_id() {
        let err = ProtocolError::DuplicateCorrelationId(CorrelationId::from("q1"));
        assert_eq!(err.to_string(), "duplicate correlation id: q1");
    }

    #[test]
    fn display_channel_not_secure() {
        let err = ProtocolError::ChannelNotSecure(PeerId::new("bot-1"));
        assert_eq!(err.to_string(), "channel to bot-1 is not secure");
    }

    #[test]
    fn display_timeout() {
        let err = ProtocolError::Timeout(CorrelationId::from("q1"));
        assert_eq!(err.to_string(), "call q1 timed out");
    }

    #[test]
    fn display_connection_lost() {
        let err = ProtocolError::ConnectionLost(PeerId::new("hub"));
        assert_eq!(err.to_string(), "connection to hub lost");
    }

    #[test]
    fn auth_failure_classification() {
        assert!(ProtocolError::AuthenticationExpired.is_auth_failure());
        assert!(ProtocolError::Remote("refresh token expired".into()).is_auth_failure());
        assert!(ProtocolError::Remote("Token REVOKED by admin".into()).is_auth_failure());
        assert!(ProtocolError::Remote("invalid refresh token".into()).is_auth_failure());
        assert!(!ProtocolError::Transport("socket closed".into()).is_auth_failure());
        assert!(!ProtocolError::Timeout(CorrelationId::from("q1")).is_auth_failure());
    }

    #[test]
    fn transient_remote_errors_are_not_auth_failures() {
        assert!(!ProtocolError::Remote("internal error".into()).is_auth_failure());
        assert!(!ProtocolError::Remote("service restarting".into()).is_auth_failure());
    }
}
