/// Typed error hierarchy for chat session operations.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChatError {
    // Fatal — don't retry
    #[error("announce rejected: {0}")]
    AnnounceRejected(String),
    #[error("message blocked: contact information is not allowed")]
    ContactInfoBlocked,
    #[error("message is empty: text or file required")]
    EmptyMessage,
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("persistence failed ({status}): {body}")]
    PersistenceFailed { status: u16, body: String },
    #[error("session closed")]
    SessionClosed,
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::TransportClosed | Self::NetworkError(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AnnounceRejected(_)
                | Self::ContactInfoBlocked
                | Self::EmptyMessage
                | Self::InvalidRequest(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AnnounceRejected(_) => "announce_rejected",
            Self::ContactInfoBlocked => "contact_info_blocked",
            Self::EmptyMessage => "empty_message",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ConnectFailed(_) => "connect_failed",
            Self::TransportClosed => "transport_closed",
            Self::NetworkError(_) => "network_error",
            Self::PersistenceFailed { .. } => "persistence_failed",
            Self::SessionClosed => "session_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ChatError::ConnectFailed("refused".into()).is_retryable());
        assert!(ChatError::TransportClosed.is_retryable());
        assert!(ChatError::NetworkError("reset".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ChatError::AnnounceRejected("unknown sender".into()).is_fatal());
        assert!(ChatError::ContactInfoBlocked.is_fatal());
        assert!(ChatError::EmptyMessage.is_fatal());
        assert!(ChatError::InvalidRequest("bad".into()).is_fatal());
    }

    #[test]
    fn not_retryable_and_not_fatal() {
        let persist = ChatError::PersistenceFailed {
            status: 500,
            body: "db down".into(),
        };
        assert!(!persist.is_retryable());
        assert!(!persist.is_fatal());

        assert!(!ChatError::SessionClosed.is_retryable());
        assert!(!ChatError::SessionClosed.is_fatal());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ChatError::ContactInfoBlocked.error_kind(), "contact_info_blocked");
        assert_eq!(ChatError::TransportClosed.error_kind(), "transport_closed");
        assert_eq!(
            ChatError::PersistenceFailed { status: 500, body: "x".into() }.error_kind(),
            "persistence_failed"
        );
    }
}
