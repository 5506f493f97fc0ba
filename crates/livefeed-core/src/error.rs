//! Delivery error types.

use thiserror::Error;

use crate::source::AdapterState;

/// Errors surfaced by the delivery pipeline.
///
/// Transport failures are absorbed by the [`DeliveryClient`](crate::DeliveryClient)
/// and converted into health transitions; observers see them through
/// `on_error`. Only [`DeliveryError::is_terminal`] errors stop the client.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// HTTP request failed (connection refused, 5xx, reset, ...).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The streaming connection could not be read or was closed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The server refused the subscriber (4xx other than 408/429).
    #[error("rejected by {endpoint} with HTTP {status}")]
    Rejected { status: u16, endpoint: String },

    /// Request timed out after the configured duration.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// A frame on the stream could not be decoded.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Response could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A subscriber handler returned an error or panicked.
    #[error("handler for `{event_type}` failed: {message}")]
    Handler { event_type: String, message: String },

    /// Reconnect attempts ran out with no fallback left.
    #[error("gave up after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },

    /// An adapter was driven through an edge its state machine forbids.
    #[error("invalid adapter transition {from} -> {to}")]
    InvalidTransition { from: AdapterState, to: AdapterState },

    /// The client configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl DeliveryError {
    /// Classify a non-success HTTP status.
    ///
    /// 408, 429 and 5xx are transient; every other 4xx is a rejection.
    pub fn from_status(status: u16, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        match status {
            400..=499 if status != 408 && status != 429 => Self::Rejected { status, endpoint },
            _ => Self::Http(format!("HTTP {status} from {endpoint}")),
        }
    }

    /// Returns `true` if the failure is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Stream(_) | Self::Timeout { .. } | Self::Frame(_)
        )
    }

    /// Returns `true` if the client must stop and wait for a fresh `connect()`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Exhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_rejections() {
        for status in [400, 401, 403, 404] {
            let err = DeliveryError::from_status(status, "/realtime/stream");
            assert!(err.is_terminal(), "{status} should be terminal");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        for status in [408, 429, 500, 502, 503] {
            let err = DeliveryError::from_status(status, "/realtime/stream");
            assert!(err.is_retryable(), "{status} should be retryable");
            assert!(!err.is_terminal());
        }
    }

    #[test]
    fn handler_error_is_neither() {
        let err = DeliveryError::Handler {
            event_type: "staking".into(),
            message: "boom".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_terminal());
        assert_eq!(err.to_string(), "handler for `staking` failed: boom");
    }
}
