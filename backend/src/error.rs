//! Error types for backend scoring calls.

use std::time::Duration;

use drowsy_common::ErrorPayload;
use tonic::Code;

use crate::inference::GatewayState;

/// Errors surfaced by the inference gateway.
///
/// Every variant is recoverable at the session level: callers answer the
/// offending frame with an `ERROR` envelope and keep the session open.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Backend unavailable (state: {0})")]
    Unavailable(GatewayState),

    #[error("Backend call exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Backend transport failure: {0}")]
    Transport(String),

    #[error("Backend returned an error: {0}")]
    Backend(String),

    #[error("Failed to dial backend: {0}")]
    Dial(String),

    #[error("Backend stream closed")]
    StreamClosed,
}

impl GatewayError {
    /// Stable code carried in `ERROR` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unavailable(_) => "BACKEND_UNAVAILABLE",
            GatewayError::Timeout(_) => "BACKEND_TIMEOUT",
            GatewayError::Transport(_) => "BACKEND_TRANSPORT",
            GatewayError::Backend(_) => "PROCESSING_FAILED",
            GatewayError::Dial(_) => "BACKEND_DIAL",
            GatewayError::StreamClosed => "STREAM_CLOSED",
        }
    }

    /// Whether the failure means the connection itself is gone.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }
}

impl From<tonic::Status> for GatewayError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            Code::Unavailable => GatewayError::Transport(status.message().to_string()),
            Code::DeadlineExceeded => GatewayError::Backend(format!(
                "deadline exceeded: {}",
                status.message()
            )),
            _ => GatewayError::Backend(format!("{:?}: {}", status.code(), status.message())),
        }
    }
}

impl From<tonic::transport::Error> for GatewayError {
    fn from(err: tonic::transport::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = GatewayError::from(tonic::Status::unavailable("connection refused"));
        assert!(err.is_transport());
        assert_eq!(err.code(), "BACKEND_TRANSPORT");

        let err = GatewayError::from(tonic::Status::internal("model crashed"));
        assert!(!err.is_transport());
        assert_eq!(err.code(), "PROCESSING_FAILED");
    }

    #[test]
    fn test_unavailable_payload() {
        let payload = GatewayError::Unavailable(GatewayState::Disconnected).to_payload();
        assert_eq!(payload.code, "BACKEND_UNAVAILABLE");
        assert!(payload.message.contains("disconnected"));
        assert!(payload.sequence_number.is_none());
    }
}
