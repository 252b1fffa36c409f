//! Top-level error type for client operations
//!
//! Each layer has its own error enum; this one wraps them for callers that
//! drive the whole client.

use crate::config::ConfigError;
use crate::protocol::FrameError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// The client that owned a handle has stopped
    #[error("Client service has stopped")]
    ServiceStopped,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_from_layer_errors() {
        let error: ClientError = FrameError::ReservedMessageId.into();
        assert!(matches!(error, ClientError::Frame(_)));
        assert!(error.to_string().starts_with("Frame error"));

        let error: ClientError = TransportError::ConnectionClosed.into();
        assert!(matches!(error, ClientError::Transport(_)));

        let error: ClientError = ConfigError::MissingAuthToken.into();
        assert!(matches!(error, ClientError::Config(_)));
    }

    #[test]
    fn test_stopped_service_message() {
        assert_eq!(
            ClientError::ServiceStopped.to_string(),
            "Client service has stopped"
        );
    }
}
