//! Error types for the multiplexed RPC client.
//!
//! The taxonomy follows how far a failure reaches:
//!
//! - local contract violations ([`ClientError::NotConnected`],
//!   [`ClientError::AuthenticationFailed`]) fail one operation only
//! - [`ClientError::Remote`] is an error object the server attached to one call
//! - [`ClientError::ConnectionClosed`] is delivered to every call still
//!   pending when the transport drops

use std::time::Duration;

use thiserror::Error;

use crate::message::RpcError;

/// JSON-RPC error code the server uses for validation failures.
pub const VALIDATION_ERROR_CODE: i64 = 422;

/// Client-side error type.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A call was attempted while the transport is not open.
    #[error("Not connected")]
    NotConnected,

    /// Failed to establish the transport.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// The connection was torn down before the call was resolved.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server returned a JSON-RPC error object for this call.
    #[error("{}", describe_remote(.code, .message, .data))]
    Remote {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<serde_json::Value>,
    },

    /// Authentication handshake did not yield a user.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Protocol-level error (framing, encoding, unexpected shapes).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Call was not resolved within the configured timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Payload could not be converted to or from JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether this error means the connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ClientError::ConnectionClosed | ClientError::NotConnected)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionFailed(err)
            }
            _ => ClientError::Io(err),
        }
    }
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Render a server error, surfacing validation details verbatim.
fn describe_remote(code: &i64, message: &str, data: &Option<serde_json::Value>) -> String {
    if *code == VALIDATION_ERROR_CODE {
        if let Some(errors) = data.as_ref().and_then(|d| d.get("errors")) {
            return format!("Server error {}: {}: {}", code, message, errors);
        }
    }
    format!("Server error {}: {}", code, message)
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;
