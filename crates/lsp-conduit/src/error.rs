//! Error types for the byte transport, the correlation engine and the
//! process host.
//!
//! [`RpcError`] is what callers of [`crate::Connection`] observe. It is
//! `Clone` because a single process failure fans out to every outstanding
//! request, so the I/O and codec errors it carries are shared behind `Arc`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::ResponseError;

/// Errors delivered to the initiator of a request or notification.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The caller's payload could not be serialized to JSON.
    #[error("failed to encode message: {0}")]
    Encoding(Arc<serde_json::Error>),

    /// The byte transport rejected the write.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The matched response could not be decoded into the expected type.
    #[error("failed to decode response: {message}")]
    Decoding {
        /// Description of the decoding failure.
        message: String,
    },

    /// The peer answered with a JSON-RPC error object.
    #[error("server returned error: {message} (code: {code})")]
    Server {
        /// The JSON-RPC error code.
        code: i64,
        /// The error message from the server.
        message: String,
        /// Optional structured data attached by the server.
        data: Option<Value>,
    },

    /// The server process terminated while the request was outstanding.
    #[error("language server is unavailable")]
    ServerUnavailable,

    /// The request was cancelled locally before a response arrived.
    #[error("request was cancelled")]
    Cancelled,

    /// No response arrived within the configured timeout.
    #[error("request timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The connection was shut down.
    #[error("connection closed")]
    ConnectionClosed,
}

impl RpcError {
    /// Creates a server error from a JSON-RPC error object.
    #[must_use]
    pub fn from_response_error(error: ResponseError) -> Self {
        Self::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// Returns the JSON-RPC code when the peer reported the failure.
    #[must_use]
    pub const fn server_code(&self) -> Option<i64> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(error: serde_json::Error) -> Self {
        Self::Encoding(Arc::new(error))
    }
}

/// Byte transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The transport has not been started yet.
    #[error("transport has not been started")]
    NotStarted,

    /// The transport refused the write because it is closed.
    #[error("transport is closed")]
    Closed,
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

/// Errors raised while managing the language server process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The language server binary was not found.
    #[error("language server binary not found: {command}")]
    BinaryNotFound {
        /// The command that was not found.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Failed to spawn the language server process.
    #[error("failed to spawn language server process: {message}")]
    SpawnFailed {
        /// Description of the spawn failure.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// `start` was called on a transport that has already been started.
    #[error("language server process has already been started")]
    AlreadyStarted,

    /// The process has already terminated and cannot be reused.
    #[error("language server process has terminated")]
    Terminated,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn server_error_keeps_code_message_and_data() {
        let error = RpcError::from_response_error(ResponseError {
            code: -32602,
            message: String::from("Invalid params"),
            data: Some(json!({"field": "uri"})),
        });

        assert_eq!(error.server_code(), Some(-32602));
        assert_eq!(
            error.to_string(),
            "server returned error: Invalid params (code: -32602)"
        );
        assert!(matches!(error, RpcError::Server { data: Some(_), .. }));
    }

    #[rstest]
    fn server_unavailable_is_distinct_from_peer_errors() {
        let error = RpcError::ServerUnavailable;

        assert_eq!(error.server_code(), None);
        assert_eq!(error.to_string(), "language server is unavailable");
    }

    #[rstest]
    fn io_errors_convert_into_transport_errors() {
        let error: RpcError =
            TransportError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")).into();

        assert!(matches!(error, RpcError::Transport(TransportError::Io(_))));
        assert!(error.to_string().contains("pipe closed"));
    }

    #[rstest]
    fn timeout_reports_duration_in_milliseconds() {
        let error = RpcError::Timeout {
            timeout: Duration::from_millis(250),
        };

        assert_eq!(error.to_string(), "request timed out after 250ms");
    }
}
