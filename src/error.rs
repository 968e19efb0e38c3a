//! Error types shared by every layer of the client.
//!
//! A single enum covers transport, codec and session failures. Errors are
//! `Clone` because a terminal transport error is recorded once and then handed
//! back to every later call on the dead session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::Value;

/// Result alias used throughout the crate.
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// Errors raised by the transport, codec and session layers.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The transport could not be established.
    #[error("Connection to {target} failed: {source}")]
    Connection {
        /// Human readable transport target
        target: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Read or write failure after the transport was connected.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The remote host closed the connection.
    #[error("Connection closed by the remote host (EOF)")]
    Eof,

    /// Malformed bytes, a non-envelope value or an unknown extension tag.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A value could not be serialized for the wire.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A per-call timeout elapsed.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A process signal stopped the event loop.
    #[error("Interrupted by signal {0}")]
    Signal(i32),

    /// The remote host answered a request with an error payload.
    #[error("Remote error: {message}")]
    Remote {
        /// Message extracted from the payload
        message: String,
        /// Raw error payload as sent by the host
        payload: Value,
    },

    /// The session is no longer usable, or a pending call was torn down.
    #[error("Session closed: {0}")]
    Closed(String),

    /// `run` was called while the session was already running.
    #[error("Session is already running")]
    AlreadyRunning,
}

impl RpcError {
    /// Build a `Remote` error from a response error payload.
    ///
    /// Hosts usually send `[error_type, "message"]`; anything else is
    /// rendered as-is.
    pub fn remote(payload: Value) -> Self {
        let message = match &payload {
            Value::Array(items) => match items.as_slice() {
                [_, Value::String(msg)] => msg.clone(),
                _ => payload.to_string(),
            },
            Value::String(msg) => msg.clone(),
            other => other.to_string(),
        };
        RpcError::Remote { message, payload }
    }

    /// Whether the error leaves the session unusable.
    ///
    /// Timeouts, signals, encode failures and remote error payloads only
    /// affect the call that observed them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Connection { .. }
                | RpcError::Io(_)
                | RpcError::Eof
                | RpcError::Decode(_)
                | RpcError::Closed(_)
        )
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => RpcError::Eof,
            _ => RpcError::Io(Arc::new(err)),
        }
    }
}
