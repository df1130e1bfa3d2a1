//! Error kinds shared across the session, pool and network layers.

use crate::net::types::ServerEndpoint;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// Bounded wait exceeded under the keepalive rule.
    #[error("request timed out")]
    Timeout,

    /// Transport closed by the peer or aborted locally mid-call.
    #[error("connection lost")]
    ConnectionLost,

    /// Transport could not be established, or no session was available.
    #[error("connection error: {0}")]
    Connection(String),

    /// Server returned a JSON-RPC error for the current call.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Framing or decode failure on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server advertises a version below the supported minimum.
    #[error("incompatible wallet server {0}")]
    Incompatible(ServerEndpoint),

    /// Shutdown or explicit cancellation.
    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl NetError {
    /// True for the kinds the retriable-call facade retries: timeouts and
    /// both flavors of connection failure. `Rpc` and `Incompatible` always
    /// surface to the caller.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            NetError::Timeout | NetError::ConnectionLost | NetError::Connection(_) | NetError::Io(_)
        )
    }

    /// True for server-side errors that the reconnect loop treats as a
    /// long-lived condition (1 hour backoff).
    pub fn is_server_error(&self) -> bool {
        matches!(self, NetError::Rpc { .. } | NetError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(NetError::Timeout.is_retriable());
        assert!(NetError::ConnectionLost.is_retriable());
        assert!(NetError::Connection("unreachable".into()).is_retriable());
        assert!(!NetError::Rpc { code: 1, message: "busy".into() }.is_retriable());
        assert!(!NetError::Cancelled.is_retriable());
    }

    #[test]
    fn server_error_kinds() {
        assert!(NetError::Rpc { code: 1, message: "busy".into() }.is_server_error());
        assert!(NetError::Protocol("bad frame".into()).is_server_error());
        assert!(!NetError::Timeout.is_server_error());
    }
}
