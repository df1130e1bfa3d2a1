//! Constants and shared types for the SPV client network layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Client version string sent as the first argument of `server.version`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum server version accepted during the handshake. Servers reporting
/// a lexicographically smaller version tuple are rejected as incompatible.
pub const MINIMUM_REQUIRED: [u32; 3] = [0, 65, 0];

/// Upper bound on a single JSON-RPC frame. The per-session error budget is
/// the same bound, which in practice means a session is never dropped for
/// protocol noise alone.
pub const MAX_FRAME_SIZE: usize = 1 << 32;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Default per-call timeout for a session.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Timeout for the `server.version` handshake.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 3;

/// Timeout for establishing the TCP transport.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 6;

// =============================================================================
// RECONNECT POLICY
// =============================================================================

/// First retry delay after a transport failure, and the steady tick of a
/// healthy reconnect loop.
pub const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Cap on the exponential transport-failure backoff.
pub const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Backoff multiplier applied after each consecutive transport failure.
pub const RETRY_BACKOFF_FACTOR: u64 = 2;

/// Retry delay after a server-side handshake error or an incompatible
/// version report.
pub const SERVER_ERROR_RETRY_DELAY_SECS: u64 = 60 * 60;

/// Delay before re-probing an endpoint that collapsed into another session
/// resolving to the same peer address.
pub const DUPLICATE_RECHECK_DELAY_SECS: u64 = 60 * 60;

// =============================================================================
// CALL FACADE
// =============================================================================

/// Permits on the global retriable-call semaphore.
pub const MAX_CONCURRENT_CALLS: usize = 16;

/// A wallet server endpoint as configured: host name (or literal IP) and
/// port. Identity is by this tuple; the resolved peer address is only
/// observed after connect and used to detect DNS aliases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        if host.is_empty() {
            return Err(format!("empty host in {s:?}"));
        }
        let port = port.parse::<u16>().map_err(|e| format!("bad port in {s:?}: {e}"))?;
        Ok(Self::new(host, port))
    }
}

/// Network-layer configuration, consumed by [`crate::net::Network`].
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Default wallet servers, one pooled session each.
    pub default_servers: Vec<ServerEndpoint>,
    /// Timeout for establishing the TCP transport.
    pub connect_timeout: Duration,
    /// Per-call timeout for pooled sessions.
    pub session_timeout: Duration,
}

impl NetConfig {
    pub fn new(default_servers: Vec<ServerEndpoint>) -> Self {
        Self {
            default_servers,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            session_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Parse a dotted server version string into a tuple for lexicographic
/// comparison against [`MINIMUM_REQUIRED`]. `None` when any piece is not
/// an integer.
pub fn parse_server_version(version: &str) -> Option<Vec<u32>> {
    version.split('.').map(|piece| piece.parse::<u32>().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_and_display() {
        let ep: ServerEndpoint = "spv.example.com:50001".parse().unwrap();
        assert_eq!(ep, ServerEndpoint::new("spv.example.com", 50001));
        assert_eq!(ep.to_string(), "spv.example.com:50001");

        assert!("nocolon".parse::<ServerEndpoint>().is_err());
        assert!(":50001".parse::<ServerEndpoint>().is_err());
        assert!("host:notaport".parse::<ServerEndpoint>().is_err());
    }

    #[test]
    fn version_comparison_edges() {
        let below = parse_server_version("0.64.99").unwrap();
        let exact = parse_server_version("0.65.0").unwrap();
        let above = parse_server_version("1.0.0").unwrap();
        assert!(below.as_slice() < &MINIMUM_REQUIRED[..]);
        assert!(exact.as_slice() >= &MINIMUM_REQUIRED[..]);
        assert!(above.as_slice() >= &MINIMUM_REQUIRED[..]);

        // A truncated tuple compares below, same as the tuple semantics the
        // servers themselves use.
        let short = parse_server_version("0.65").unwrap();
        assert!(short.as_slice() < &MINIMUM_REQUIRED[..]);

        assert!(parse_server_version("0.65.x").is_none());
    }
}
