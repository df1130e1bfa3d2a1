//! SPV client networking: sessions, pool, master switching.

pub mod events;
pub mod message;
pub mod network;
pub mod pool;
pub mod session;
pub mod types;

// Re-exports
pub use events::EventStream;
pub use network::Network;
pub use pool::{PoolStats, SessionPool};
pub use session::{ClientSession, ConnectionState, Ledger};
pub use types::{
    parse_server_version, NetConfig, ServerEndpoint, CLIENT_VERSION, MINIMUM_REQUIRED,
};
