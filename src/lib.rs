pub mod error;
pub mod net;
pub mod status;

pub use error::NetError;
pub use net::{
    ClientSession, ConnectionState, EventStream, Ledger, NetConfig, Network, ServerEndpoint,
    SessionPool,
};
pub use status::{SpvPing, SpvPong, StatusServer};
