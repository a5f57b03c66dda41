//! Server side of gank: negotiation, registry upkeep and public proxies

pub mod config;
pub mod connection;
pub mod handler;
pub mod proxy;
pub mod server;
pub mod state;
pub mod task_tracker;

pub use config::{ServerConfig, TlsPaths};
pub use connection::{ConnectionInfo, TunnelConnectionManager};
pub use handler::{NegotiationError, TunnelHandler};
pub use server::{accept_retrying, serve_connection, ControlError, TunnelServer, ACCEPT_RETRY_DELAY};
pub use state::ServerState;
pub use task_tracker::TaskTracker;
