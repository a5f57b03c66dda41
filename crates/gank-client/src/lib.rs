//! Client side of gank
//!
//! A [`TunnelClient`] keeps one control connection per configured
//! [`TunnelDescriptor`] and serves the streams the server opens on it.

pub mod client;
pub mod config;
pub mod error;
pub mod status;
pub mod udp;

pub use client::{ClientHandle, TunnelClient};
pub use config::{ClientConfig, TunnelDescriptor};
pub use error::ClientError;
pub use status::{log_status, StatusCallback, StatusReporter, TunnelStatus};
