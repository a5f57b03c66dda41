//! Public HTTP and HTTPS listeners for web tunnels

pub mod server;
pub mod tls;

pub use server::{serve_http, HttpServer};
pub use tls::TlsMaterial;

use thiserror::Error;

/// HTTP(S) front-end errors
#[derive(Debug, Error)]
pub enum HttpsServerError {
    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
