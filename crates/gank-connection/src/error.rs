//! Tunnel errors

use gank_proto::ProtoError;
use thiserror::Error;

/// Errors surfaced by a tunnel and its streams
///
/// Only `Protocol` and `Io` errors from the transport end the control
/// connection. A frame refused before sending is returned as `Protocol` and
/// leaves the tunnel open. Stream and negotiation failures are reported to
/// the caller and the tunnel carries on.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Tunnel negotiation failed: {0}")]
    Negotiation(String),

    #[error("Stream reset: {0}")]
    StreamReset(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream not ready")]
    StreamNotReady,

    #[error("Timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    #[error("Tunnel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
