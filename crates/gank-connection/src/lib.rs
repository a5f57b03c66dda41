//! Tunnel sessions and the virtual streams they carry
//!
//! One [`Tunnel`] runs per control connection. It performs the auth and
//! tunnel handshakes and multiplexes any number of [`VirtualStream`]s over
//! the same socket.

pub mod bridge;
pub mod deferred;
pub mod error;
pub mod stream;
pub mod tunnel;

pub use bridge::bridge;
pub use deferred::{Deferred, Pending};
pub use error::TunnelError;
pub use stream::{CloseReason, StreamSink, VirtualStream};
pub use tunnel::{
    AuthHandler, Handler, Incoming, StreamState, Tunnel, TunnelConfig, TunnelRequestHandler,
    Unstarted,
};
