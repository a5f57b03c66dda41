//! Wire protocol for gank tunnels
//!
//! Every unit on the control connection is a [`Frame`], prefixed on the wire
//! by a big-endian `u16` length. [`FrameCodec`] handles the prefix and splits
//! large stream payloads into segments of at most [`MAX_SEGMENT_SIZE`] bytes.

pub mod codec;
pub mod frame;
pub mod segment;
pub mod stream_id;
pub mod udp;

pub use codec::FrameCodec;
pub use frame::{Frame, FrameType, Status, TunnelRequest, TunnelType};
pub use segment::{segment, MAX_SEGMENT_SIZE};
pub use stream_id::StreamId;
pub use udp::{peer_tag, DatagramCodec, UDP_TAG_LEN};

use thiserror::Error;

/// Largest frame body that fits behind the `u16` length prefix
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Secret-key prefix of the stcp side that exposes a local service
pub const STCP_LEFT_PREFIX: &str = "stcp_left_";

/// Secret-key prefix of the stcp side that connects to it
pub const STCP_RIGHT_PREFIX: &str = "stcp_right_";

/// Protocol errors
///
/// Every variant except `Io` is a decode or encode failure of the peer's or
/// our own bytes and is fatal to the control connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Truncated {0} frame")]
    Truncated(FrameType),

    #[error("Invalid status byte: {0:#04x}")]
    InvalidStatus(u8),

    #[error("Unknown tunnel type: {0}")]
    UnknownTunnelType(u8),

    #[error("Invalid UTF-8 in {0} frame")]
    InvalidUtf8(FrameType),

    #[error("Invalid tunnel request: {0}")]
    InvalidTunnelRequest(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid datagram record: {0}")]
    InvalidDatagram(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Milliseconds since the UNIX epoch, as carried by PING/PONG
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
