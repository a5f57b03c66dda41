//! Protocol frames and their binary layout

use crate::{ProtoError, StreamId, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Frame type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    AuthRequest = 0x00,
    AuthResponse = 0x01,
    Ping = 0x06,
    Pong = 0x09,
    TunnelRequest = 0xA6,
    TunnelResponse = 0xA9,
    StreamInit = 0xF0,
    StreamEstablished = 0xF1,
    StreamData = 0xF2,
    StreamFin = 0xF3,
    StreamReset = 0xF4,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::AuthRequest),
            0x01 => Ok(FrameType::AuthResponse),
            0x06 => Ok(FrameType::Ping),
            0x09 => Ok(FrameType::Pong),
            0xA6 => Ok(FrameType::TunnelRequest),
            0xA9 => Ok(FrameType::TunnelResponse),
            0xF0 => Ok(FrameType::StreamInit),
            0xF1 => Ok(FrameType::StreamEstablished),
            0xF2 => Ok(FrameType::StreamData),
            0xF3 => Ok(FrameType::StreamFin),
            0xF4 => Ok(FrameType::StreamReset),
            _ => Err(ProtoError::UnknownFrameType(value)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::AuthRequest => "AUTH_REQ",
            FrameType::AuthResponse => "AUTH_RES",
            FrameType::Ping => "PING",
            FrameType::Pong => "PONG",
            FrameType::TunnelRequest => "TUNNEL_REQ",
            FrameType::TunnelResponse => "TUNNEL_RES",
            FrameType::StreamInit => "STREAM_INIT",
            FrameType::StreamEstablished => "STREAM_EST",
            FrameType::StreamData => "STREAM_DATA",
            FrameType::StreamFin => "STREAM_FIN",
            FrameType::StreamReset => "STREAM_RST",
        };
        f.write_str(name)
    }
}

/// Status byte of handshake frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Carried by requests
    None = 0x00,
    Ok = 0x01,
    Fail = 0x02,
}

impl TryFrom<u8> for Status {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Status::None),
            0x01 => Ok(Status::Ok),
            0x02 => Ok(Status::Fail),
            _ => Err(ProtoError::InvalidStatus(value)),
        }
    }
}

/// Kind of tunnel a client asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TunnelType {
    Tcp = 1,
    Web = 2,
    Udp = 3,
    Stcp = 4,
}

impl TryFrom<u8> for TunnelType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TunnelType::Tcp),
            2 => Ok(TunnelType::Web),
            3 => Ok(TunnelType::Udp),
            4 => Ok(TunnelType::Stcp),
            _ => Err(ProtoError::UnknownTunnelType(value)),
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TunnelType::Tcp => "tcp",
            TunnelType::Web => "web",
            TunnelType::Udp => "udp",
            TunnelType::Stcp => "stcp",
        })
    }
}

impl FromStr for TunnelType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TunnelType::Tcp),
            "web" | "http" => Ok(TunnelType::Web),
            "udp" => Ok(TunnelType::Udp),
            "stcp" => Ok(TunnelType::Stcp),
            other => Err(ProtoError::InvalidTunnelRequest(format!(
                "unknown tunnel type '{}'",
                other
            ))),
        }
    }
}

/// Body of a TUNNEL_REQ frame
///
/// `value` is the remote port for tcp/udp, the subdomain for web and the
/// secret key for stcp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub tunnel_type: TunnelType,
    pub name: String,
    pub value: String,
}

impl TunnelRequest {
    pub fn new(tunnel_type: TunnelType, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tunnel_type,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn tcp(name: impl Into<String>, remote_port: u16) -> Self {
        Self::new(TunnelType::Tcp, name, remote_port.to_string())
    }

    pub fn udp(name: impl Into<String>, remote_port: u16) -> Self {
        Self::new(TunnelType::Udp, name, remote_port.to_string())
    }

    pub fn web(name: impl Into<String>, subdomain: impl Into<String>) -> Self {
        Self::new(TunnelType::Web, name, subdomain)
    }

    pub fn stcp(name: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self::new(TunnelType::Stcp, name, secret_key)
    }

    /// Requested public port, for tcp and udp tunnels
    pub fn port(&self) -> Option<u16> {
        match self.tunnel_type {
            TunnelType::Tcp | TunnelType::Udp => self.value.parse().ok(),
            _ => None,
        }
    }

    /// Reject requests the peer could not parse
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.name.contains(':') {
            return Err(ProtoError::InvalidTunnelRequest(format!(
                "tunnel name '{}' contains ':'",
                self.name
            )));
        }
        if matches!(self.tunnel_type, TunnelType::Tcp | TunnelType::Udp)
            && self.value.parse::<u16>().is_err()
        {
            return Err(ProtoError::InvalidTunnelRequest(format!(
                "invalid port '{}'",
                self.value
            )));
        }
        Ok(())
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AuthRequest { token: String },
    AuthResponse { status: Status, message: String },
    Ping { sent_at: u64 },
    Pong { sent_at: u64, answered_at: u64 },
    TunnelRequest(TunnelRequest),
    TunnelResponse { status: Status, message: String },
    StreamInit { id: StreamId },
    StreamEstablished { id: StreamId },
    StreamData { id: StreamId, data: Bytes },
    StreamFin { id: StreamId },
    StreamReset { id: StreamId, reason: String },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::AuthRequest { .. } => FrameType::AuthRequest,
            Frame::AuthResponse { .. } => FrameType::AuthResponse,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::TunnelRequest(_) => FrameType::TunnelRequest,
            Frame::TunnelResponse { .. } => FrameType::TunnelResponse,
            Frame::StreamInit { .. } => FrameType::StreamInit,
            Frame::StreamEstablished { .. } => FrameType::StreamEstablished,
            Frame::StreamData { .. } => FrameType::StreamData,
            Frame::StreamFin { .. } => FrameType::StreamFin,
            Frame::StreamReset { .. } => FrameType::StreamReset,
        }
    }

    /// Stream the frame belongs to, if it is a stream frame
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::StreamInit { id }
            | Frame::StreamEstablished { id }
            | Frame::StreamData { id, .. }
            | Frame::StreamFin { id }
            | Frame::StreamReset { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Size of the encoded body, without the length prefix
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::AuthRequest { token } => 1 + token.len(),
            Frame::AuthResponse { message, .. } | Frame::TunnelResponse { message, .. } => {
                1 + message.len()
            }
            Frame::Ping { .. } => 8,
            Frame::Pong { .. } => 16,
            Frame::TunnelRequest(req) => 1 + req.name.len() + 1 + req.value.len(),
            Frame::StreamInit { .. }
            | Frame::StreamEstablished { .. }
            | Frame::StreamFin { .. } => StreamId::LEN,
            Frame::StreamData { data, .. } => StreamId::LEN + data.len(),
            Frame::StreamReset { reason, .. } => StreamId::LEN + reason.len(),
        }
    }

    /// Check that the frame can be written as one length-prefixed frame.
    ///
    /// STREAM_DATA is exempt from the size limit since the codec segments it.
    pub fn check(&self) -> Result<(), ProtoError> {
        if let Frame::TunnelRequest(req) = self {
            req.validate()?;
        }
        let len = self.encoded_len();
        if len > MAX_FRAME_SIZE && !matches!(self, Frame::StreamData { .. }) {
            return Err(ProtoError::FrameTooLarge(len));
        }
        Ok(())
    }

    /// Append the frame body to `dst`
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtoError> {
        if let Frame::TunnelRequest(req) = self {
            req.validate()?;
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(self.frame_type() as u8);

        match self {
            Frame::AuthRequest { token } => {
                dst.put_u8(Status::None as u8);
                dst.put_slice(token.as_bytes());
            }
            Frame::AuthResponse { status, message }
            | Frame::TunnelResponse { status, message } => {
                dst.put_u8(*status as u8);
                dst.put_slice(message.as_bytes());
            }
            Frame::Ping { sent_at } => dst.put_u64(*sent_at),
            Frame::Pong {
                sent_at,
                answered_at,
            } => {
                dst.put_u64(*sent_at);
                dst.put_u64(*answered_at);
            }
            Frame::TunnelRequest(req) => {
                dst.put_u8(req.tunnel_type as u8);
                dst.put_slice(req.name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(req.value.as_bytes());
            }
            Frame::StreamInit { id }
            | Frame::StreamEstablished { id }
            | Frame::StreamFin { id } => dst.put_slice(id.as_bytes()),
            Frame::StreamData { id, data } => {
                dst.put_slice(id.as_bytes());
                dst.put_slice(data);
            }
            Frame::StreamReset { id, reason } => {
                dst.put_slice(id.as_bytes());
                dst.put_slice(reason.as_bytes());
            }
        }

        Ok(())
    }

    /// Decode one complete frame body
    pub fn decode(mut src: Bytes) -> Result<Frame, ProtoError> {
        if src.is_empty() {
            return Err(ProtoError::EmptyFrame);
        }
        let frame_type = FrameType::try_from(src.get_u8())?;

        let frame = match frame_type {
            FrameType::AuthRequest => {
                need(&src, 1, frame_type)?;
                // Requests carry a status byte that is never inspected
                let _ = Status::try_from(src.get_u8())?;
                Frame::AuthRequest {
                    token: utf8(src, frame_type)?,
                }
            }
            FrameType::AuthResponse | FrameType::TunnelResponse => {
                need(&src, 1, frame_type)?;
                let status = Status::try_from(src.get_u8())?;
                let message = utf8(src, frame_type)?;
                if frame_type == FrameType::AuthResponse {
                    Frame::AuthResponse { status, message }
                } else {
                    Frame::TunnelResponse { status, message }
                }
            }
            FrameType::Ping => {
                need(&src, 8, frame_type)?;
                Frame::Ping {
                    sent_at: src.get_u64(),
                }
            }
            FrameType::Pong => {
                need(&src, 16, frame_type)?;
                Frame::Pong {
                    sent_at: src.get_u64(),
                    answered_at: src.get_u64(),
                }
            }
            FrameType::TunnelRequest => {
                need(&src, 1, frame_type)?;
                let tunnel_type = TunnelType::try_from(src.get_u8())?;
                let body = utf8(src, frame_type)?;
                let (name, value) = body.split_once(':').ok_or_else(|| {
                    ProtoError::InvalidTunnelRequest(format!("missing ':' in '{}'", body))
                })?;
                let req = TunnelRequest::new(tunnel_type, name, value);
                req.validate()?;
                Frame::TunnelRequest(req)
            }
            FrameType::StreamInit
            | FrameType::StreamEstablished
            | FrameType::StreamData
            | FrameType::StreamFin
            | FrameType::StreamReset => {
                let id = StreamId::from_slice(&src).ok_or(ProtoError::Truncated(frame_type))?;
                src.advance(StreamId::LEN);
                match frame_type {
                    FrameType::StreamInit => Frame::StreamInit { id },
                    FrameType::StreamEstablished => Frame::StreamEstablished { id },
                    FrameType::StreamData => Frame::StreamData { id, data: src },
                    FrameType::StreamFin => Frame::StreamFin { id },
                    _ => Frame::StreamReset {
                        id,
                        reason: utf8(src, frame_type)?,
                    },
                }
            }
        };

        Ok(frame)
    }
}

fn need(src: &Bytes, len: usize, frame_type: FrameType) -> Result<(), ProtoError> {
    if src.len() < len {
        return Err(ProtoError::Truncated(frame_type));
    }
    Ok(())
}

fn utf8(src: Bytes, frame_type: FrameType) -> Result<String, ProtoError> {
    String::from_utf8(src.to_vec()).map_err(|_| ProtoError::InvalidUtf8(frame_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len());
        Frame::decode(buf.freeze()).unwrap()
    }

    #[test]
    fn test_check_rejects_unwritable_frames() {
        let token = Frame::AuthRequest {
            token: "x".repeat(70_000),
        };
        assert!(matches!(token.check(), Err(ProtoError::FrameTooLarge(_))));

        let named = Frame::TunnelRequest(TunnelRequest::web("a:b", "blog"));
        assert!(matches!(
            named.check(),
            Err(ProtoError::InvalidTunnelRequest(_))
        ));
        let port = Frame::TunnelRequest(TunnelRequest::new(TunnelType::Tcp, "ssh", "http"));
        assert!(port.check().is_err());

        let data = Frame::StreamData {
            id: StreamId::new(),
            data: Bytes::from(vec![0u8; 70_000]),
        };
        assert!(data.check().is_ok());
        assert!(Frame::Ping { sent_at: 1 }.check().is_ok());
    }

    #[test]
    fn test_every_frame_kind_roundtrips() {
        let id = StreamId::new();
        let frames = vec![
            Frame::AuthRequest {
                token: "secret".into(),
            },
            Frame::AuthResponse {
                status: Status::Ok,
                message: "ok".into(),
            },
            Frame::Ping { sent_at: 1234 },
            Frame::Pong {
                sent_at: 1234,
                answered_at: 1240,
            },
            Frame::TunnelRequest(TunnelRequest::tcp("ssh", 2222)),
            Frame::TunnelRequest(TunnelRequest::web("site", "blog")),
            Frame::TunnelRequest(TunnelRequest::stcp("db", "stcp_left_key:with:colons")),
            Frame::TunnelResponse {
                status: Status::Fail,
                message: "subdomain existed: blog".into(),
            },
            Frame::StreamInit { id },
            Frame::StreamEstablished { id },
            Frame::StreamData {
                id,
                data: Bytes::from_static(b"hello"),
            },
            Frame::StreamFin { id },
            Frame::StreamReset {
                id,
                reason: "connection refused".into(),
            },
        ];

        for frame in frames {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_empty_payloads_roundtrip() {
        let id = StreamId::new();
        for frame in [
            Frame::AuthRequest {
                token: String::new(),
            },
            Frame::TunnelResponse {
                status: Status::Ok,
                message: String::new(),
            },
            Frame::StreamData {
                id,
                data: Bytes::new(),
            },
            Frame::StreamReset {
                id,
                reason: String::new(),
            },
        ] {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        Frame::Ping { sent_at: 1 }.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x06, 0, 0, 0, 0, 0, 0, 0, 1]);

        let mut buf = BytesMut::new();
        Frame::TunnelRequest(TunnelRequest::tcp("a", 80))
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0xA6, 1, b'a', b':', b'8', b'0']);

        let mut buf = BytesMut::new();
        Frame::AuthRequest { token: "t".into() }
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x00, 0x00, b't']);
    }

    #[test]
    fn test_unknown_type_is_error() {
        let err = Frame::decode(Bytes::from_static(&[0x42, 1, 2])).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownFrameType(0x42)));
    }

    #[test]
    fn test_truncated_bodies() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x06, 0, 0])),
            Err(ProtoError::Truncated(FrameType::Ping))
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0xF2, 1, 2, 3])),
            Err(ProtoError::Truncated(FrameType::StreamData))
        ));
        assert!(matches!(
            Frame::decode(Bytes::new()),
            Err(ProtoError::EmptyFrame)
        ));
    }

    #[test]
    fn test_bad_tunnel_requests() {
        // Non-numeric tcp port
        assert!(matches!(
            Frame::decode(Bytes::from_static(b"\xA6\x01ssh:abc")),
            Err(ProtoError::InvalidTunnelRequest(_))
        ));
        // Unknown tunnel type code
        assert!(matches!(
            Frame::decode(Bytes::from_static(b"\xA6\x09ssh:22")),
            Err(ProtoError::UnknownTunnelType(9))
        ));
        // Missing separator
        assert!(matches!(
            Frame::decode(Bytes::from_static(b"\xA6\x02site")),
            Err(ProtoError::InvalidTunnelRequest(_))
        ));
        // Names cannot carry the separator
        let mut buf = BytesMut::new();
        assert!(Frame::TunnelRequest(TunnelRequest::web("a:b", "x"))
            .encode(&mut buf)
            .is_err());
    }

    #[test]
    fn test_invalid_status_and_utf8() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x01, 0x07])),
            Err(ProtoError::InvalidStatus(7))
        ));
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0xA9, 0x01, 0xff, 0xfe])),
            Err(ProtoError::InvalidUtf8(FrameType::TunnelResponse))
        ));
    }

    #[test]
    fn test_tunnel_type_parse() {
        assert_eq!("TCP".parse::<TunnelType>().unwrap(), TunnelType::Tcp);
        assert_eq!("http".parse::<TunnelType>().unwrap(), TunnelType::Web);
        assert!("quic".parse::<TunnelType>().is_err());
        assert_eq!(TunnelRequest::udp("dns", 5353).port(), Some(5353));
        assert_eq!(TunnelRequest::web("site", "blog").port(), None);
    }
}
