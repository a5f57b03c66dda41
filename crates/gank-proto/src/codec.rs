//! Length-prefixed framing for the control connection

use crate::frame::Frame;
use crate::segment::segment;
use crate::{ProtoError, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec
///
/// Format: `[length: u16 BE][frame body]`. STREAM_DATA frames whose payload
/// exceeds the segment size are written as several consecutive DATA frames
/// for the same stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub const LENGTH_PREFIX: usize = 2;

    pub fn new() -> Self {
        Self
    }

    fn put_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let len = frame.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(len));
        }
        dst.reserve(Self::LENGTH_PREFIX + len);
        let start = dst.len();
        dst.put_u16(len as u16);
        if let Err(e) = frame.encode(dst) {
            dst.truncate(start);
            return Err(e);
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
        if src.len() < Self::LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < Self::LENGTH_PREFIX + length {
            src.reserve(Self::LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(Self::LENGTH_PREFIX);
        let body = src.split_to(length).freeze();
        Frame::decode(body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        match frame {
            Frame::StreamData { id, data } => {
                for chunk in segment(data) {
                    Self::put_frame(&Frame::StreamData { id, data: chunk }, dst)?;
                }
                Ok(())
            }
            other => Self::put_frame(&other, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Status, StreamId, MAX_SEGMENT_SIZE};
    use bytes::Bytes;

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        buf
    }

    fn decode_all(buf: &mut BytesMut) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_encode_decode() {
        let frame = Frame::Ping { sent_at: 12345 };
        let mut buf = encode_all(&[frame.clone()]);
        assert_eq!(&buf[..2], &[0, 9]);

        let decoded = decode_all(&mut buf);
        assert_eq!(decoded, vec![frame]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::AuthResponse {
            status: Status::Ok,
            message: "welcome".into(),
        };
        let encoded = encode_all(&[frame.clone()]);
        let mut codec = FrameCodec::new();

        // Only the length prefix
        let mut buf = BytesMut::from(&encoded[..2]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[2..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_every_split_offset() {
        let id = StreamId::new();
        let frames = vec![
            Frame::StreamInit { id },
            Frame::StreamData {
                id,
                data: Bytes::from_static(b"payload bytes"),
            },
            Frame::StreamFin { id },
        ];
        let encoded = encode_all(&frames);

        for split in 0..=encoded.len() {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            let mut out = Vec::new();

            buf.extend_from_slice(&encoded[..split]);
            while let Some(f) = codec.decode(&mut buf).unwrap() {
                out.push(f);
            }
            buf.extend_from_slice(&encoded[split..]);
            while let Some(f) = codec.decode(&mut buf).unwrap() {
                out.push(f);
            }

            assert_eq!(out, frames, "split at {}", split);
        }
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let id = StreamId::new();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let encoded = encode_all(&[
            Frame::StreamInit { id },
            Frame::StreamData {
                id,
                data: Bytes::from(payload.clone()),
            },
            Frame::StreamFin { id },
            Frame::StreamReset {
                id,
                reason: "done".into(),
            },
        ]);

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in encoded.iter() {
            buf.extend_from_slice(&[*byte]);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                out.push(frame);
            }
        }
        assert!(buf.is_empty());

        // INIT, three DATA segments, FIN, RST
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], Frame::StreamInit { id });
        let mut joined = Vec::new();
        for frame in &out[1..4] {
            match frame {
                Frame::StreamData { id: got, data } => {
                    assert_eq!(*got, id);
                    joined.extend_from_slice(data);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(joined, payload);
        assert_eq!(out[4], Frame::StreamFin { id });
        assert_eq!(
            out[5],
            Frame::StreamReset {
                id,
                reason: "done".into()
            }
        );
    }

    #[test]
    fn test_large_data_is_segmented() {
        let id = StreamId::new();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let mut buf = encode_all(&[Frame::StreamData {
            id,
            data: Bytes::from(payload.clone()),
        }]);

        let frames = decode_all(&mut buf);
        assert_eq!(frames.len(), 3);

        let mut joined = Vec::new();
        for frame in frames {
            match frame {
                Frame::StreamData { id: got, data } => {
                    assert_eq!(got, id);
                    assert!(data.len() <= MAX_SEGMENT_SIZE);
                    joined.extend_from_slice(&data);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_oversized_control_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::AuthRequest {
            token: "x".repeat(70_000),
        };
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_type_fails_decode() {
        let mut buf = BytesMut::from(&[0u8, 2, 0x77, 0][..]);
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtoError::UnknownFrameType(0x77))
        ));
    }
}
