//! Datagram records carried inside a UDP tunnel stream
//!
//! A UDP tunnel shares one virtual stream between all remote peers. Each
//! datagram travels as a record:
//!
//! ```text
//! [length: u16 BE][ipv4: 4 bytes][port: u16 BE][datagram]
//! ```
//!
//! where `length` covers the 6-byte peer tag plus the datagram.

use crate::ProtoError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the peer tag (IPv4 address + port)
pub const UDP_TAG_LEN: usize = 6;

/// Peer tag for `addr`. Only IPv4 peers can be tagged.
pub fn peer_tag(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}

/// Codec for tagged datagram records
#[derive(Debug, Default, Clone, Copy)]
pub struct DatagramCodec;

impl DatagramCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for DatagramCodec {
    type Item = (SocketAddrV4, Bytes);
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, ProtoError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        if length < UDP_TAG_LEN {
            return Err(ProtoError::InvalidDatagram("record shorter than peer tag"));
        }
        if src.len() < 2 + length {
            return Ok(None);
        }

        src.advance(2);
        let mut record = src.split_to(length).freeze();
        let ip = Ipv4Addr::new(
            record.get_u8(),
            record.get_u8(),
            record.get_u8(),
            record.get_u8(),
        );
        let port = record.get_u16();
        Ok(Some((SocketAddrV4::new(ip, port), record)))
    }
}

impl Encoder<(SocketAddrV4, Bytes)> for DatagramCodec {
    type Error = ProtoError;

    fn encode(
        &mut self,
        (peer, datagram): (SocketAddrV4, Bytes),
        dst: &mut BytesMut,
    ) -> Result<(), ProtoError> {
        let length = UDP_TAG_LEN + datagram.len();
        if length > u16::MAX as usize {
            return Err(ProtoError::FrameTooLarge(length));
        }
        dst.reserve(2 + length);
        dst.put_u16(length as u16);
        dst.put_slice(&peer.ip().octets());
        dst.put_u16(peer.port());
        dst.put_slice(&datagram);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let peer: SocketAddrV4 = "10.0.0.7:5353".parse().unwrap();
        let mut buf = BytesMut::new();
        DatagramCodec
            .encode((peer, Bytes::from_static(b"hi")), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0, 8, 10, 0, 0, 7, 0x14, 0xe9, b'h', b'i']);
    }

    #[test]
    fn test_two_peers_in_one_buffer() {
        let a: SocketAddrV4 = "1.2.3.4:1000".parse().unwrap();
        let b: SocketAddrV4 = "5.6.7.8:2000".parse().unwrap();
        let mut codec = DatagramCodec::new();
        let mut buf = BytesMut::new();
        codec.encode((a, Bytes::from_static(b"from a")), &mut buf).unwrap();
        codec.encode((b, Bytes::from_static(b"from b")), &mut buf).unwrap();

        // Deliver one byte short first
        let mut partial = buf.split_to(buf.len() - 1);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some((a, Bytes::from_static(b"from a")))
        );
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some((b, Bytes::from_static(b"from b")))
        );
    }

    #[test]
    fn test_short_record_is_error() {
        let mut buf = BytesMut::from(&[0u8, 3, 1, 2, 3][..]);
        assert!(DatagramCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_peer_tag() {
        assert!(peer_tag("127.0.0.1:9".parse().unwrap()).is_some());
        assert!(peer_tag("[::ffff:127.0.0.1]:9".parse().unwrap()).is_some());
        assert!(peer_tag("[::1]:9".parse().unwrap()).is_none());
    }
}
