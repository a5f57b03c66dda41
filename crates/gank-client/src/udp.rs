//! Client half of udp tunnels
//!
//! The server tags every datagram with its public sender. Each sender gets a
//! virtual client here: a connected local socket whose replies are tagged
//! with the same peer and written back to the stream.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use gank_connection::VirtualStream;
use gank_proto::DatagramCodec;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, trace};

/// Virtual clients unused for this long are dropped
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct VirtualClient {
    socket: Arc<UdpSocket>,
    last_active: Arc<Mutex<Instant>>,
    replies: JoinHandle<()>,
}

impl VirtualClient {
    fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl Drop for VirtualClient {
    fn drop(&mut self) {
        self.replies.abort();
    }
}

/// Relay the records of one udp stream to `local_addr` until the stream ends
pub async fn serve_udp_stream(stream: VirtualStream, local_addr: String, idle_timeout: Duration) {
    let mut records = FramedRead::new(stream.clone(), DatagramCodec::new());
    let mut clients: HashMap<SocketAddrV4, VirtualClient> = HashMap::new();
    let mut sweep = tokio::time::interval((idle_timeout / 4).max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            record = records.next() => {
                let (peer, datagram) = match record {
                    Some(Ok(record)) => record,
                    Some(Err(e)) => {
                        debug!("UDP stream {} ended: {}", stream.id(), e);
                        break;
                    }
                    None => break,
                };

                if !clients.contains_key(&peer) {
                    match VirtualClient::connect(&local_addr, peer, stream.clone()).await {
                        Ok(client) => {
                            trace!("New virtual UDP client for {}", peer);
                            clients.insert(peer, client);
                        }
                        Err(e) => {
                            debug!("Cannot reach local UDP service {}: {}", local_addr, e);
                            continue;
                        }
                    }
                }
                if let Some(client) = clients.get(&peer) {
                    client.touch();
                    if let Err(e) = client.socket.send(&datagram).await {
                        debug!("Failed to forward datagram from {}: {}", peer, e);
                    }
                }
            }
            _ = sweep.tick() => {
                clients.retain(|peer, client| {
                    let keep = client.idle_for() < idle_timeout;
                    if !keep {
                        trace!("Virtual UDP client for {} expired", peer);
                    }
                    keep
                });
            }
        }
    }

    stream.close();
}

impl VirtualClient {
    async fn connect(
        local_addr: &str,
        peer: SocketAddrV4,
        stream: VirtualStream,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(local_addr).await?;
        let socket = Arc::new(socket);
        let last_active = Arc::new(Mutex::new(Instant::now()));

        let replies = tokio::spawn(relay_replies(
            socket.clone(),
            peer,
            stream,
            last_active.clone(),
        ));
        Ok(Self {
            socket,
            last_active,
            replies,
        })
    }
}

async fn relay_replies(
    socket: Arc<UdpSocket>,
    peer: SocketAddrV4,
    stream: VirtualStream,
    last_active: Arc<Mutex<Instant>>,
) {
    let mut codec = DatagramCodec::new();
    let mut buf = vec![0u8; u16::MAX as usize];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                // ICMP unreachable surfaces here; the service may come back
                trace!("Local UDP receive for {} failed: {}", peer, e);
                continue;
            }
        };
        if let Ok(mut last) = last_active.lock() {
            *last = Instant::now();
        }

        let mut record = BytesMut::new();
        if let Err(e) = codec.encode((peer, Bytes::copy_from_slice(&buf[..n])), &mut record) {
            debug!("Dropping reply for {}: {}", peer, e);
            continue;
        }
        if stream.send(record.freeze()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gank_connection::StreamSink;
    use gank_proto::{Frame, StreamId};

    struct NullSink;

    impl StreamSink for NullSink {
        fn send(&self, _frame: Frame) -> bool {
            true
        }

        fn release(&self, _id: StreamId) {}
    }

    #[tokio::test]
    async fn test_idle_clients_expire() {
        let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_addr = service.local_addr().unwrap().to_string();

        let stream = VirtualStream::new(StreamId::new(), Arc::new(NullSink));
        let task = tokio::spawn(serve_udp_stream(
            stream.clone(),
            local_addr,
            Duration::from_millis(100),
        ));

        let mut record = BytesMut::new();
        DatagramCodec::new()
            .encode(
                ("10.0.0.1:5000".parse().unwrap(), Bytes::from_static(b"one")),
                &mut record,
            )
            .unwrap();
        assert!(stream.produce(record.freeze()));

        let mut buf = [0u8; 16];
        let (n, first) = service.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");

        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut record = BytesMut::new();
        DatagramCodec::new()
            .encode(
                ("10.0.0.1:5000".parse().unwrap(), Bytes::from_static(b"two")),
                &mut record,
            )
            .unwrap();
        assert!(stream.produce(record.freeze()));

        let (n, second) = service.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
        // The expired client was replaced by a fresh socket
        assert_ne!(first, second);

        stream.close();
        task.await.unwrap();
    }
}
