//! Public-side traffic for tcp, udp and stcp tunnels

use crate::server::accept_retrying;
use crate::ServerState;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use gank_connection::{bridge, Tunnel, VirtualStream};
use gank_proto::{peer_tag, DatagramCodec, STCP_LEFT_PREFIX};
use gank_router::RouteKey;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, trace};

/// Forward every connection accepted on `listener` through a new stream
pub fn spawn_tcp_proxy(tunnel: Tunnel, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (socket, peer) = accept_retrying("public", || listener.accept()).await;
            trace!("Public connection from {} for tunnel {}", peer, tunnel.id());

            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let _ = socket.set_nodelay(true);
                match tunnel.create_stream().await {
                    Ok(stream) => {
                        if let Err(e) = bridge(stream, socket).await {
                            debug!("Connection from {} ended: {}", peer, e);
                        }
                    }
                    Err(e) => debug!("Could not open stream for {}: {}", peer, e),
                }
            });
        }
    })
}

/// Relay datagrams between `socket` and one shared stream of `tunnel`
///
/// The stream is opened on the first datagram and reopened if it closes.
pub fn spawn_udp_proxy(tunnel: Tunnel, socket: UdpSocket) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = Arc::new(socket);
        let mut current: Option<VirtualStream> = None;
        let mut buf = vec![0u8; u16::MAX as usize];

        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("UDP receive failed: {}", e);
                    continue;
                }
            };
            let Some(tag) = peer_tag(peer) else {
                debug!("Dropping datagram from IPv6 peer {}", peer);
                continue;
            };

            let stream = match current.as_ref().filter(|s| !s.is_closed()) {
                Some(stream) => stream.clone(),
                None => match tunnel.create_stream().await {
                    Ok(stream) => {
                        tokio::spawn(relay_udp_replies(stream.clone(), socket.clone()));
                        current = Some(stream.clone());
                        stream
                    }
                    Err(e) => {
                        debug!("Could not open UDP stream: {}", e);
                        if tunnel.is_closed() {
                            break;
                        }
                        continue;
                    }
                },
            };

            let mut record = BytesMut::new();
            if let Err(e) =
                DatagramCodec::new().encode((tag, Bytes::copy_from_slice(&buf[..n])), &mut record)
            {
                debug!("Dropping datagram from {}: {}", peer, e);
                continue;
            }
            if let Err(e) = stream.send(record.freeze()) {
                debug!("UDP stream unusable: {}", e);
                current = None;
            }
        }
    })
}

async fn relay_udp_replies(stream: VirtualStream, socket: Arc<UdpSocket>) {
    let mut records = FramedRead::new(stream, DatagramCodec::new());
    while let Some(record) = records.next().await {
        match record {
            Ok((peer, datagram)) => {
                if let Err(e) = socket.send_to(&datagram, SocketAddr::V4(peer)).await {
                    debug!("Failed to send datagram to {}: {}", peer, e);
                }
            }
            Err(e) => {
                debug!("UDP stream ended: {}", e);
                break;
            }
        }
    }
}

/// Splice a stream opened by an stcp visitor onto its provider
pub async fn route_visitor_stream(state: Arc<ServerState>, visitor: Tunnel, stream: VirtualStream) {
    let Some(key) = state.connections.visitor_key(visitor.id()).await else {
        debug!("Tunnel {} opened a stream without an stcp visitor", visitor.id());
        stream.reset("unexpected stream");
        return;
    };

    let provider_key = RouteKey::SecretKey(format!("{}{}", STCP_LEFT_PREFIX, key));
    let provider = match state.registry.lookup(&provider_key) {
        Ok(target) => state.connections.get(&target.connection_id).await,
        Err(_) => None,
    };
    let Some(provider) = provider else {
        stream.reset("stcp provider not found");
        return;
    };

    let peer = match provider.create_stream().await {
        Ok(peer) => peer,
        Err(e) => {
            stream.reset(e.to_string());
            return;
        }
    };
    if visitor.set_ready(&stream).is_err() {
        peer.reset("visitor stream closed");
        return;
    }

    if let Err(e) = bridge(stream, peer).await {
        debug!("stcp bridge ended: {}", e);
    }
}
