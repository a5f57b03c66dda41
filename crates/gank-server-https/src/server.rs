//! HTTP(S) front-end routing requests to web tunnels by Host

use crate::HttpsServerError;
use bytes::BytesMut;
use gank_connection::bridge;
use gank_control::{accept_retrying, ServerState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

/// Largest request head accepted before routing
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Public web listener, plain or TLS
pub struct HttpServer {
    state: Arc<ServerState>,
    acceptor: Option<TlsAcceptor>,
}

impl HttpServer {
    pub fn plain(state: Arc<ServerState>) -> Self {
        Self {
            state,
            acceptor: None,
        }
    }

    pub fn tls(state: Arc<ServerState>, acceptor: TlsAcceptor) -> Self {
        Self {
            state,
            acceptor: Some(acceptor),
        }
    }

    pub async fn bind(address: SocketAddr) -> Result<TcpListener, HttpsServerError> {
        TcpListener::bind(address)
            .await
            .map_err(|source| HttpsServerError::BindError {
                address: address.to_string(),
                source,
            })
    }

    /// Accept connections forever
    pub async fn run(&self, listener: TcpListener) -> Result<(), HttpsServerError> {
        let scheme = if self.acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!("{} server listening on {}", scheme, listener.local_addr()?);

        loop {
            let (socket, peer) = accept_retrying(scheme, || listener.accept()).await;
            let _ = socket.set_nodelay(true);
            let state = self.state.clone();

            match self.acceptor.clone() {
                None => {
                    tokio::spawn(async move {
                        if let Err(e) = serve_http(state, socket, peer).await {
                            debug!("HTTP connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Some(acceptor) => {
                    tokio::spawn(async move {
                        let tls = match acceptor.accept(socket).await {
                            Ok(tls) => tls,
                            Err(e) => {
                                debug!("TLS handshake with {} failed: {}", peer, e);
                                return;
                            }
                        };
                        if let Err(e) = serve_http(state, tls, peer).await {
                            debug!("HTTPS connection from {} failed: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

/// Route one client connection to the web tunnel named by its Host header
///
/// The request head is forwarded unmodified, then bytes are piped both ways
/// until either side closes.
pub async fn serve_http<S>(
    state: Arc<ServerState>,
    mut io: S,
    peer: SocketAddr,
) -> Result<(), HttpsServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(buffered) = read_head(&mut io).await? else {
        return respond(&mut io, 431, "Request Header Fields Too Large").await;
    };
    if buffered.is_empty() {
        return Ok(());
    }

    let host = match parse_host(&buffered) {
        Ok(host) => host,
        Err(reason) => {
            debug!("Bad request from {}: {}", peer, reason);
            return respond(&mut io, 400, "Bad Request").await;
        }
    };

    let target = match state.http_router().lookup(&host) {
        Ok(target) => target,
        Err(e) => {
            debug!("No tunnel for {}: {}", host, e);
            return respond(&mut io, 404, "Not Found").await;
        }
    };
    let Some(tunnel) = state.connections.get(&target.connection_id).await else {
        return respond(&mut io, 502, "Bad Gateway").await;
    };

    let mut stream = match tunnel.create_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Could not open stream for {}: {}", host, e);
            return respond(&mut io, 502, "Bad Gateway").await;
        }
    };
    trace!("Routing {} from {} to tunnel {}", host, peer, tunnel.id());

    stream.write_all(&buffered).await?;
    bridge(stream, io).await?;
    Ok(())
}

/// Read until the end of the request head.
///
/// Returns the bytes read so far (possibly including body bytes), an empty
/// buffer if the client left early, or `None` if the head is too large.
async fn read_head<S>(io: &mut S) -> Result<Option<BytesMut>, HttpsServerError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if find_head_end(&buf).is_some() {
            return Ok(Some(buf));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Ok(None);
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Ok(Some(BytesMut::new()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Host header of a request head, without validation of the request line
pub fn parse_host(buf: &[u8]) -> Result<String, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err("incomplete request head".to_string()),
        Err(e) => return Err(e.to_string()),
    }

    request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "missing Host header".to_string())
}

async fn respond<S>(io: &mut S, code: u16, reason: &str) -> Result<(), HttpsServerError>
where
    S: AsyncWrite + Unpin,
{
    let body = format!("{} {}\n", code, reason);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    );
    io.write_all(response.as_bytes()).await?;
    io.shutdown().await?;
    Ok(())
}
