//! Control listener and per-connection lifecycle

use crate::handler::TunnelHandler;
use crate::proxy::route_visitor_stream;
use crate::{ServerConfig, ServerState};
use gank_connection::{Handler, Tunnel, TunnelConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Control server errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to bind to {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts client control connections
pub struct TunnelServer {
    state: Arc<ServerState>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState::new(config)),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Bind the control listener
    pub async fn bind(&self) -> Result<TcpListener, ControlError> {
        let address = SocketAddr::new(self.state.config.bind_ip, self.state.config.tunnel_port);
        TcpListener::bind(address)
            .await
            .map_err(|source| ControlError::BindError {
                address: address.to_string(),
                source,
            })
    }

    /// Accept control connections forever
    pub async fn run(&self, listener: TcpListener) -> Result<(), ControlError> {
        info!("Tunnel server listening on {}", listener.local_addr()?);
        loop {
            let (socket, remote) = accept_retrying("control", || listener.accept()).await;
            let _ = socket.set_nodelay(true);
            tokio::spawn(serve_connection(self.state.clone(), socket, remote));
        }
    }
}

/// Pause after a failed accept, so errors like EMFILE do not spin the loop
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Call `accept` until it succeeds, sleeping [`ACCEPT_RETRY_DELAY`] after each failure
pub async fn accept_retrying<T, F, Fut>(what: &str, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!("Failed to accept {} connection: {}", what, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Run one control connection to completion and release what it owned
pub async fn serve_connection<T>(state: Arc<ServerState>, io: T, remote: SocketAddr)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = TunnelConfig::default().with_stream_open_timeout(state.config.stream_open_timeout());
    let handler = Arc::new(TunnelHandler::new(state.clone()));
    let (unstarted, mut incoming) = Tunnel::build(io, config);
    unstarted.tunnel().register_handler(Handler::Auth(handler.clone()));
    unstarted.tunnel().register_handler(Handler::TunnelRequest(handler));
    // Negotiation looks the connection up, so it must be known before any frame is read
    state
        .connections
        .register(unstarted.tunnel().clone(), remote)
        .await;
    let tunnel = unstarted.start();
    info!("Client {} connected as {}", remote, tunnel.id());

    let keepalive = tokio::spawn(keepalive(tunnel.clone(), state.config.keepalive_interval()));

    while let Some(stream) = incoming.next_stream().await {
        tokio::spawn(route_visitor_stream(state.clone(), tunnel.clone(), stream));
    }

    keepalive.abort();
    state.release(tunnel.id()).await;
    info!("Client {} disconnected ({})", remote, tunnel.id());
}

/// Ping on every tick and drop connections silent for three intervals
async fn keepalive(tunnel: Tunnel, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if tunnel.last_seen().elapsed() > interval * 3 {
            warn!("Tunnel {} missed keepalives, closing", tunnel.id());
            tunnel.close();
            return;
        }
        tunnel.ping();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_accept_failures_back_off() {
        let started = Instant::now();
        let mut attempts = 0;
        let accepted = accept_retrying("test", || {
            attempts += 1;
            let result = if attempts <= 3 {
                Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
            } else {
                Ok(attempts)
            };
            async move { result }
        })
        .await;

        assert_eq!(accepted, 4);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_success_does_not_wait() {
        let started = Instant::now();
        let accepted = accept_retrying("test", || async { Ok::<_, io::Error>("socket") }).await;
        assert_eq!(accepted, "socket");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
