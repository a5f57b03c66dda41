//! Authentication and tunnel negotiation for client connections

use crate::proxy::{spawn_tcp_proxy, spawn_udp_proxy};
use crate::ServerState;
use async_trait::async_trait;
use gank_connection::{AuthHandler, Tunnel, TunnelRequestHandler};
use gank_proto::{TunnelRequest, TunnelType, STCP_LEFT_PREFIX, STCP_RIGHT_PREFIX};
use gank_router::http::is_valid_subdomain;
use gank_router::{RouteKey, RouteTarget};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info};

/// Reasons a TUNNEL_REQ is refused. The message is sent to the client.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("subdomain existed: {0}")]
    SubdomainExists(String),

    #[error("secret key existed: {0}")]
    SecretKeyExists(String),

    #[error("invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("missing port")]
    MissingPort,

    #[error("port {0} is already tunneled")]
    PortTaken(u16),

    #[error("cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed during negotiation")]
    ConnectionClosed,
}

/// Handles the control handshakes of one server
pub struct TunnelHandler {
    state: Arc<ServerState>,
}

impl TunnelHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Claim the public face of `request` for `tunnel` and return its URL
    pub async fn negotiate(
        &self,
        tunnel: &Tunnel,
        request: TunnelRequest,
    ) -> Result<String, NegotiationError> {
        let config = &self.state.config;
        let target = RouteTarget::new(tunnel.id(), request.name.clone());

        let url = match request.tunnel_type {
            TunnelType::Tcp => {
                let port = request.port().ok_or(NegotiationError::MissingPort)?;
                let listener = TcpListener::bind((config.bind_ip, port))
                    .await
                    .map_err(|source| NegotiationError::Bind { port, source })?;
                let port = listener
                    .local_addr()
                    .map_err(|source| NegotiationError::Bind { port, source })?
                    .port();
                self.state
                    .registry
                    .register(RouteKey::TcpPort(port), target)
                    .map_err(|_| NegotiationError::PortTaken(port))?;
                self.state
                    .tasks
                    .register(tunnel.id(), spawn_tcp_proxy(tunnel.clone(), listener));
                format!("tcp://{}:{}", config.domain, port)
            }
            TunnelType::Udp => {
                let port = request.port().ok_or(NegotiationError::MissingPort)?;
                let socket = UdpSocket::bind((config.bind_ip, port))
                    .await
                    .map_err(|source| NegotiationError::Bind { port, source })?;
                let port = socket
                    .local_addr()
                    .map_err(|source| NegotiationError::Bind { port, source })?
                    .port();
                self.state
                    .registry
                    .register(RouteKey::UdpPort(port), target)
                    .map_err(|_| NegotiationError::PortTaken(port))?;
                self.state
                    .tasks
                    .register(tunnel.id(), spawn_udp_proxy(tunnel.clone(), socket));
                format!("udp://{}:{}", config.domain, port)
            }
            TunnelType::Web => {
                let subdomain = request.value.trim().to_ascii_lowercase();
                if !is_valid_subdomain(&subdomain) {
                    return Err(NegotiationError::InvalidSubdomain(request.value));
                }
                self.state
                    .registry
                    .register(RouteKey::Subdomain(subdomain.clone()), target)
                    .map_err(|_| NegotiationError::SubdomainExists(subdomain.clone()))?;
                config.web_url(&subdomain)
            }
            TunnelType::Stcp => {
                let key = request.value.clone();
                let visitor_key = key.strip_prefix(STCP_RIGHT_PREFIX);
                let bare = visitor_key.or_else(|| key.strip_prefix(STCP_LEFT_PREFIX));
                if bare.map_or(true, str::is_empty) {
                    return Err(NegotiationError::InvalidSecretKey(key));
                }
                self.state
                    .registry
                    .register(RouteKey::SecretKey(key.clone()), target)
                    .map_err(|_| NegotiationError::SecretKeyExists(key.clone()))?;
                if let Some(visitor_key) = visitor_key {
                    self.state
                        .connections
                        .set_visitor_key(tunnel.id(), visitor_key)
                        .await;
                }
                format!("stcp://{}", request.name)
            }
        };

        // The connection may have dropped while we were binding
        if tunnel.is_closed() {
            self.state.release(tunnel.id()).await;
            return Err(NegotiationError::ConnectionClosed);
        }

        self.state
            .connections
            .add_tunnel_name(tunnel.id(), &request.name)
            .await;
        info!(
            "Tunnel '{}' ({}) ready at {}",
            request.name, request.tunnel_type, url
        );
        Ok(url)
    }
}

#[async_trait]
impl AuthHandler for TunnelHandler {
    async fn authenticate(&self, tunnel: &Tunnel, token: &str) -> Result<String, String> {
        match &self.state.config.token {
            Some(expected) if expected != token => {
                debug!("Connection {} presented a bad token", tunnel.id());
                Err("invalid token".to_string())
            }
            _ => Ok("ok".to_string()),
        }
    }
}

#[async_trait]
impl TunnelRequestHandler for TunnelHandler {
    async fn handle_tunnel_request(
        &self,
        tunnel: &Tunnel,
        request: TunnelRequest,
    ) -> Result<String, String> {
        let name = request.name.clone();
        self.negotiate(tunnel, request).await.map_err(|e| {
            debug!("Tunnel '{}' refused: {}", name, e);
            e.to_string()
        })
    }
}
