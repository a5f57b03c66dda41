//! Control connection management

use chrono::{DateTime, Utc};
use gank_connection::Tunnel;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Represents an active control connection
struct TunnelConnection {
    tunnel: Tunnel,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    /// Names of the tunnels negotiated on this connection
    tunnel_names: Vec<String>,
    /// Secret key of an stcp visitor tunnel, without its prefix
    visitor_key: Option<String>,
}

/// Snapshot of a control connection for status reporting
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub rtt: Option<Duration>,
    pub tunnel_names: Vec<String>,
}

/// Manages all active control connections
#[derive(Clone, Default)]
pub struct TunnelConnectionManager {
    connections: Arc<RwLock<HashMap<String, TunnelConnection>>>,
}

impl TunnelConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new control connection
    pub async fn register(&self, tunnel: Tunnel, remote_addr: SocketAddr) {
        let connection = TunnelConnection {
            tunnel: tunnel.clone(),
            remote_addr,
            connected_at: Utc::now(),
            tunnel_names: Vec::new(),
            visitor_key: None,
        };

        self.connections
            .write()
            .await
            .insert(tunnel.id().to_string(), connection);
    }

    /// Unregister a control connection
    pub async fn unregister(&self, connection_id: &str) -> bool {
        self.connections
            .write()
            .await
            .remove(connection_id)
            .is_some()
    }

    /// Get the tunnel session of a connection
    pub async fn get(&self, connection_id: &str) -> Option<Tunnel> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|conn| conn.tunnel.clone())
    }

    /// Record a negotiated tunnel name
    pub async fn add_tunnel_name(&self, connection_id: &str, name: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.tunnel_names.push(name.to_string());
        }
    }

    pub async fn set_visitor_key(&self, connection_id: &str, key: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.visitor_key = Some(key.to_string());
        }
    }

    pub async fn visitor_key(&self, connection_id: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .and_then(|conn| conn.visitor_key.clone())
    }

    /// List all active connection IDs
    pub async fn list_connections(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|conn| ConnectionInfo {
                connection_id: connection_id.to_string(),
                remote_addr: conn.remote_addr,
                connected_at: conn.connected_at,
                rtt: conn.tunnel.rtt(),
                tunnel_names: conn.tunnel_names.clone(),
            })
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gank_connection::TunnelConfig;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let manager = TunnelConnectionManager::new();
        let (io, _peer) = tokio::io::duplex(1024);
        let (tunnel, _incoming) = Tunnel::spawn(io, TunnelConfig::default());
        let remote: SocketAddr = "203.0.113.9:50000".parse().unwrap();

        manager.register(tunnel.clone(), remote).await;
        manager.add_tunnel_name(tunnel.id(), "ssh").await;
        assert_eq!(manager.list_connections().await, vec![tunnel.id().to_string()]);

        let info = manager.info(tunnel.id()).await.unwrap();
        assert_eq!(info.remote_addr, remote);
        assert_eq!(info.tunnel_names, vec!["ssh".to_string()]);
        assert!(info.rtt.is_none());

        assert!(manager.get(tunnel.id()).await.is_some());
        assert!(manager.unregister(tunnel.id()).await);
        assert!(!manager.unregister(tunnel.id()).await);
        assert!(manager.get(tunnel.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_visitor_key() {
        let manager = TunnelConnectionManager::new();
        let (io, _peer) = tokio::io::duplex(1024);
        let (tunnel, _incoming) = Tunnel::spawn(io, TunnelConfig::default());
        manager
            .register(tunnel.clone(), "127.0.0.1:1".parse().unwrap())
            .await;

        assert!(manager.visitor_key(tunnel.id()).await.is_none());
        manager.set_visitor_key(tunnel.id(), "k").await;
        assert_eq!(manager.visitor_key(tunnel.id()).await.as_deref(), Some("k"));
    }
}
