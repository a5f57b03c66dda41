//! Client configuration

use crate::ClientError;
use gank_proto::{TunnelRequest, TunnelType, STCP_LEFT_PREFIX, STCP_RIGHT_PREFIX};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Client configuration file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Control address of the server, `host:port`
    pub server_addr: String,
    #[serde(default)]
    pub token: String,
    pub tunnels: Vec<TunnelDescriptor>,
}

/// One tunnel the client keeps open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    #[serde(default)]
    pub local_port: u16,
    /// Public port for tcp/udp tunnels, 0 lets the server choose
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Local listener of an stcp visitor
    #[serde(default)]
    pub bind_ip: Option<IpAddr>,
    #[serde(default)]
    pub bind_port: Option<u16>,
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

impl ClientConfig {
    /// Single web tunnel, as built from command line flags
    pub fn web(
        server_addr: impl Into<String>,
        local_port: u16,
        subdomain: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        let subdomain = subdomain.into();
        Self {
            server_addr: server_addr.into(),
            token: token.unwrap_or_default(),
            tunnels: vec![TunnelDescriptor {
                name: subdomain.clone(),
                tunnel_type: TunnelType::Web,
                local_ip: default_local_ip(),
                local_port,
                remote_port: 0,
                subdomain: Some(subdomain),
                secret_key: None,
                bind_ip: None,
                bind_port: None,
            }],
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server_addr.trim().is_empty() {
            return Err(ClientError::Config("server_addr is empty".to_string()));
        }
        if self.tunnels.is_empty() {
            return Err(ClientError::Config("no tunnels configured".to_string()));
        }
        for (i, tunnel) in self.tunnels.iter().enumerate() {
            if self.tunnels[..i].iter().any(|t| t.name == tunnel.name) {
                return Err(ClientError::Config(format!(
                    "duplicate tunnel name: {}",
                    tunnel.name
                )));
            }
            tunnel.validate()?;
        }
        Ok(())
    }
}

impl TunnelDescriptor {
    /// An stcp descriptor with a bind address connects to a provider instead
    /// of exposing a local service.
    pub fn is_visitor(&self) -> bool {
        self.tunnel_type == TunnelType::Stcp && self.bind_port.is_some()
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    /// Address the stcp visitor listens on
    pub fn bind_addr(&self) -> Option<SocketAddr> {
        let port = self.bind_port?;
        let ip = self.bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Some(SocketAddr::new(ip, port))
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let invalid = |reason: &str| {
            Err(ClientError::Config(format!(
                "tunnel {}: {}",
                self.name, reason
            )))
        };

        if self.name.is_empty() || self.name.contains(':') {
            return invalid("name must be non-empty and must not contain ':'");
        }
        if !self.is_visitor() && self.local_port == 0 {
            return invalid("local_port is required");
        }
        match self.tunnel_type {
            TunnelType::Web if self.subdomain.as_deref().unwrap_or("").is_empty() => {
                invalid("subdomain is required")
            }
            TunnelType::Stcp if self.secret_key.as_deref().unwrap_or("").is_empty() => {
                invalid("secret_key is required")
            }
            TunnelType::Stcp if self.bind_ip.is_some() && self.bind_port.is_none() => {
                invalid("bind_ip needs bind_port")
            }
            _ => Ok(()),
        }
    }

    /// Request sent to the server for this descriptor
    pub fn request(&self) -> TunnelRequest {
        match self.tunnel_type {
            TunnelType::Tcp => TunnelRequest::tcp(&self.name, self.remote_port),
            TunnelType::Udp => TunnelRequest::udp(&self.name, self.remote_port),
            TunnelType::Web => {
                TunnelRequest::web(&self.name, self.subdomain.clone().unwrap_or_default())
            }
            TunnelType::Stcp => {
                let key = self.secret_key.as_deref().unwrap_or("");
                let key = key
                    .strip_prefix(STCP_RIGHT_PREFIX)
                    .or_else(|| key.strip_prefix(STCP_LEFT_PREFIX))
                    .unwrap_or(key);
                let prefix = if self.is_visitor() {
                    STCP_RIGHT_PREFIX
                } else {
                    STCP_LEFT_PREFIX
                };
                TunnelRequest::stcp(&self.name, format!("{}{}", prefix, key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(json: &str) -> TunnelDescriptor {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "server_addr": "gank007.com:4443",
                "tunnels": [
                    {"name": "ssh", "type": "tcp", "local_port": 22, "remote_port": 2222},
                    {"name": "site", "type": "web", "local_port": 8080, "subdomain": "blog"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.token, "");
        assert_eq!(config.tunnels[0].local_addr(), "127.0.0.1:22");
        assert_eq!(config.tunnels[0].request().value, "2222");
        assert_eq!(config.tunnels[1].request().value, "blog");
        config.validate().unwrap();
    }

    #[test]
    fn test_stcp_sides() {
        let provider = descriptor(
            r#"{"name": "db", "type": "stcp", "local_port": 5432, "secret_key": "k1"}"#,
        );
        assert!(!provider.is_visitor());
        assert_eq!(provider.request().value, "stcp_left_k1");

        let visitor = descriptor(
            r#"{"name": "db-visitor", "type": "stcp", "secret_key": "stcp_left_k1", "bind_port": 15432}"#,
        );
        assert!(visitor.is_visitor());
        visitor.validate().unwrap();
        assert_eq!(visitor.request().value, "stcp_right_k1");
        assert_eq!(
            visitor.bind_addr(),
            Some("127.0.0.1:15432".parse().unwrap())
        );
    }

    #[test]
    fn test_validate_rejects_incomplete_descriptors() {
        let web = descriptor(r#"{"name": "site", "type": "web", "local_port": 80}"#);
        assert!(web.validate().is_err());

        let tcp = descriptor(r#"{"name": "ssh", "type": "tcp"}"#);
        assert!(tcp.validate().is_err());

        let named = descriptor(r#"{"name": "a:b", "type": "tcp", "local_port": 22}"#);
        assert!(named.validate().is_err());
    }

    #[test]
    fn test_duplicate_names() {
        let mut config = ClientConfig::web("localhost:4443", 3000, "blog", None);
        config.tunnels.push(config.tunnels[0].clone());
        assert!(config.validate().is_err());
    }
}
