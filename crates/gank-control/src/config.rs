//! Server configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// PEM files for the HTTPS front-end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public domain; web tunnels are served at `<subdomain>.<domain>`
    pub domain: String,
    /// Address for the control listener and every public listener
    pub bind_ip: IpAddr,
    /// Control connection port
    pub tunnel_port: u16,
    /// Plain HTTP front-end port, `None` to disable
    pub http_port: Option<u16>,
    /// HTTPS front-end port, used when `tls` is set
    pub https_port: u16,
    pub tls: Option<TlsPaths>,
    /// Shared client token, `None` accepts everyone
    pub token: Option<String>,
    pub keepalive_interval_secs: u64,
    pub stream_open_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "gank007.com".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tunnel_port: 4443,
            http_port: Some(80),
            https_port: 443,
            tls: None,
            token: None,
            keepalive_interval_secs: 15,
            stream_open_timeout_secs: 20,
        }
    }
}

impl ServerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_open_timeout_secs.max(1))
    }

    /// Public URL of a web tunnel
    pub fn web_url(&self, subdomain: &str) -> String {
        let host = format!("{}.{}", subdomain, self.domain);
        match (self.http_port, &self.tls) {
            (Some(80), _) => format!("http://{}", host),
            (Some(port), _) => format!("http://{}:{}", host, port),
            (None, Some(_)) if self.https_port == 443 => format!("https://{}", host),
            (None, Some(_)) => format!("https://{}:{}", host, self.https_port),
            (None, None) => format!("http://{}", host),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.domain.trim().is_empty() {
            return Err("domain must not be empty".to_string());
        }
        if self.http_port.is_none() && self.tls.is_none() {
            return Err("at least one of http_port or tls must be configured".to_string());
        }
        Ok(())
    }
}
