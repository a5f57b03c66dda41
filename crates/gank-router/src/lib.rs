//! Routing tables for public traffic
//!
//! Maps subdomains, stcp secret keys and public ports to the control
//! connection that owns them.

pub mod http;
pub mod registry;

pub use http::{HttpRouter, HttpRouterError};
pub use registry::{RouteError, RouteRegistry, RouteTarget};

use std::fmt;

/// Route key for identifying a tunnel's public face
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// Web routing by subdomain of the server domain
    Subdomain(String),
    /// stcp rendezvous by prefixed secret key
    SecretKey(String),
    /// TCP listener ownership by port
    TcpPort(u16),
    /// UDP socket ownership by port
    UdpPort(u16),
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Subdomain(s) => write!(f, "subdomain {}", s),
            RouteKey::SecretKey(k) => write!(f, "secret key {}", k),
            RouteKey::TcpPort(p) => write!(f, "tcp port {}", p),
            RouteKey::UdpPort(p) => write!(f, "udp port {}", p),
        }
    }
}
