//! HTTP host-based routing

use crate::{RouteKey, RouteRegistry, RouteTarget};
use thiserror::Error;
use tracing::trace;

/// HTTP routing errors
#[derive(Debug, Error)]
pub enum HttpRouterError {
    #[error("Route error: {0}")]
    RouteError(#[from] crate::registry::RouteError),

    #[error("Host {0} is not under the tunnel domain")]
    ForeignHost(String),
}

/// Resolves `Host` values of the form `<subdomain>.<domain>` to tunnels
#[derive(Clone)]
pub struct HttpRouter {
    registry: RouteRegistry,
    domain: String,
}

impl HttpRouter {
    pub fn new(registry: RouteRegistry, domain: impl Into<String>) -> Self {
        Self {
            registry,
            domain: Self::normalize_host(&domain.into()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Lookup route by host header
    pub fn lookup(&self, host: &str) -> Result<RouteTarget, HttpRouterError> {
        trace!("Looking up HTTP route for host: {}", host);
        let subdomain = self
            .subdomain_of(host)
            .ok_or_else(|| HttpRouterError::ForeignHost(host.to_string()))?;
        Ok(self.registry.lookup(&RouteKey::Subdomain(subdomain))?)
    }

    /// Subdomain label of `host`, if it sits directly under the domain
    pub fn subdomain_of(&self, host: &str) -> Option<String> {
        let host = Self::normalize_host(host);
        let label = host.strip_suffix(&self.domain)?.strip_suffix('.')?;
        if is_valid_subdomain(label) {
            Some(label.to_string())
        } else {
            None
        }
    }

    /// Lowercase, drop the port and any trailing dot
    pub fn normalize_host(host: &str) -> String {
        let host = host.trim();
        let without_port = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        };
        without_port.trim_end_matches('.').to_ascii_lowercase()
    }
}

/// A single DNS label: 1-63 chars of `[a-z0-9-]`, not starting or ending
/// with `-`
pub fn is_valid_subdomain(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> (RouteRegistry, HttpRouter) {
        let registry = RouteRegistry::new();
        let router = HttpRouter::new(registry.clone(), "gank007.com");
        (registry, router)
    }

    #[test]
    fn test_http_router() {
        let (registry, router) = router();
        registry
            .register(
                RouteKey::Subdomain("blog".into()),
                RouteTarget::new("conn-1", "site"),
            )
            .unwrap();

        let target = router.lookup("blog.gank007.com").unwrap();
        assert_eq!(target.connection_id, "conn-1");
    }

    #[test]
    fn test_http_router_with_port_and_case() {
        let (registry, router) = router();
        registry
            .register(
                RouteKey::Subdomain("blog".into()),
                RouteTarget::new("conn-1", "site"),
            )
            .unwrap();

        // Should match even with port in host header
        assert!(router.lookup("Blog.GANK007.com:8080").is_ok());
        assert!(router.lookup("blog.gank007.com.").is_ok());
    }

    #[test]
    fn test_http_router_not_found() {
        let (_registry, router) = router();
        assert!(matches!(
            router.lookup("missing.gank007.com"),
            Err(HttpRouterError::RouteError(_))
        ));
        assert!(matches!(
            router.lookup("example.org"),
            Err(HttpRouterError::ForeignHost(_))
        ));
        // Nested labels are not routed
        assert!(router.lookup("a.b.gank007.com").is_err());
        assert!(router.lookup("gank007.com").is_err());
    }

    #[test]
    fn test_subdomain_validation() {
        assert!(is_valid_subdomain("my-app1"));
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("-lead"));
        assert!(!is_valid_subdomain("trail-"));
        assert!(!is_valid_subdomain("has.dot"));
        assert!(!is_valid_subdomain("UPPER"));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
    }
}
