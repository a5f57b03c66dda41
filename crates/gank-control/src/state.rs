//! State shared by every control connection of a server

use crate::{ServerConfig, TaskTracker, TunnelConnectionManager};
use gank_router::{HttpRouter, RouteRegistry};
use tracing::debug;

pub struct ServerState {
    pub config: ServerConfig,
    pub registry: RouteRegistry,
    pub connections: TunnelConnectionManager,
    pub tasks: TaskTracker,
    http_router: HttpRouter,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = RouteRegistry::new();
        let http_router = HttpRouter::new(registry.clone(), config.domain.clone());
        Self {
            config,
            registry,
            connections: TunnelConnectionManager::new(),
            tasks: TaskTracker::new(),
            http_router,
        }
    }

    pub fn http_router(&self) -> &HttpRouter {
        &self.http_router
    }

    /// Drop every route, listener and table entry owned by a connection.
    /// Safe to call more than once.
    pub async fn release(&self, connection_id: &str) {
        let routes = self.registry.unregister_connection(connection_id);
        let tasks = self.tasks.unregister(connection_id);
        self.connections.unregister(connection_id).await;
        if !routes.is_empty() || tasks > 0 {
            debug!(
                "Released {} routes and {} tasks of connection {}",
                routes.len(),
                tasks,
                connection_id
            );
        }
    }
}
