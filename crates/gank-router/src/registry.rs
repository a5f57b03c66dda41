//! Route registry shared by every control connection
//!
//! Registration is first-writer-wins: a key stays with the connection that
//! claimed it until that connection releases it or goes away.

use crate::RouteKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Route target information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Control connection that owns the route
    pub connection_id: String,
    /// Tunnel name given by the client
    pub tunnel_name: String,
}

impl RouteTarget {
    pub fn new(connection_id: impl Into<String>, tunnel_name: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            tunnel_name: tunnel_name.into(),
        }
    }
}

/// Route registry errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Route not found: {0}")]
    RouteNotFound(RouteKey),

    #[error("Route already exists: {0}")]
    RouteAlreadyExists(RouteKey),
}

/// Route registry for managing tunnel routes
#[derive(Clone, Default)]
pub struct RouteRegistry {
    routes: Arc<DashMap<RouteKey, RouteTarget>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `target`. Fails if any connection already holds it.
    pub fn register(&self, key: RouteKey, target: RouteTarget) -> Result<(), RouteError> {
        match self.routes.entry(key) {
            Entry::Occupied(entry) => Err(RouteError::RouteAlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                trace!("Registering route {} -> {}", entry.key(), target.connection_id);
                entry.insert(target);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, key: &RouteKey) -> Result<RouteTarget, RouteError> {
        self.routes
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RouteError::RouteNotFound(key.clone()))
    }

    pub fn unregister(&self, key: &RouteKey) -> Result<RouteTarget, RouteError> {
        self.routes
            .remove(key)
            .map(|(_, target)| target)
            .ok_or_else(|| RouteError::RouteNotFound(key.clone()))
    }

    /// Release every route held by a connection, returning the freed keys
    pub fn unregister_connection(&self, connection_id: &str) -> Vec<RouteKey> {
        let keys = self.routes_for(connection_id);
        for key in &keys {
            // Only drop the entry if it still belongs to this connection
            self.routes
                .remove_if(key, |_, target| target.connection_id == connection_id);
        }
        keys
    }

    /// Keys currently held by a connection
    pub fn routes_for(&self, connection_id: &str) -> Vec<RouteKey> {
        self.routes
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn exists(&self, key: &RouteKey) -> bool {
        self.routes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
