//! Live per-tunnel status

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Where a configured tunnel currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Connecting,
    Authenticating,
    Ready(String),
    Error(String),
    Disconnected,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Connecting => write!(f, "connecting"),
            TunnelStatus::Authenticating => write!(f, "authenticating"),
            TunnelStatus::Ready(url) => write!(f, "ready {}", url),
            TunnelStatus::Error(e) => write!(f, "error {}", e),
            TunnelStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Called with the tunnel name whenever its status changes
pub type StatusCallback = Arc<dyn Fn(&str, &TunnelStatus) + Send + Sync>;

/// Default callback
pub fn log_status(name: &str, status: &TunnelStatus) {
    match status {
        TunnelStatus::Ready(url) => info!("[{}] Tunnel ready at {}", name, url),
        TunnelStatus::Error(e) => warn!("[{}] Tunnel error: {}", name, e),
        other => info!("[{}] {}", name, other),
    }
}

/// Holds the status of one tunnel and notifies on change
pub struct StatusReporter {
    name: String,
    tx: watch::Sender<TunnelStatus>,
    callback: StatusCallback,
}

impl StatusReporter {
    pub fn new(name: impl Into<String>, callback: StatusCallback) -> Self {
        let (tx, _) = watch::channel(TunnelStatus::Disconnected);
        Self {
            name: name.into(),
            tx,
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> TunnelStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.tx.subscribe()
    }

    /// Store `status`; the callback only runs if it differs from the current one
    pub fn set(&self, status: TunnelStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status.clone();
            true
        });
        if changed {
            (self.callback)(&self.name, &status);
        }
        changed
    }
}
