//! Task tracking for connection-owned background tasks
//!
//! Public listeners and proxy loops belong to the control connection that
//! requested them and are aborted when it goes away.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks background tasks associated with control connections
pub struct TaskTracker {
    /// Map of connection_id -> task handles
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task for a connection
    pub fn register(&self, connection_id: &str, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks
                .entry(connection_id.to_string())
                .or_default()
                .push(handle);
        }
    }

    /// Abort every task of a connection
    pub fn unregister(&self, connection_id: &str) -> usize {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => tasks.remove(connection_id).unwrap_or_default(),
            Err(_) => return 0,
        };
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Number of tracked tasks still running for a connection
    pub fn count(&self, connection_id: &str) -> usize {
        self.tasks
            .lock()
            .ok()
            .and_then(|tasks| {
                tasks
                    .get(connection_id)
                    .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            })
            .unwrap_or(0)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let tracker = TaskTracker::new();

        let handle = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await });
        tracker.register("conn-1", handle);
        assert_eq!(tracker.count("conn-1"), 1);

        assert_eq!(tracker.unregister("conn-1"), 1);
        assert_eq!(tracker.count("conn-1"), 0);
    }

    #[tokio::test]
    async fn test_unregister_aborts_all_tasks() {
        let tracker = TaskTracker::new();
        let mut dropped = Vec::new();
        for _ in 0..2 {
            // The sender is dropped when the task is aborted
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            tracker.register(
                "conn-1",
                tokio::spawn(async move {
                    let _tx = tx;
                    tokio::time::sleep(Duration::from_secs(10)).await
                }),
            );
            dropped.push(rx);
        }

        assert_eq!(tracker.unregister("conn-1"), 2);
        for rx in dropped {
            assert!(rx.await.is_err());
        }
    }

    #[tokio::test]
    async fn test_unregister_unknown() {
        let tracker = TaskTracker::new();
        assert_eq!(tracker.unregister("missing"), 0);
    }
}
