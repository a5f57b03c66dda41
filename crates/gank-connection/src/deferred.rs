//! Single-assignment results with a cancelable timeout

use crate::TunnelError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

type Outcome<T> = Result<T, TunnelError>;

/// Settling side of a pending handshake
///
/// The first `resolve` or `reject` wins; later calls return `false` and do
/// nothing. Settling disarms the timer.
pub struct Deferred<T> {
    tx: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    timer: Mutex<Option<AbortHandle>>,
}

/// Waiting side of a [`Deferred`]
pub struct Pending<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T: Send + 'static> Deferred<T> {
    pub fn new() -> (Arc<Self>, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        let deferred = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            timer: Mutex::new(None),
        });
        (deferred, Pending { rx })
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: TunnelError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }

    /// Reject with `error` after `after` unless settled first.
    ///
    /// `on_timeout` runs only when the timer is what settled the deferred.
    pub fn arm_timeout<F>(self: &Arc<Self>, after: Duration, error: TunnelError, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(deferred) = weak.upgrade() {
                if deferred.reject(error) {
                    on_timeout();
                }
            }
        });

        if let Ok(mut timer) = self.timer.lock() {
            if let Some(old) = timer.replace(handle.abort_handle()) {
                old.abort();
            }
        }
        if self.is_settled() {
            handle.abort();
        }
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let tx = match self.tx.lock() {
            Ok(mut tx) => tx.take(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            return false;
        };

        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }

        // The waiter may be gone; settling still counts
        let _ = tx.send(outcome);
        true
    }
}

impl<T> Future for Pending<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TunnelError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
