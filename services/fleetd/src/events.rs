//! The asynchronous event-handler seam.
//!
//! Provider callbacks (address assigned, check finished, teardown confirmed)
//! advance VM records independently of the fleet cycle. The controller only
//! owns the handler's lifecycle: it spawns the handler at startup and joins
//! it at shutdown. Handler and controller share nothing but the store, which
//! is why every controller mutation is state-guarded.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

/// Asynchronous record updater driven by provider callbacks.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Run until shutdown is signaled.
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>);
}

/// Event handler that only waits for shutdown, for tests and development.
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                break;
            }
        }
        info!("event handler shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_handler_exits_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(NoopEventHandler).run(rx));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn noop_handler_exits_when_sender_drops() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(NoopEventHandler).run(rx));

        drop(tx);
        handle.await.unwrap();
    }
}
