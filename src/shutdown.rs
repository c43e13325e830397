//! Graceful shutdown coordination.
//!
//! Shutdown order per the node's durability contract: stop accepting
//! mempool entries, let any in-flight block application finish, flush
//! the mempool mirror, fsync the block store, then exit.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Token handed to every spawned task.
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Wait for ctrl+c, then cancel and drain all registered tasks.
    pub async fn wait_for_shutdown(mut self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e}");
            return;
        }

        tracing::info!("🛑 Shutdown signal received");
        self.cancel_token.cancel();

        let timeout = tokio::time::Duration::from_secs(10);
        let drain = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });

        match tokio::time::timeout(timeout, drain).await {
            Ok(_) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
