//! Shutdown coordination
//!
//! One [`ShutdownController`] per process. Stream sessions hold child tokens
//! of it; the normalizer and writer are not cancelled directly but stop as
//! their input channels close behind the sessions.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Controller that cancels itself on Ctrl+C
    pub fn with_ctrl_c() -> Self {
        let controller = Self::new();
        let token = controller.token.clone();

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                    token.cancel();
                }
                Err(e) => {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
            }
        });

        controller
    }

    /// Token cancelled with this controller, but cancellable on its own too
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let controller = ShutdownController::new();
        let sessions = controller.child_token();
        let status = controller.child_token();

        // A session stopping on its own leaves the rest running
        sessions.cancel();
        assert!(!status.is_cancelled());
        assert!(!controller.is_cancelled());

        controller.shutdown();
        assert!(status.is_cancelled());
        assert!(controller.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let controller = ShutdownController::new();
        let trigger = controller.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.shutdown();
        });

        tokio::time::timeout(Duration::from_secs(5), controller.wait_for_shutdown())
            .await
            .expect("shutdown not observed");
    }
}
