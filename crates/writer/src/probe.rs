//! Store health probe
//!
//! Runs beside the writer and only probes while the circuit is OPEN. Results
//! go back to the writer, which alone decides state transitions.

use std::sync::Arc;
use std::time::Duration;

use common::CircuitState;
use storage::{GreekStore, StoreError, StoreResult};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct HealthProbe {
    store: Arc<dyn GreekStore>,
    interval: Duration,
    timeout: Duration,
    circuit: watch::Receiver<CircuitState>,
    results: mpsc::Sender<StoreResult<()>>,
    cancel: CancellationToken,
}

impl HealthProbe {
    pub fn new(
        store: Arc<dyn GreekStore>,
        interval: Duration,
        timeout: Duration,
        circuit: watch::Receiver<CircuitState>,
        results: mpsc::Sender<StoreResult<()>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            interval,
            timeout,
            circuit,
            results,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            if *self.circuit.borrow_and_update() != CircuitState::Open {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = self.circuit.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if *self.circuit.borrow() != CircuitState::Open {
                continue;
            }

            let result = match tokio::time::timeout(self.timeout, self.store.health_check()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.timeout)),
            };
            debug!(healthy = result.is_ok(), "Store health probe");
            if self.results.send(result).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryGreekStore;

    #[tokio::test(start_paused = true)]
    async fn test_probes_only_while_open() {
        let store = Arc::new(MemoryGreekStore::new());
        let (circuit_tx, circuit_rx) = watch::channel(CircuitState::Closed);
        let (results_tx, mut results_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let probe = HealthProbe::new(
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
            circuit_rx,
            results_tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(probe.run());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(store.health_checks(), 0);

        store.set_available(false);
        circuit_tx.send_replace(CircuitState::Open);
        let first = results_rx.recv().await.unwrap();
        assert!(first.is_err());

        store.set_available(true);
        let second = results_rx.recv().await.unwrap();
        assert!(second.is_ok());
        assert_eq!(store.health_checks(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
