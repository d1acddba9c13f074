//! The resilient batch writer task
//!
//! Single owner of the store handle and the spill buffer. Records arrive
//! over an mpsc channel from the normalizer and leave in batches, either to
//! the store or, while the store is unavailable, to the buffer.
//!
//! Ordering rule: once anything is buffered, every later batch is appended
//! behind it and the buffer is replayed oldest first. Live rows are never
//! written ahead of buffered ones.

use std::sync::Arc;
use std::time::Duration;

use common::{CircuitState, Clock, GreekSnapshot, SystemClock, WriterStatus};
use observability::WriterMetrics;
use storage::{BufferLog, GreekStore, StoreError, StoreResult};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{Result, WriterError};
use crate::latency::{LatencyTracker, SloChange};
use crate::probe::HealthProbe;

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub batch_size: usize,
    /// Maximum age of a batch's first member before it is flushed
    pub flush_interval: Duration,
    pub failure_threshold: u32,
    pub probe_interval: Duration,
    /// Upper bound on every store call
    pub write_timeout: Duration,
    pub latency_target: Duration,
    pub latency_window: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
            failure_threshold: 3,
            probe_interval: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            latency_target: Duration::from_millis(500),
            latency_window: 2048,
        }
    }
}

impl WriterSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(WriterError::InvalidSettings("batch_size must be positive".into()));
        }
        if self.failure_threshold == 0 {
            return Err(WriterError::InvalidSettings("failure_threshold must be positive".into()));
        }
        for (name, value) in [
            ("flush_interval", self.flush_interval),
            ("probe_interval", self.probe_interval),
            ("write_timeout", self.write_timeout),
        ] {
            if value.is_zero() {
                return Err(WriterError::InvalidSettings(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

pub struct BatchWriter {
    settings: WriterSettings,
    store: Arc<dyn GreekStore>,
    buffer: BufferLog,
    input: mpsc::Receiver<GreekSnapshot>,
    breaker: CircuitBreaker,
    latency: LatencyTracker,
    batch: Vec<GreekSnapshot>,
    batch_deadline: Option<Instant>,
    status: watch::Sender<WriterStatus>,
    circuit: watch::Sender<CircuitState>,
    metrics: WriterMetrics,
    clock: Arc<dyn Clock>,
    replaying: bool,
    replayed: usize,
}

impl BatchWriter {
    pub fn new(
        settings: WriterSettings,
        store: Arc<dyn GreekStore>,
        buffer: BufferLog,
        input: mpsc::Receiver<GreekSnapshot>,
    ) -> Result<Self> {
        settings.validate()?;

        let latency = LatencyTracker::new(settings.latency_window, settings.latency_target.as_secs_f64() * 1000.0);
        let (status, _) = watch::channel(WriterStatus {
            buffered_records: buffer.len(),
            latency_target_ms: latency.target_ms(),
            ..WriterStatus::default()
        });
        let (circuit, _) = watch::channel(CircuitState::Closed);

        Ok(Self {
            breaker: CircuitBreaker::new(settings.failure_threshold),
            batch: Vec::with_capacity(settings.batch_size),
            settings,
            store,
            buffer,
            input,
            latency,
            batch_deadline: None,
            status,
            circuit,
            metrics: WriterMetrics::new(),
            clock: Arc::new(SystemClock),
            replaying: false,
            replayed: 0,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn status(&self) -> watch::Receiver<WriterStatus> {
        self.status.subscribe()
    }

    /// Run until the input channel closes, then flush what is left
    ///
    /// Only a buffer failure ends the task early.
    pub async fn run(mut self) -> Result<()> {
        let probe_cancel = CancellationToken::new();
        let (probe_tx, mut probe_rx) = mpsc::channel(4);
        let probe = HealthProbe::new(
            Arc::clone(&self.store),
            self.settings.probe_interval,
            self.settings.write_timeout,
            self.circuit.subscribe(),
            probe_tx,
            probe_cancel.clone(),
        );
        tokio::spawn(probe.run());

        let result = self.run_inner(&mut probe_rx).await;
        probe_cancel.cancel();

        self.status.send_modify(|s| s.running = false);
        match &result {
            Ok(()) => info!(
                buffered = self.buffer.len(),
                circuit = %self.breaker.state(),
                "Batch writer stopped"
            ),
            Err(err) => error!(error = %err, "Batch writer failed"),
        }
        result
    }

    async fn run_inner(&mut self, probe_rx: &mut mpsc::Receiver<StoreResult<()>>) -> Result<()> {
        info!(
            batch_size = self.settings.batch_size,
            flush_interval_ms = self.settings.flush_interval.as_millis() as u64,
            buffered = self.buffer.len(),
            "Batch writer started"
        );
        self.status.send_modify(|s| s.running = true);
        self.publish();

        if !self.buffer.is_empty() {
            info!(pending = self.buffer.len(), "Replaying buffer left by a previous run");
            self.start_replay();
        }

        loop {
            let deadline = self.batch_deadline;
            let replay_ready = self.replaying && self.breaker.allows_writes();
            tokio::select! {
                biased;

                Some(result) = probe_rx.recv() => self.on_probe(result),

                _ = until_deadline(deadline), if deadline.is_some() => self.flush().await?,

                received = self.input.recv() => match received {
                    Some(snapshot) => {
                        if self.batch.is_empty() {
                            self.batch_deadline = Some(Instant::now() + self.settings.flush_interval);
                        }
                        self.batch.push(snapshot);
                        if self.batch.len() >= self.settings.batch_size {
                            self.flush().await?;
                        }
                    }
                    None => break,
                },

                // One chunk per turn so input keeps draining during a long replay
                _ = std::future::ready(()), if replay_ready => self.replay_chunk().await?,
            }
        }

        self.flush().await?;
        while self.replaying && self.breaker.allows_writes() {
            self.replay_chunk().await?;
        }
        Ok(())
    }

    fn on_probe(&mut self, result: StoreResult<()>) {
        match result {
            Ok(()) => {
                if self.breaker.probe_succeeded().is_some() {
                    info!(pending = self.buffer.len(), "Store probe succeeded; circuit half-open");
                    self.publish();
                    self.start_replay();
                }
            }
            Err(err) => debug!(error = %err, "Store still unavailable"),
        }
    }

    /// Flush the pending batch to the store or the buffer
    async fn flush(&mut self) -> Result<()> {
        self.batch_deadline = None;
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.settings.batch_size));
        self.metrics.flush();

        let batch = self.drop_invalid(batch);
        if batch.is_empty() {
            return Ok(());
        }

        if !self.breaker.allows_writes() || !self.buffer.is_empty() {
            self.spill(&batch).await?;
            if self.breaker.allows_writes() {
                self.start_replay();
            }
            return Ok(());
        }

        if let Err(err) = self.write(&batch).await {
            warn!(error = %err, rows = batch.len(), "Store write failed; buffering batch");
            self.on_store_failure();
            self.spill(&batch).await?;
        }
        Ok(())
    }

    fn start_replay(&mut self) {
        if self.replaying || self.buffer.is_empty() {
            return;
        }
        self.replaying = true;
        self.replayed = 0;
        self.status.send_modify(|s| s.replay_in_progress = true);
    }

    fn stop_replay(&mut self) {
        self.replaying = false;
        self.status.send_modify(|s| s.replay_in_progress = false);
        self.publish();
        if self.replayed > 0 {
            info!(replayed = self.replayed, pending = self.buffer.len(), "Buffer replay finished");
        }
    }

    /// Write the oldest buffered chunk; stops the replay once the buffer is
    /// empty or a write fails
    async fn replay_chunk(&mut self) -> Result<()> {
        let chunk = self.buffer.read_from(0, self.settings.batch_size).await?;
        let Some(last_seq) = chunk.last().map(|r| r.seq) else {
            self.stop_replay();
            return Ok(());
        };
        let rows: Vec<GreekSnapshot> = chunk.into_iter().map(|r| r.snapshot).collect();

        match self.write(&rows).await {
            Ok(()) => {
                self.buffer.commit_through(last_seq).await?;
                self.replayed += rows.len();
                self.metrics.rows_replayed(rows.len());
                self.publish();
                if self.buffer.is_empty() {
                    self.stop_replay();
                }
            }
            Err(err) => {
                warn!(error = %err, through_seq = last_seq, "Replay write failed");
                self.on_store_failure();
                self.stop_replay();
            }
        }
        Ok(())
    }

    /// Insert a batch, isolating malformed rows if the store rejects it
    ///
    /// Latency is measured to the moment the store acknowledges the write.
    /// On error nothing is counted as persisted; the caller buffers the whole
    /// batch again, which is safe because inserts are idempotent.
    async fn write(&mut self, batch: &[GreekSnapshot]) -> StoreResult<()> {
        match self.insert(batch).await {
            Ok(inserted) => {
                let committed_at = self.clock.now();
                debug!(rows = batch.len(), inserted, "Batch persisted");
                let latencies: Vec<Duration> = batch.iter().filter_map(|r| r.persist_latency(committed_at)).collect();
                self.on_store_success(batch.len(), latencies);
                Ok(())
            }
            Err(err) if err.is_malformed() => {
                warn!(error = %err, rows = batch.len(), "Store rejected batch; retrying row by row");
                self.write_rows(batch).await
            }
            Err(err) => Err(err),
        }
    }

    async fn write_rows(&mut self, batch: &[GreekSnapshot]) -> StoreResult<()> {
        let mut kept = 0usize;
        let mut latencies = Vec::with_capacity(batch.len());
        let mut dropped = 0usize;

        for row in batch {
            match self.insert(std::slice::from_ref(row)).await {
                Ok(_) => {
                    kept += 1;
                    latencies.extend(row.persist_latency(self.clock.now()));
                }
                Err(err) if err.is_malformed() => {
                    warn!(
                        snapshot_id = %row.snapshot_id,
                        source = %row.source,
                        contract_key = %row.contract_key,
                        error = %err,
                        "Dropping malformed record"
                    );
                    dropped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        self.record_malformed(dropped);
        self.on_store_success(kept, latencies);
        Ok(())
    }

    async fn insert(&self, rows: &[GreekSnapshot]) -> StoreResult<u64> {
        match tokio::time::timeout(self.settings.write_timeout, self.store.insert_batch(rows)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.settings.write_timeout)),
        }
    }

    async fn spill(&mut self, batch: &[GreekSnapshot]) -> Result<()> {
        if let Err(err) = self.buffer.append(batch).await {
            error!(path = %self.buffer.path().display(), error = %err, rows = batch.len(), "Cannot write local buffer");
            return Err(err.into());
        }
        self.metrics.rows_buffered(batch.len());
        debug!(rows = batch.len(), pending = self.buffer.len(), "Batch buffered");
        self.publish();
        Ok(())
    }

    /// Drop rows no store would accept, before spending a write on them
    fn drop_invalid(&mut self, batch: Vec<GreekSnapshot>) -> Vec<GreekSnapshot> {
        let before = batch.len();
        let valid: Vec<GreekSnapshot> = batch
            .into_iter()
            .filter(|row| match invalid_reason(row) {
                Some(reason) => {
                    warn!(
                        snapshot_id = %row.snapshot_id,
                        source = %row.source,
                        contract_key = %row.contract_key,
                        reason,
                        "Dropping malformed record"
                    );
                    false
                }
                None => true,
            })
            .collect();
        self.record_malformed(before - valid.len());
        valid
    }

    fn record_malformed(&mut self, count: usize) {
        if count > 0 {
            self.metrics.malformed_dropped(count);
            self.status.send_modify(|s| s.malformed_dropped += count as u64);
        }
    }

    fn on_store_success(&mut self, persisted: usize, latencies: Vec<Duration>) {
        if self.breaker.record_success() == Some(CircuitState::Closed) {
            info!("Store write succeeded; circuit closed");
        }

        for latency in &latencies {
            self.metrics.record_persist_latency(*latency);
        }
        match self.latency.observe(latencies.iter().map(|l| l.as_secs_f64() * 1000.0)) {
            Some(SloChange::Breached { p95_ms }) => warn!(
                p95_ms,
                target_ms = self.latency.target_ms(),
                "Persist latency p95 above target"
            ),
            Some(SloChange::Recovered { p95_ms }) => info!(
                p95_ms,
                target_ms = self.latency.target_ms(),
                "Persist latency p95 back within target"
            ),
            None => {}
        }

        self.metrics.rows_persisted(persisted);
        self.status.send_modify(|s| s.rows_persisted += persisted as u64);
        self.publish();
    }

    fn on_store_failure(&mut self) {
        self.metrics.store_failure();
        if self.breaker.record_failure() == Some(CircuitState::Open) {
            warn!(
                consecutive_failures = self.breaker.consecutive_failures(),
                probe_interval_secs = self.settings.probe_interval.as_secs(),
                "Circuit opened; writes diverted to local buffer"
            );
        }
        self.publish();
    }

    /// Push breaker, buffer and latency state to the status channel and gauges
    fn publish(&mut self) {
        let circuit = self.breaker.state();
        self.circuit.send_if_modified(|current| {
            let changed = *current != circuit;
            *current = circuit;
            changed
        });

        let failures = self.breaker.consecutive_failures();
        let buffered = self.buffer.len();
        let p95 = self.latency.p95_ms();
        self.status.send_modify(|s| {
            s.circuit = circuit;
            s.consecutive_failures = failures;
            s.buffered_records = buffered;
            s.p95_latency_ms = p95;
        });

        self.metrics.set_circuit_state(circuit.as_gauge());
        self.metrics.set_buffer_depth(buffered);
        if let Some(p95) = p95 {
            self.metrics.set_p95_latency_ms(p95);
        }
    }
}

/// Why a record cannot be persisted, if it cannot
pub fn invalid_reason(row: &GreekSnapshot) -> Option<&'static str> {
    if row.account_id.is_empty() {
        return Some("empty account_id");
    }
    if row.contract_key.is_empty() {
        return Some("empty contract_key");
    }
    if !row.has_any_greek() {
        return Some("no greeks");
    }
    if row
        .numeric_fields()
        .iter()
        .any(|(_, value)| value.is_some_and(|v| !v.is_finite()))
    {
        return Some("non-finite value");
    }
    None
}

async fn until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{ContractKey, Source};

    fn row() -> GreekSnapshot {
        GreekSnapshot {
            snapshot_id: uuid::Uuid::new_v4(),
            source: Source::Ibkr,
            account_id: "U1".into(),
            underlying_symbol: "SPY".into(),
            contract_key: ContractKey::synthetic("SPY"),
            event_time: None,
            received_at: Utc::now(),
            persisted_at: None,
            delta: Some(0.5),
            gamma: None,
            theta: None,
            vega: None,
            rho: None,
            implied_volatility: None,
            underlying_price: None,
            raw_payload: String::new(),
            out_of_order: false,
        }
    }

    #[test]
    fn test_invalid_reason() {
        assert_eq!(invalid_reason(&row()), None);
        assert_eq!(invalid_reason(&GreekSnapshot { account_id: String::new(), ..row() }), Some("empty account_id"));
        assert_eq!(invalid_reason(&GreekSnapshot { delta: None, ..row() }), Some("no greeks"));
        assert_eq!(
            invalid_reason(&GreekSnapshot { underlying_price: Some(f64::INFINITY), ..row() }),
            Some("non-finite value")
        );
    }

    #[test]
    fn test_settings_validation() {
        assert!(WriterSettings::default().validate().is_ok());
        let bad = WriterSettings {
            batch_size: 0,
            ..WriterSettings::default()
        };
        assert!(matches!(bad.validate(), Err(WriterError::InvalidSettings(_))));
        let bad = WriterSettings {
            write_timeout: Duration::ZERO,
            ..WriterSettings::default()
        };
        assert!(bad.validate().is_err());
    }
}
