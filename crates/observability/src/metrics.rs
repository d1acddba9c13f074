//! Prometheus metrics infrastructure
//!
//! Each pipeline stage owns one handle struct, built once at startup and
//! cloned into its task. Handles are cheap to clone and are no-ops until a
//! recorder is installed with [`init_metrics`].

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP listener on `address` exposing `/metrics`.
///
/// ```ignore
/// observability::metrics::init_metrics("0.0.0.0:9100")?;
/// ```
pub fn init_metrics(address: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = address.parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Metrics for one stream session
///
/// # Metrics
///
/// * `greek_session_messages_total` - Payloads handed to the inbound channel
/// * `greek_session_dropped_total` - Payloads dropped under backpressure
/// * `greek_session_reconnects_total` - Connect attempts after the first
/// * `greek_session_parse_errors_total` - Frames that could not be parsed
/// * `greek_session_state` - Current state (0 disconnected .. 4 reconnecting)
#[derive(Clone)]
pub struct SessionMetrics {
    messages: Counter,
    dropped: Counter,
    reconnects: Counter,
    parse_errors: Counter,
    state: Gauge,
    source: &'static str,
}

impl SessionMetrics {
    pub fn new(source: &'static str) -> Self {
        Self {
            messages: counter!("greek_session_messages_total", "source" => source),
            dropped: counter!("greek_session_dropped_total", "source" => source),
            reconnects: counter!("greek_session_reconnects_total", "source" => source),
            parse_errors: counter!("greek_session_parse_errors_total", "source" => source),
            state: gauge!("greek_session_state", "source" => source),
            source,
        }
    }

    pub fn messages_delivered(&self, count: u64) {
        self.messages.increment(count);
    }

    pub fn messages_dropped(&self, count: u64) {
        self.dropped.increment(count);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnects.increment(1);
    }

    pub fn parse_error(&self) {
        self.parse_errors.increment(1);
    }

    pub fn set_state(&self, encoded: f64) {
        self.state.set(encoded);
    }

    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// Metrics for the normalization processor, labelled by source
#[derive(Clone)]
pub struct NormalizerMetrics {
    accepted: fn(&'static str) -> Counter,
    duplicates: fn(&'static str) -> Counter,
    out_of_order: fn(&'static str) -> Counter,
    rejected: fn(&'static str, &'static str) -> Counter,
    queue_wait: Histogram,
}

impl NormalizerMetrics {
    pub fn new() -> Self {
        Self {
            accepted: |source| counter!("greek_records_accepted_total", "source" => source),
            duplicates: |source| counter!("greek_records_duplicate_total", "source" => source),
            out_of_order: |source| counter!("greek_records_out_of_order_total", "source" => source),
            rejected: |source, reason| {
                counter!("greek_records_rejected_total", "source" => source, "reason" => reason)
            },
            queue_wait: histogram!("greek_inbound_queue_wait_seconds"),
        }
    }

    pub fn accepted(&self, source: &'static str) {
        (self.accepted)(source).increment(1);
    }

    pub fn duplicate(&self, source: &'static str) {
        (self.duplicates)(source).increment(1);
    }

    pub fn out_of_order(&self, source: &'static str) {
        (self.out_of_order)(source).increment(1);
    }

    pub fn rejected(&self, source: &'static str, reason: &'static str) {
        (self.rejected)(source, reason).increment(1);
    }

    /// Time a payload spent in the inbound channel before dequeue
    pub fn record_queue_wait(&self, wait: Duration) {
        self.queue_wait.record(wait.as_secs_f64());
    }
}

impl Default for NormalizerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for the resilient batch writer
#[derive(Clone)]
pub struct WriterMetrics {
    rows_persisted: Counter,
    rows_buffered: Counter,
    rows_replayed: Counter,
    malformed_dropped: Counter,
    store_failures: Counter,
    flushes: Counter,
    circuit_state: Gauge,
    buffer_depth: Gauge,
    p95_latency_ms: Gauge,
    persist_latency: Histogram,
}

impl WriterMetrics {
    pub fn new() -> Self {
        Self {
            rows_persisted: counter!("greek_rows_persisted_total"),
            rows_buffered: counter!("greek_rows_buffered_total"),
            rows_replayed: counter!("greek_rows_replayed_total"),
            malformed_dropped: counter!("greek_rows_malformed_total"),
            store_failures: counter!("greek_store_failures_total"),
            flushes: counter!("greek_writer_flushes_total"),
            circuit_state: gauge!("greek_circuit_state"),
            buffer_depth: gauge!("greek_buffer_depth"),
            p95_latency_ms: gauge!("greek_persist_latency_p95_ms"),
            persist_latency: histogram!("greek_persist_latency_seconds"),
        }
    }

    pub fn rows_persisted(&self, count: usize) {
        self.rows_persisted.increment(count as u64);
    }

    pub fn rows_buffered(&self, count: usize) {
        self.rows_buffered.increment(count as u64);
    }

    pub fn rows_replayed(&self, count: usize) {
        self.rows_replayed.increment(count as u64);
    }

    pub fn malformed_dropped(&self, count: usize) {
        self.malformed_dropped.increment(count as u64);
    }

    pub fn store_failure(&self) {
        self.store_failures.increment(1);
    }

    pub fn flush(&self) {
        self.flushes.increment(1);
    }

    pub fn set_circuit_state(&self, encoded: f64) {
        self.circuit_state.set(encoded);
    }

    pub fn set_buffer_depth(&self, depth: u64) {
        self.buffer_depth.set(depth as f64);
    }

    pub fn set_p95_latency_ms(&self, ms: f64) {
        self.p95_latency_ms.set(ms);
    }

    pub fn record_persist_latency(&self, latency: Duration) {
        self.persist_latency.record(latency.as_secs_f64());
    }
}

impl Default for WriterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_work_without_recorder() {
        let session = SessionMetrics::new("ibkr");
        session.messages_delivered(3);
        session.set_state(2.0);
        assert_eq!(session.source(), "ibkr");

        let normalizer = NormalizerMetrics::new();
        normalizer.rejected("tastytrade", "no_greeks");

        let writer = WriterMetrics::new();
        writer.rows_persisted(50);
        writer.record_persist_latency(Duration::from_millis(120));
    }

    #[test]
    fn test_init_metrics_rejects_bad_address() {
        assert!(init_metrics("not an address").is_err());
    }
}
