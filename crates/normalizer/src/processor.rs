//! The normalization processor task

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{Clock, GreekSnapshot, InboundMessage, NormalizerStats, SystemClock};
use observability::NormalizerMetrics;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::dedup::{DedupTracker, Verdict};
use crate::error::NormalizeError;
use crate::mapping::map_payload;

/// Single consumer of the shared inbound channel
///
/// Turns each inbound message into zero or one [`GreekSnapshot`] and hands
/// it to the writer. Runs until the inbound channel closes, then drops its
/// output sender so the writer sees end-of-stream.
pub struct NormalizationProcessor {
    inbound: mpsc::Receiver<InboundMessage>,
    output: mpsc::Sender<GreekSnapshot>,
    dedup: DedupTracker,
    stats: watch::Sender<NormalizerStats>,
    metrics: NormalizerMetrics,
    clock: Arc<dyn Clock>,
}

impl NormalizationProcessor {
    pub fn new(
        inbound: mpsc::Receiver<InboundMessage>,
        output: mpsc::Sender<GreekSnapshot>,
        dedup_history: usize,
    ) -> Self {
        let (stats, _) = watch::channel(NormalizerStats::default());
        Self {
            inbound,
            output,
            dedup: DedupTracker::new(dedup_history),
            stats,
            metrics: NormalizerMetrics::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> watch::Receiver<NormalizerStats> {
        self.stats.subscribe()
    }

    pub async fn run(mut self) {
        info!("Normalization processor started");

        while let Some(message) = self.inbound.recv().await {
            let received_at = self.clock.now();
            if let Ok(wait) = (received_at - message.read_at).to_std() {
                self.metrics.record_queue_wait(wait);
            }

            let Some(snapshot) = self.normalize(message, received_at) else {
                continue;
            };
            if self.output.send(snapshot).await.is_err() {
                warn!("Writer is gone; stopping normalization");
                break;
            }
        }

        let stats = *self.stats.borrow();
        info!(
            accepted = stats.accepted,
            duplicates = stats.duplicates,
            out_of_order = stats.out_of_order,
            rejected = stats.rejected,
            "Normalization processor drained"
        );
    }

    /// Map, validate and deduplicate one message
    ///
    /// `received_at` is the dequeue instant, taken before any parsing.
    pub fn normalize(&mut self, message: InboundMessage, received_at: DateTime<Utc>) -> Option<GreekSnapshot> {
        let source = message.source;
        let label = source.as_str();

        let mapped = if message.payload.source() != source {
            Err(NormalizeError::SourceMismatch {
                session: source,
                payload: message.payload.source(),
            })
        } else {
            map_payload(&message.payload).and_then(|partial| {
                if partial.has_any_greek() {
                    Ok(partial)
                } else {
                    Err(NormalizeError::NoGreeks)
                }
            })
        };

        let partial = match mapped {
            Ok(partial) => partial,
            Err(err) => {
                debug!(%source, reason = err.reason(), error = %err, "Rejected payload");
                self.metrics.rejected(label, err.reason());
                self.stats.send_modify(|s| s.rejected += 1);
                return None;
            }
        };

        let out_of_order = match self.dedup.observe(source, &partial.contract_key, partial.event_time) {
            Verdict::Duplicate => {
                self.metrics.duplicate(label);
                self.stats.send_modify(|s| s.duplicates += 1);
                return None;
            }
            Verdict::OutOfOrder => {
                debug!(
                    %source,
                    contract_key = %partial.contract_key,
                    event_time = ?partial.event_time,
                    "Out-of-order event"
                );
                self.metrics.out_of_order(label);
                true
            }
            Verdict::InOrder => false,
        };

        self.metrics.accepted(label);
        self.stats.send_modify(|s| {
            s.accepted += 1;
            if out_of_order {
                s.out_of_order += 1;
            }
        });

        Some(partial.into_snapshot(source, &message.account_id, received_at, message.raw, out_of_order))
    }
}
