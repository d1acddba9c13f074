//! Rolling persist-latency window

use std::collections::VecDeque;

/// Change in SLO standing after new samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SloChange {
    /// p95 crossed above the target
    Breached { p95_ms: f64 },
    /// p95 came back to or below the target
    Recovered { p95_ms: f64 },
}

/// p95 of receipt-to-commit latency over the last `capacity` records
#[derive(Debug)]
pub struct LatencyTracker {
    samples: VecDeque<f64>,
    capacity: usize,
    target_ms: f64,
    breached: bool,
    p95_ms: Option<f64>,
}

impl LatencyTracker {
    pub fn new(capacity: usize, target_ms: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            target_ms,
            breached: false,
            p95_ms: None,
        }
    }

    pub fn target_ms(&self) -> f64 {
        self.target_ms
    }

    pub fn p95_ms(&self) -> Option<f64> {
        self.p95_ms
    }

    pub fn is_breached(&self) -> bool {
        self.breached
    }

    /// Add one batch worth of samples and recompute p95
    pub fn observe(&mut self, latencies_ms: impl IntoIterator<Item = f64>) -> Option<SloChange> {
        for sample in latencies_ms {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(sample.max(0.0));
        }

        let p95 = percentile(&self.samples, 0.95)?;
        self.p95_ms = Some(p95);

        let breached = p95 > self.target_ms;
        let change = match (self.breached, breached) {
            (false, true) => Some(SloChange::Breached { p95_ms: p95 }),
            (true, false) => Some(SloChange::Recovered { p95_ms: p95 }),
            _ => None,
        };
        self.breached = breached;
        change
    }
}

/// Nearest-rank percentile
fn percentile(samples: &VecDeque<f64>, quantile: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.saturating_sub(1)).copied()
}
