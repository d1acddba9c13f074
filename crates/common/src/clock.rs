//! Injectable wall clock

use chrono::{DateTime, Utc};

/// Source of wall-clock time
///
/// Timers always run on tokio's clock; anything that stamps or compares
/// wall-clock time (maintenance windows, status and latency timestamps)
/// reads this instead of `Utc::now()`.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock pinned to a fixed origin and advanced by tokio's clock
///
/// Under a paused runtime this moves only when tokio time moves, which keeps
/// time-of-day decisions consistent with the timers that drive them.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let origin = Utc.with_ymd_and_hms(2024, 1, 18, 4, 0, 0).unwrap();
        let clock = TokioClock::starting_at(origin);
        assert_eq!(clock.now(), origin);

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::seconds(90));
    }
}
