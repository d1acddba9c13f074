//! Bounded reconnect backoff

use std::time::Duration;

use crate::error::{Result, SessionError};

/// Ordered reconnect delays; once exhausted the last delay repeats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(steps: Vec<Duration>) -> Result<Self> {
        if steps.is_empty() {
            return Err(SessionError::InvalidBackoff(
                "at least one delay is required".to_string(),
            ));
        }
        if steps.iter().any(Duration::is_zero) {
            return Err(SessionError::InvalidBackoff(format!(
                "delays must be positive, got {:?}",
                steps
            )));
        }
        Ok(Self { steps })
    }

    pub fn from_secs(secs: &[u64]) -> Result<Self> {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize).min(self.steps.len()) - 1;
        self.steps[index]
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ],
        }
    }
}
