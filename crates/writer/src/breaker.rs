//! Circuit breaker guarding the durable store
//!
//! CLOSED sends writes to the store and counts consecutive failures; hitting
//! the threshold opens the circuit. OPEN diverts writes to the local buffer
//! until a health probe succeeds, which moves it to HALF_OPEN. In HALF_OPEN
//! the next real write decides: success closes the circuit, any failure
//! reopens it at once.

use common::CircuitState;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether writes may be attempted against the store
    pub fn allows_writes(&self) -> bool {
        self.state != CircuitState::Open
    }

    /// Record an acknowledged write; returns the new state if it changed
    pub fn record_success(&mut self) -> Option<CircuitState> {
        self.consecutive_failures = 0;
        self.transition(CircuitState::Closed)
    }

    /// Record a failed write; returns the new state if it changed
    pub fn record_failure(&mut self) -> Option<CircuitState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => self.transition(CircuitState::Open),
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.transition(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// A health probe succeeded; only meaningful while OPEN
    pub fn probe_succeeded(&mut self) -> Option<CircuitState> {
        match self.state {
            CircuitState::Open => self.transition(CircuitState::HalfOpen),
            _ => None,
        }
    }

    fn transition(&mut self, next: CircuitState) -> Option<CircuitState> {
        if self.state == next {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(3);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), None);
        assert!(breaker.allows_writes());
        assert_eq!(breaker.record_failure(), Some(CircuitState::Open));
        assert!(!breaker.allows_writes());
        assert_eq!(breaker.consecutive_failures(), 3);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new(2);
        breaker.record_failure();
        assert_eq!(breaker.record_success(), None);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_trial() {
        let mut breaker = CircuitBreaker::new(1);
        breaker.record_failure();
        assert_eq!(breaker.probe_succeeded(), Some(CircuitState::HalfOpen));
        assert!(breaker.allows_writes());

        // A failed trial reopens immediately
        assert_eq!(breaker.record_failure(), Some(CircuitState::Open));
        breaker.probe_succeeded();
        assert_eq!(breaker.record_success(), Some(CircuitState::Closed));
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_probe_ignored_unless_open() {
        let mut breaker = CircuitBreaker::new(3);
        assert_eq!(breaker.probe_succeeded(), None);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
