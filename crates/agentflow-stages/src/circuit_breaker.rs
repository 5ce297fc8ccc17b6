//! Circuit breaker for model API calls
//!
//! Opens after a run of consecutive non-retryable failures and rejects calls
//! until a cool-down has passed, then lets a probe through.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the cool-down ends
    Open,
    /// Cool-down ended; the next request is a probe
    HalfOpen,
}

#[derive(Debug, Default)]
struct Counters {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Consecutive-failure circuit breaker
///
/// ```
/// use agentflow_stages::CircuitBreaker;
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
/// breaker.record_failure();
/// breaker.record_failure();
/// assert!(!breaker.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    counters: Mutex<Counters>,
    threshold: u32,
    cool_down: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cool_down: Duration) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            threshold: threshold.max(1),
            cool_down,
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        let counters = self.counters();
        if counters.consecutive_failures < self.threshold {
            return CircuitState::Closed;
        }
        match counters.last_failure {
            Some(at) if at.elapsed() < self.cool_down => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut counters = self.counters();
        counters.consecutive_failures = 0;
        counters.last_failure = None;
    }

    pub fn record_failure(&self) {
        let mut counters = self.counters();
        counters.consecutive_failures += 1;
        counters.last_failure = Some(Instant::now());
    }

    pub fn failure_count(&self) -> u32 {
        self.counters().consecutive_failures
    }

    /// Time left before a probe is allowed; zero unless open
    pub fn time_until_retry(&self) -> Duration {
        let counters = self.counters();
        if counters.consecutive_failures < self.threshold {
            return Duration::ZERO;
        }
        counters
            .last_failure
            .map(|at| self.cool_down.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        // 3 failures, one minute cool-down
        Self::new(3, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.time_until_retry(), Duration::ZERO);
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert!(cb.time_until_retry() > Duration::from_secs(50));
    }

    #[test]
    fn test_success_closes() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cool_down() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(50));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute());

        // A failed probe re-opens immediately
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_zero_threshold_treated_as_one() {
        let cb = CircuitBreaker::new(0, Duration::from_secs(60));
        assert!(cb.can_execute());
        cb.record_failure();
        assert!(!cb.can_execute());
    }
}
