//! Circuit breaker state machine.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// The breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts flow normally.
    Closed,
    /// Attempts are withheld until the recovery timeout elapses.
    Open,
    /// The recovery timeout elapsed; probing attempts are allowed.
    HalfOpen,
}

/// Halts attempts after repeated consecutive failures until a cooldown
/// elapses.
///
/// Callers must serialize access (the executor holds a lock); with that in
/// place, the half-open state admits exactly one probing attempt at a time —
/// a failed probe re-opens the breaker, a success streak of
/// `success_threshold` closes it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            success_threshold: success_threshold.max(1),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }

    /// Returns whether an attempt may proceed right now.
    ///
    /// Transitions `Open -> HalfOpen` once the recovery timeout has elapsed.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful attempt.
    ///
    /// Returns `true` if the breaker closed as a result.
    pub fn record_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        if self.state != CircuitState::Closed
            && self.consecutive_successes >= self.success_threshold
        {
            self.state = CircuitState::Closed;
            self.opened_at = None;
            return true;
        }
        false
    }

    /// Records a failed attempt.
    ///
    /// Returns `true` if the breaker opened (or re-opened) as a result.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;

        match self.state {
            CircuitState::HalfOpen => {
                // A failed probe re-opens with a fresh cooldown.
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                true
            }
            CircuitState::Closed => {
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Time remaining until the breaker will admit a probe, if open.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self.state {
            CircuitState::Open => self
                .opened_at
                .map(|at| self.recovery_timeout.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    /// Returns the current breaker position.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Returns the consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns the consecutive success count.
    #[must_use]
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Resets the breaker to closed with cleared counters.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_failure_threshold() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60), 1);

        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(20), 1);
        breaker.record_failure();
        assert!(!breaker.can_attempt());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10), 1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.can_attempt());

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_success_streak_closes() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10), 2);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.can_attempt());

        assert!(!breaker.record_success());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.record_success());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60), 1);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        assert_eq!(breaker.consecutive_failures(), 0);
        // Two more failures are not enough to open after the reset.
        breaker.record_failure();
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60), 1);
        assert!(breaker.retry_after().is_none());

        breaker.record_failure();
        let remaining = breaker.retry_after().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }
}
