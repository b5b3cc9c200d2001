//! Bounded retry execution with exponential backoff and a circuit breaker.
//!
//! A [`RetryExecutor`] runs one unit of work at a time, retrying on failure
//! with exponential backoff and optional jitter, until the work succeeds or
//! a budget is spent: the duration budget, the attempt budget (fixed mode),
//! or the circuit breaker opening after repeated consecutive failures.

mod circuit;

pub use circuit::{CircuitBreaker, CircuitState};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bound on the retained error history.
const MAX_ERROR_HISTORY: usize = 100;

/// Whether the attempt budget is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Retry until the duration budget is spent.
    #[default]
    Infinite,
    /// Retry at most `max_attempts` times.
    Fixed,
}

/// Executor phase, reported through [`RetryExecutor::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorPhase {
    /// No work in flight.
    #[default]
    Ready,
    /// An attempt loop is running.
    Retrying,
    /// The last run stopped because the breaker was open.
    CircuitOpen,
    /// The last run spent its attempt or duration budget.
    Exhausted,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt budget mode.
    pub mode: RetryMode,
    /// Maximum attempts in fixed mode (including the first).
    pub max_attempts: u32,
    /// Total wall-clock budget for one execution.
    pub max_duration: Duration,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor for the delay.
    pub exponential_base: f64,
    /// Whether to jitter each delay by ±10 %.
    pub jitter: bool,
    /// Whether the circuit breaker participates.
    pub circuit_enabled: bool,
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Cooldown before an open breaker admits a probe.
    pub recovery_timeout: Duration,
    /// Probe successes needed to close the breaker.
    pub success_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Infinite,
            max_attempts: 10,
            max_duration: Duration::from_secs(24 * 60 * 60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            circuit_enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl RetryConfig {
    /// Creates a config with defaults (infinite mode, 24 h budget).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fixed-mode config with the given attempt budget.
    #[must_use]
    pub fn fixed(max_attempts: u32) -> Self {
        Self {
            mode: RetryMode::Fixed,
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the duration budget.
    #[must_use]
    pub fn with_max_duration(mut self, budget: Duration) -> Self {
        self.max_duration = budget;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the exponential growth factor.
    #[must_use]
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Enables or disables the circuit breaker.
    #[must_use]
    pub fn with_circuit_enabled(mut self, enabled: bool) -> Self {
        self.circuit_enabled = enabled;
        self
    }

    /// Sets the breaker's failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the breaker's recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Sets the breaker's success threshold.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

/// Why a retried execution stopped without succeeding.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The attempt or duration budget was spent; carries the last error.
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Wall-clock time spent.
        elapsed: Duration,
        /// The final underlying error.
        source: E,
    },
    /// The breaker is open; the retry was withheld.
    CircuitOpen {
        /// Time until a probe will be admitted, if known.
        retry_after: Option<Duration>,
        /// The failure that tripped the breaker, when one occurred in this
        /// run (`None` when the breaker was already open on entry).
        source: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Returns the underlying error, if one was captured.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            Self::CircuitOpen { source, .. } => source.as_ref(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                attempts, source, ..
            } => {
                write!(f, "Retry budget exhausted after {attempts} attempts: {source}")
            }
            Self::CircuitOpen { retry_after, .. } => match retry_after {
                Some(after) => write!(
                    f,
                    "Circuit breaker open; retry withheld for {:.1}s",
                    after.as_secs_f64()
                ),
                None => write!(f, "Circuit breaker open; retry withheld"),
            },
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for RetryError<E> {}

/// One entry in the bounded error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The attempt number that produced the error (1-based).
    pub attempt: u32,
    /// When the error was recorded (ISO 8601).
    pub timestamp: String,
    /// The error's display form.
    pub message: String,
}

/// Serializable view of executor state.
#[derive(Debug, Clone, Serialize)]
pub struct RetrySnapshot {
    /// Executor phase.
    pub phase: ExecutorPhase,
    /// Breaker position.
    pub circuit_state: CircuitState,
    /// Consecutive failures across executions.
    pub consecutive_failures: u32,
    /// Consecutive successes across executions.
    pub consecutive_successes: u32,
    /// Errors retained in the bounded history.
    pub error_count: usize,
}

struct ExecutorState {
    phase: ExecutorPhase,
    breaker: CircuitBreaker,
    errors: VecDeque<ErrorRecord>,
}

impl ExecutorState {
    fn push_error(&mut self, attempt: u32, message: String) {
        while self.errors.len() >= MAX_ERROR_HISTORY {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorRecord {
            attempt,
            timestamp: crate::utils::iso_timestamp(),
            message,
        });
    }
}

type RetryHook = Arc<dyn Fn(u32, Duration) + Send + Sync>;
type CircuitOpenHook = Arc<dyn Fn(u32) + Send + Sync>;
type CircuitCloseHook = Arc<dyn Fn() + Send + Sync>;
type ExhaustedHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Executes one unit of work with bounded backoff retry and automatic
/// suspension via a circuit breaker.
///
/// Breaker counters persist across executions of the same executor; the
/// internal async mutex guarantees at most one invocation in flight.
pub struct RetryExecutor {
    config: RetryConfig,
    state: Mutex<ExecutorState>,
    in_flight: tokio::sync::Mutex<()>,
    on_retry: RwLock<Option<RetryHook>>,
    on_circuit_open: RwLock<Option<CircuitOpenHook>>,
    on_circuit_close: RwLock<Option<CircuitCloseHook>>,
    on_exhausted: RwLock<Option<ExhaustedHook>>,
}

impl RetryExecutor {
    /// Creates an executor with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.failure_threshold,
            config.recovery_timeout,
            config.success_threshold,
        );
        Self {
            config,
            state: Mutex::new(ExecutorState {
                phase: ExecutorPhase::Ready,
                breaker,
                errors: VecDeque::new(),
            }),
            in_flight: tokio::sync::Mutex::new(()),
            on_retry: RwLock::new(None),
            on_circuit_open: RwLock::new(None),
            on_circuit_close: RwLock::new(None),
            on_exhausted: RwLock::new(None),
        }
    }

    /// Sets the hook invoked before each backoff sleep.
    pub fn set_on_retry<F>(&self, hook: F)
    where
        F: Fn(u32, Duration) + Send + Sync + 'static,
    {
        *self.on_retry.write() = Some(Arc::new(hook));
    }

    /// Sets the hook invoked when the breaker opens.
    pub fn set_on_circuit_open<F>(&self, hook: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        *self.on_circuit_open.write() = Some(Arc::new(hook));
    }

    /// Sets the hook invoked when the breaker closes.
    pub fn set_on_circuit_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_circuit_close.write() = Some(Arc::new(hook));
    }

    /// Sets the hook invoked when a run stops without success.
    pub fn set_on_exhausted<F>(&self, hook: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        *self.on_exhausted.write() = Some(Arc::new(hook));
    }

    /// Returns whether an attempt would be admitted right now.
    #[must_use]
    pub fn can_attempt(&self) -> bool {
        if !self.config.circuit_enabled {
            return true;
        }
        self.state.lock().breaker.can_attempt()
    }

    /// Returns a serializable view of executor state.
    #[must_use]
    pub fn snapshot(&self) -> RetrySnapshot {
        let state = self.state.lock();
        RetrySnapshot {
            phase: state.phase,
            circuit_state: state.breaker.state(),
            consecutive_failures: state.breaker.consecutive_failures(),
            consecutive_successes: state.breaker.consecutive_successes(),
            error_count: state.errors.len(),
        }
    }

    /// Returns the bounded error history, oldest first.
    #[must_use]
    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.state.lock().errors.iter().cloned().collect()
    }

    /// Runs `operation` until it succeeds or a budget is spent.
    ///
    /// Holding an internal async mutex for the whole loop guarantees no
    /// overlapping retries of the same logical call.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let _guard = self.in_flight.lock().await;
        let start = Instant::now();
        let mut attempts: u32 = 0;

        {
            let mut state = self.state.lock();
            if self.config.circuit_enabled && !state.breaker.can_attempt() {
                state.phase = ExecutorPhase::CircuitOpen;
                let retry_after = state.breaker.retry_after();
                drop(state);
                self.fire_exhausted(0);
                return Err(RetryError::CircuitOpen {
                    retry_after,
                    source: None,
                });
            }
            state.phase = ExecutorPhase::Retrying;
        }

        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    let closed = {
                        let mut state = self.state.lock();
                        let closed = state.breaker.record_success();
                        state.phase = ExecutorPhase::Ready;
                        closed
                    };
                    if closed {
                        debug!("Circuit breaker closed after successful probe streak");
                        let hook = self.on_circuit_close.read().clone();
                        if let Some(hook) = hook {
                            hook();
                        }
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let (opened, failures, blocked, retry_after) = {
                        let mut state = self.state.lock();
                        state.push_error(attempts, err.to_string());
                        let opened =
                            self.config.circuit_enabled && state.breaker.record_failure();
                        let failures = state.breaker.consecutive_failures();
                        let blocked =
                            self.config.circuit_enabled && !state.breaker.can_attempt();
                        (opened, failures, blocked, state.breaker.retry_after())
                    };

                    if opened {
                        warn!(
                            consecutive_failures = failures,
                            "Circuit breaker opened"
                        );
                        let hook = self.on_circuit_open.read().clone();
                        if let Some(hook) = hook {
                            hook(failures);
                        }
                    }

                    let elapsed = start.elapsed();
                    if elapsed >= self.config.max_duration {
                        self.state.lock().phase = ExecutorPhase::Exhausted;
                        self.fire_exhausted(attempts);
                        return Err(RetryError::Exhausted {
                            attempts,
                            elapsed,
                            source: err,
                        });
                    }

                    if self.config.mode == RetryMode::Fixed
                        && attempts >= self.config.max_attempts
                    {
                        self.state.lock().phase = ExecutorPhase::Exhausted;
                        self.fire_exhausted(attempts);
                        return Err(RetryError::Exhausted {
                            attempts,
                            elapsed,
                            source: err,
                        });
                    }

                    if blocked {
                        self.state.lock().phase = ExecutorPhase::CircuitOpen;
                        self.fire_exhausted(attempts);
                        return Err(RetryError::CircuitOpen {
                            retry_after,
                            source: Some(err),
                        });
                    }

                    let delay = self.backoff_delay(attempts);
                    debug!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after error"
                    );
                    let hook = self.on_retry.read().clone();
                    if let Some(hook) = hook {
                        hook(attempts, delay);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Computes the delay before the retry following `attempt`.
    ///
    /// `delay = clamp(base * exponential_base^(attempt-1), 0, max_delay)`,
    /// optionally jittered by ±10 % (never negative, never above the cap).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let raw = self.config.base_delay.as_secs_f64()
            * self.config.exponential_base.powi(exponent as i32);
        let capped = raw.min(self.config.max_delay.as_secs_f64()).max(0.0);

        let jittered = if self.config.jitter && capped > 0.0 {
            let factor = rand::thread_rng().gen_range(0.9..=1.1);
            (capped * factor)
                .min(self.config.max_delay.as_secs_f64())
                .max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    fn fire_exhausted(&self, attempts: u32) {
        let hook = self.on_exhausted.read().clone();
        if let Some(hook) = hook {
            hook(attempts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = RetryExecutor::new(fast_config());
        let result: Result<u32, RetryError<String>> =
            executor.execute(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(executor.snapshot().phase, ExecutorPhase::Ready);
    }

    #[tokio::test]
    async fn test_fixed_mode_invokes_exactly_max_attempts() {
        let config = RetryConfig::fixed(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false)
            .with_circuit_enabled(false);
        let executor = RetryExecutor::new(config);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), RetryError<String>> = executor
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {n}"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::Exhausted {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, "failure 3");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let executor = RetryExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<&str, RetryError<String>> = executor
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_zero_duration_budget_exhausts_after_one_attempt() {
        let config = fast_config().with_max_duration(Duration::ZERO);
        let executor = RetryExecutor::new(config);

        let result: Result<(), RetryError<String>> =
            executor.execute(|| async { Err("always".to_string()) }).await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(executor.snapshot().phase, ExecutorPhase::Exhausted);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_blocks_attempts() {
        let config = fast_config()
            .with_failure_threshold(2)
            .with_recovery_timeout(Duration::from_secs(60));
        let executor = RetryExecutor::new(config);

        let result: Result<(), RetryError<String>> =
            executor.execute(|| async { Err("down".to_string()) }).await;

        // Second consecutive failure opens the breaker mid-loop.
        match result {
            Err(RetryError::CircuitOpen { source, .. }) => {
                assert_eq!(source.as_deref(), Some("down"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!executor.can_attempt());
        assert_eq!(executor.snapshot().circuit_state, CircuitState::Open);

        // A fresh execution is withheld without invoking the work.
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let withheld: Result<(), RetryError<String>> = executor
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(
            withheld,
            Err(RetryError::CircuitOpen { source: None, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_recovers_through_probe() {
        let config = fast_config()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(20))
            .with_success_threshold(1);
        let executor = RetryExecutor::new(config);

        let _: Result<(), RetryError<String>> =
            executor.execute(|| async { Err("down".to_string()) }).await;
        assert!(!executor.can_attempt());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(executor.can_attempt());

        let closed = Arc::new(AtomicU32::new(0));
        let closed_clone = closed.clone();
        executor.set_on_circuit_close(move || {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });

        let result: Result<u32, RetryError<String>> =
            executor.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(executor.snapshot().circuit_state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_breaker() {
        let config = fast_config()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(10));
        let executor = RetryExecutor::new(config);

        let _: Result<(), RetryError<String>> =
            executor.execute(|| async { Err("down".to_string()) }).await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        let result: Result<(), RetryError<String>> =
            executor.execute(|| async { Err("still down".to_string()) }).await;
        assert!(matches!(result, Err(RetryError::CircuitOpen { .. })));
        assert!(!executor.can_attempt());
    }

    #[tokio::test]
    async fn test_on_retry_hook_fires_per_backoff() {
        let config = RetryConfig::fixed(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false)
            .with_circuit_enabled(false);
        let executor = RetryExecutor::new(config);

        let retries = Arc::new(AtomicU32::new(0));
        let retries_clone = retries.clone();
        executor.set_on_retry(move |_, _| {
            retries_clone.fetch_add(1, Ordering::SeqCst);
        });

        let _: Result<(), RetryError<String>> =
            executor.execute(|| async { Err("always".to_string()) }).await;

        // Three attempts mean two backoff sleeps.
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_history_is_bounded() {
        let config = RetryConfig::fixed(150)
            .with_base_delay(Duration::ZERO)
            .with_jitter(false)
            .with_circuit_enabled(false);
        let executor = RetryExecutor::new(config);

        let _: Result<(), RetryError<String>> =
            executor.execute(|| async { Err("noise".to_string()) }).await;

        let history = executor.error_history();
        assert_eq!(history.len(), 100);
        assert_eq!(history.last().unwrap().attempt, 150);
    }

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(false);
        let executor = RetryExecutor::new(config);

        assert_eq!(executor.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(executor.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(executor.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(executor.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(executor.backoff_delay(20), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(true);
        let executor = RetryExecutor::new(config);

        for _ in 0..50 {
            let delay = executor.backoff_delay(1);
            assert!(delay >= Duration::from_millis(90));
            assert!(delay <= Duration::from_millis(110));
        }
    }
}
