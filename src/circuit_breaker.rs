//! C2 — per-source circuit breaker.
//!
//! Ported from the Python original's `EnhancedCircuitBreaker`: a
//! CLOSED/OPEN/HALF_OPEN state machine with configurable recovery
//! strategy, a background recovery task that probes for reopening, and a
//! fallback → degraded-mode → fail chain on the OPEN path so callers
//! never have to special-case "the breaker is open" against "the call
//! actually failed".

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    ImmediateRetry,
    DegradedMode,
}

/// A live value, a registered fallback's value, or the degraded-mode
/// stand-in, so callers can distinguish "the source is fine, here's
/// data" from "the breaker is open, here's a substitute" from "the
/// breaker is open, here's an empty shell" without an error path.
#[derive(Debug, Clone)]
pub enum CallOutcome<T> {
    Live(T),
    Fallback(T),
    Degraded,
}

type HealthCheckFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

struct Metrics {
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl Metrics {
    fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        }
    }

    fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    fn success_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.total_successes.load(Ordering::Relaxed) as f64 / total as f64
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    half_open_calls: u32,
    retry_attempt: u32,
}

/// One breaker per source. Constructed once and shared (`Arc`) across the
/// collector and orchestrator for that source.
pub struct CircuitBreaker {
    source: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: Metrics,
    health_check: Mutex<Option<HealthCheckFn>>,
    self_weak: Weak<CircuitBreaker>,
}

impl CircuitBreaker {
    pub fn new(source: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            source: source.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                half_open_calls: 0,
                retry_attempt: 0,
            }),
            metrics: Metrics::new(),
            health_check: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// Register the health-check function the background recovery task
    /// calls after its backoff sleep, per source. Without one, recovery
    /// falls back to the existing lazy check: the next real call that
    /// arrives after `timeout_duration` still flips OPEN to HALF_OPEN.
    pub async fn set_health_check<F, Fut>(&self, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let boxed: HealthCheckFn = Arc::new(move || Box::pin(check()));
        *self.health_check.lock().await = Some(boxed);
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub fn success_rate(&self) -> f64 {
        self.metrics.success_rate()
    }

    /// Run `f` through the breaker with no registered fallback. Equivalent
    /// to `call_with_fallback(f, None)`.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<CallOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_with_fallback(f, None::<fn() -> std::future::Ready<T>>).await
    }

    /// Run `f` through the breaker. When OPEN (and not eligible for a
    /// half-open probe): invoke `fallback` if one was supplied, else
    /// return `CallOutcome::Degraded` if degraded mode is enabled, else
    /// fail with "circuit open" — the three-way chain the breaker's
    /// contract describes.
    pub async fn call_with_fallback<T, F, Fut, Fb, FbFut>(
        &self,
        f: F,
        fallback: Option<Fb>,
    ) -> Result<CallOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = T>,
    {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::Open => {
                    if self.should_attempt_reset(&inner) {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_calls = 0;
                        info!(source = %self.source, "circuit breaker half-open, probing");
                    } else if let Some(fallback) = fallback {
                        drop(inner);
                        return Ok(CallOutcome::Fallback(fallback().await));
                    } else if self.config.enable_degraded_mode {
                        return Ok(CallOutcome::Degraded);
                    } else {
                        return Err(PipelineError::transient(
                            self.source.clone(),
                            "circuit breaker open",
                        ));
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_calls >= self.config.half_open_max_calls {
                        if let Some(fallback) = fallback {
                            drop(inner);
                            return Ok(CallOutcome::Fallback(fallback().await));
                        }
                        if self.config.enable_degraded_mode {
                            return Ok(CallOutcome::Degraded);
                        }
                        return Err(PipelineError::transient(
                            self.source.clone(),
                            "circuit breaker half-open call budget exhausted",
                        ));
                    }
                    inner.half_open_calls += 1;
                }
                CircuitState::Closed => {}
            }
        }

        match f().await {
            Ok(value) => {
                self.on_success().await;
                Ok(CallOutcome::Live(value))
            }
            Err(err) => {
                self.on_failure().await;
                Err(err)
            }
        }
    }

    fn should_attempt_reset(&self, inner: &Inner) -> bool {
        match inner.opened_at {
            Some(opened_at) => opened_at.elapsed() >= self.config.timeout_duration,
            None => true,
        }
    }

    async fn on_success(&self) {
        self.metrics.record_success();
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                if self.metrics.consecutive_successes.load(Ordering::Relaxed)
                    >= self.config.success_threshold
                {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.retry_attempt = 0;
                    if self.config.alert_on_recovery {
                        info!(source = %self.source, "circuit breaker closed, source recovered");
                    }
                }
            }
            CircuitState::Open => {
                // a success while nominally open only happens via an
                // in-flight half-open probe racing a state check; ignore.
            }
            CircuitState::Closed => {}
        }
    }

    async fn on_failure(&self) {
        self.metrics.record_failure();
        let just_opened = {
            let mut inner = self.inner.lock().await;
            let consecutive = self.metrics.consecutive_failures.load(Ordering::Relaxed);

            match inner.state {
                CircuitState::Closed => {
                    if consecutive >= self.config.failure_threshold {
                        self.transition_to_open(&mut inner);
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    self.transition_to_open(&mut inner);
                    true
                }
                CircuitState::Open => false,
            }
        };

        if just_opened && self.config.enable_automatic_recovery {
            self.spawn_recovery_task();
        }
    }

    fn transition_to_open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.retry_attempt += 1;
        if self.config.alert_on_open {
            warn!(source = %self.source, "circuit breaker opened");
        }
    }

    /// Background probe loop: sleep per the configured recovery strategy
    /// (capped attempts), then run the registered health check. On the
    /// first pass, flip OPEN to HALF_OPEN so the next real call probes the
    /// source directly. No-op if `self` is no longer held by an `Arc`
    /// (e.g. a test drops the breaker immediately after opening it).
    fn spawn_recovery_task(&self) {
        let Some(strong) = self.self_weak.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            for attempt in 1..=strong.config.max_retry_attempts {
                let delay = strong.recovery_delay(RecoveryStrategy::ExponentialBackoff).await;
                tokio::time::sleep(delay).await;

                {
                    let inner = strong.inner.lock().await;
                    if inner.state != CircuitState::Open {
                        return;
                    }
                }

                let healthy = match strong.health_check.lock().await.clone() {
                    Some(check) => check().await,
                    None => true,
                };

                if healthy {
                    let mut inner = strong.inner.lock().await;
                    if inner.state == CircuitState::Open {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_calls = 0;
                        info!(
                            source = %strong.source,
                            attempt,
                            "recovery probe passed, transitioning to half-open"
                        );
                    }
                    return;
                }
            }
            warn!(
                source = %strong.source,
                "recovery task exhausted max_retry_attempts without a passing health check"
            );
        });
    }

    /// Delay before the next reset attempt, per the configured strategy.
    /// Exposed so the orchestrator can schedule recovery probes instead of
    /// busy-polling `should_attempt_reset`.
    pub async fn recovery_delay(&self, strategy: RecoveryStrategy) -> Duration {
        let attempt = self.inner.lock().await.retry_attempt.max(1);
        let base = self.config.base_retry_delay.as_secs_f64();
        let max = self.config.max_retry_delay.as_secs_f64();

        let seconds = match strategy {
            RecoveryStrategy::ExponentialBackoff => base * 2f64.powi((attempt - 1) as i32),
            RecoveryStrategy::LinearBackoff => base * attempt as f64,
            RecoveryStrategy::ImmediateRetry | RecoveryStrategy::DegradedMode => base,
        };
        Duration::from_secs_f64(seconds.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            timeout_duration: Duration::from_millis(20),
            half_open_max_calls: 1,
            success_threshold: 1,
            ..CircuitBreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("vsin", fast_config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "timeout")) })
                .await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn degraded_mode_returned_while_open() {
        let breaker = CircuitBreaker::new("vsin", fast_config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "timeout")) })
                .await;
        }
        let outcome = breaker
            .call(|| async { Ok::<_, PipelineError>(42) })
            .await
            .unwrap();
        assert!(matches!(outcome, CallOutcome::Degraded));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("vsin", fast_config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "timeout")) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let outcome = breaker
            .call(|| async { Ok::<_, PipelineError>(1) })
            .await
            .unwrap();
        assert!(matches!(outcome, CallOutcome::Live(1)));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new("vsin", fast_config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "timeout")) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _ = breaker
            .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "timeout again")) })
            .await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn exponential_recovery_delay_doubles_and_caps() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(4),
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("vsin", config);
        let _ = breaker
            .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "x")) })
            .await;
        let delay = breaker.recovery_delay(RecoveryStrategy::ExponentialBackoff).await;
        assert_eq!(delay, Duration::from_secs(1));

        let _ = breaker
            .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "x")) })
            .await;
        let delay = breaker.recovery_delay(RecoveryStrategy::ExponentialBackoff).await;
        assert!(delay <= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn registered_fallback_runs_before_degraded_mode_while_open() {
        let breaker = CircuitBreaker::new("vsin", fast_config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "timeout")) })
                .await;
        }

        let outcome = breaker
            .call_with_fallback(
                || async { Ok::<_, PipelineError>(99) },
                Some(|| async { 7 }),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CallOutcome::Fallback(7)));
    }

    #[tokio::test]
    async fn recovery_task_flips_to_half_open_once_health_check_passes() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            base_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(10),
            timeout_duration: Duration::from_secs(300),
            max_retry_attempts: 3,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("vsin", config);
        breaker.set_health_check(|| async { true }).await;

        let _ = breaker
            .call(|| async { Err::<(), _>(PipelineError::transient("vsin", "x")) })
            .await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // timeout_duration is 300s, so only the background recovery task
        // (not the lazy should_attempt_reset check in call()) can account
        // for this transition.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }
}
