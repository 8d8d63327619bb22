//! C1 — per-source admission control.
//!
//! Ported from the Python original's `UnifiedRateLimiter`: a token-bucket
//! or sliding-window primitive, optionally wrapped by an adaptive layer
//! that shrinks/grows the effective rate based on rolling success rate,
//! plus exponential backoff with jitter on repeated denial. `acquire`
//! never fails — it slow-paths (sleeps) instead of raising, exactly as
//! spec.md §4.1 requires.
//!
//! The collectors themselves additionally gate their raw HTTP calls with
//! `governor`'s token bucket (see `collectors::odds_api`), the way the
//! teacher's `OddsIngestionService` does directly against the-odds-api.
//! This module is the richer, strategy-selectable admission layer the
//! orchestrator consults per source before a task is allowed to run.

use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    TokenBucket,
    SlidingWindow,
}

/// Result of one `acquire` call, mirroring `RateLimitResult` in the original.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub wait_time: Duration,
    pub reason: String,
    pub tokens_remaining: f64,
}

struct TokenBucket {
    base_rate: f64,
    base_capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            base_rate: rate,
            base_capacity: capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Returns (allowed, wait_time). Mirrors `TokenBucket.acquire`, but the
    /// rate and capacity used for this call are `base * multiplier` —
    /// `RateLimiter::acquire` passes in the adaptive layer's current
    /// multiplier (1.0 when adaptation is disabled, so behavior is
    /// unchanged in that case).
    fn acquire(&mut self, tokens: f64, multiplier: f64) -> (bool, Duration) {
        let rate = self.base_rate * multiplier;
        let capacity = self.base_capacity * multiplier;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = capacity.min(self.tokens + elapsed * rate);
        self.last_refill = now;

        if self.tokens >= tokens {
            self.tokens -= tokens;
            (true, Duration::ZERO)
        } else {
            let needed = tokens - self.tokens;
            let wait = needed / rate;
            (false, Duration::from_secs_f64(wait.max(0.0)))
        }
    }
}

struct SlidingWindow {
    base_max_requests: usize,
    window: Duration,
    requests: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            base_max_requests: max_requests,
            window,
            requests: VecDeque::new(),
        }
    }

    /// Returns (allowed, wait_time). Mirrors `SlidingWindowRateLimiter.can_proceed`,
    /// with the window capacity scaled by the adaptive multiplier the same
    /// way `TokenBucket::acquire` scales rate and capacity.
    fn can_proceed(&mut self, multiplier: f64) -> (bool, Duration) {
        let max_requests = ((self.base_max_requests as f64) * multiplier).max(1.0) as usize;

        let now = Instant::now();
        while let Some(&front) = self.requests.front() {
            if now.duration_since(front) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }

        if self.requests.len() < max_requests {
            self.requests.push_back(now);
            (true, Duration::ZERO)
        } else {
            let oldest = *self.requests.front().unwrap();
            let elapsed = now.duration_since(oldest);
            let wait = self.window.saturating_sub(elapsed);
            (false, wait)
        }
    }
}

/// Shrinks rate on sustained low success, grows it cautiously on high
/// success. Floor 0.1x, ceiling 2.0x, growth factor 1.1, shrink factor
/// from config (`adaptation_factor`, default 0.5).
struct AdaptiveLayer {
    success_rate_threshold: f64,
    adaptation_factor: f64,
    multiplier: f64,
    history: VecDeque<bool>,
}

impl AdaptiveLayer {
    const HISTORY_CAP: usize = 100;
    const MIN_SAMPLES: usize = 10;

    fn new(success_rate_threshold: f64, adaptation_factor: f64) -> Self {
        Self {
            success_rate_threshold,
            adaptation_factor,
            multiplier: 1.0,
            history: VecDeque::new(),
        }
    }

    fn record(&mut self, success: bool) {
        self.history.push_back(success);
        if self.history.len() > Self::HISTORY_CAP {
            self.history.pop_front();
        }
        self.update_multiplier();
    }

    fn update_multiplier(&mut self) {
        if self.history.len() < Self::MIN_SAMPLES {
            return;
        }
        let success_rate =
            self.history.iter().filter(|s| **s).count() as f64 / self.history.len() as f64;

        if success_rate < self.success_rate_threshold {
            self.multiplier = (self.multiplier * self.adaptation_factor).max(0.1);
        } else if success_rate > 0.95 {
            self.multiplier = (self.multiplier * 1.1).min(2.0);
        }
    }
}

struct SourceState {
    strategy: RateLimitStrategy,
    config: RateLimitConfig,
    bucket: Option<TokenBucket>,
    window: Option<SlidingWindow>,
    adaptive: Option<AdaptiveLayer>,
    recent_denials: VecDeque<bool>,
}

/// Per-source rate limiter. One instance is shared (via `Arc`) across all
/// collectors and the orchestrator for a given source.
pub struct RateLimiter {
    sources: Mutex<std::collections::HashMap<String, SourceState>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn configure(&self, source: &str, strategy: RateLimitStrategy, config: RateLimitConfig) {
        let mut sources = self.sources.lock().await;
        let bucket = if strategy == RateLimitStrategy::TokenBucket {
            Some(TokenBucket::new(
                config.requests_per_second,
                config.burst_limit as f64,
            ))
        } else {
            None
        };
        let window = if strategy == RateLimitStrategy::SlidingWindow {
            Some(SlidingWindow::new(
                (config.requests_per_second * 60.0).max(1.0) as usize,
                Duration::from_secs(60),
            ))
        } else {
            None
        };
        let adaptive = if config.adaptive_enabled {
            Some(AdaptiveLayer::new(
                config.success_rate_threshold,
                config.adaptation_factor,
            ))
        } else {
            None
        };

        sources.insert(
            source.to_string(),
            SourceState {
                strategy,
                config,
                bucket,
                window,
                adaptive,
                recent_denials: VecDeque::new(),
            },
        );
    }

    /// Acquire `tokens` admission slots for `source`. Never fails; sleeps
    /// the required wait before returning when denied.
    pub async fn acquire(&self, source: &str, tokens: u32) -> RateLimitResult {
        if self.sources.lock().await.get(source).is_none() {
            self.configure(source, RateLimitStrategy::TokenBucket, RateLimitConfig::default())
                .await;
        }

        let (mut allowed, mut wait, exponential_backoff, max_delay, jitter) = {
            let mut sources = self.sources.lock().await;
            let state = sources.get_mut(source).expect("configured above");

            let multiplier = state.adaptive.as_ref().map(|a| a.multiplier).unwrap_or(1.0);
            let (allowed, wait) = match state.strategy {
                RateLimitStrategy::TokenBucket => state
                    .bucket
                    .as_mut()
                    .expect("token bucket configured")
                    .acquire(tokens as f64, multiplier),
                RateLimitStrategy::SlidingWindow => state
                    .window
                    .as_mut()
                    .expect("sliding window configured")
                    .can_proceed(multiplier),
            };

            state.recent_denials.push_back(!allowed);
            if state.recent_denials.len() > 10 {
                state.recent_denials.pop_front();
            }

            (
                allowed,
                wait,
                state.config.exponential_backoff,
                state.config.max_delay_seconds,
                state.config.jitter,
            )
        };

        if !allowed && exponential_backoff {
            let recent_failures = {
                let sources = self.sources.lock().await;
                sources
                    .get(source)
                    .map(|s| s.recent_denials.iter().filter(|d| **d).count())
                    .unwrap_or(0)
            };
            let backoff_multiplier = 2_f64.powi(recent_failures.min(5) as i32);
            let mut wait_secs = (wait.as_secs_f64() * backoff_multiplier).min(max_delay);

            if jitter {
                let jitter_amount = wait_secs * 0.1 * rand::thread_rng().gen_range(-1.0..=1.0);
                wait_secs = (wait_secs + jitter_amount).max(0.0);
            }
            wait = Duration::from_secs_f64(wait_secs);
        }

        let tokens_remaining = {
            let sources = self.sources.lock().await;
            sources
                .get(source)
                .and_then(|s| s.bucket.as_ref())
                .map(|b| b.tokens)
                .unwrap_or(0.0)
        };

        let reason = if allowed {
            String::new()
        } else {
            format!("rate limited, wait {:.2}s", wait.as_secs_f64())
        };

        if !allowed && wait > Duration::ZERO {
            sleep(wait).await;
            // After sleeping the computed wait, admission is granted —
            // matches the spec's "slow-path instead of fail" contract.
            allowed = true;
        }

        RateLimitResult {
            allowed,
            wait_time: wait,
            reason,
            tokens_remaining,
        }
    }

    /// Feed the adaptive layer with the outcome of the request that was admitted.
    pub async fn record_result(&self, source: &str, success: bool) {
        let mut sources = self.sources.lock().await;
        if let Some(state) = sources.get_mut(source) {
            if let Some(adaptive) = state.adaptive.as_mut() {
                adaptive.record(success);
            }
        }
    }

    pub async fn current_multiplier(&self, source: &str) -> f64 {
        let sources = self.sources.lock().await;
        sources
            .get(source)
            .and_then(|s| s.adaptive.as_ref())
            .map(|a| a.multiplier)
            .unwrap_or(1.0)
    }
}
