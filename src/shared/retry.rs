//! Retry with backoff, shared by the fetch and media stages.
//!
//! Each named operation ("fetch", "media-download", "media-transform") keeps
//! live statistics; the adaptive strategy widens or narrows its delay from them.

use crate::domain::DomainError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Weight of the newest sample in the smoothed latency.
const LATENCY_EMA_ALPHA: f64 = 0.2;
/// Consecutive failures past this add the extra adaptive penalty.
const FAILURE_STREAK_PENALTY_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
    Adaptive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    /// Symmetric jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_range: f64,
    pub success_threshold: f64,
    pub failure_threshold: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            jitter_range: 0.1,
            success_threshold: 0.8,
            failure_threshold: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn adaptive() -> Self {
        Self {
            strategy: RetryStrategy::Adaptive,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Running counters for one named operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
}

impl OperationStats {
    /// `None` until the first sample.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_attempts > 0).then(|| self.successes as f64 / self.total_attempts as f64)
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.total_attempts += 1;
        if success {
            self.successes += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }
        let ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = if self.total_attempts == 1 {
            ms
        } else {
            LATENCY_EMA_ALPHA * ms + (1.0 - LATENCY_EMA_ALPHA) * self.avg_latency_ms
        };
    }
}

/// Backoff calculator plus per-operation statistics.
#[derive(Debug, Default)]
pub struct RetryPolicy {
    stats: Mutex<HashMap<String, OperationStats>>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before retry number `attempt` (1 = first retry), jitter included.
    pub fn compute_delay(&self, attempt: u32, operation: &str, config: &RetryConfig) -> Duration {
        let base = self.base_delay(attempt, operation, config);
        if !config.jitter || config.jitter_range <= 0.0 || base.is_zero() {
            return base;
        }
        let range = config.jitter_range.min(1.0);
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * range;
        let ms = (base.as_secs_f64() * 1000.0 * (1.0 + offset)).clamp(0.0, config.max_delay_ms as f64);
        Duration::from_millis(ms.round() as u64)
    }

    /// Delay before jitter, clamped to `[0, max_delay]`.
    pub fn base_delay(&self, attempt: u32, operation: &str, config: &RetryConfig) -> Duration {
        let attempt = attempt.max(1);
        let base = config.base_delay_ms as f64;
        let exponential = || base * config.multiplier.max(1.0).powi(attempt as i32 - 1);
        let ms = match config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base * attempt as f64,
            RetryStrategy::Exponential => exponential(),
            RetryStrategy::Adaptive => {
                let stats = self.stats(operation).unwrap_or_default();
                exponential() * adaptive_factor(&stats, config)
            }
        };
        let ms = if ms.is_finite() { ms } else { f64::MAX };
        Duration::from_millis(ms.clamp(0.0, config.max_delay_ms as f64) as u64)
    }

    /// Record one attempt's outcome for `operation`.
    pub fn record(&self, operation: &str, success: bool, latency: Duration) {
        self.stats
            .lock()
            .entry(operation.to_string())
            .or_default()
            .record(success, latency);
    }

    pub fn stats(&self, operation: &str) -> Option<OperationStats> {
        self.stats.lock().get(operation).cloned()
    }

    pub fn all_stats(&self) -> HashMap<String, OperationStats> {
        self.stats.lock().clone()
    }

    /// Operator action: forget history for one operation.
    pub fn reset_stats(&self, operation: &str) {
        self.stats.lock().remove(operation);
    }

    /// Run `f` up to `config.max_attempts` times.
    ///
    /// Non-retryable errors return immediately. A `FloodWait` raises the
    /// delay to at least the demanded wait. After the last attempt the last
    /// error itself is returned.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        config: &RetryConfig,
        mut f: F,
    ) -> Result<T, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            match f().await {
                Ok(value) => {
                    self.record(operation, true, started.elapsed());
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.record(operation, false, started.elapsed());
                    if !e.is_retryable() || attempt >= max_attempts {
                        warn!(operation, attempt, max_attempts, error = %e, "giving up");
                        return Err(e);
                    }
                    let mut delay = self.compute_delay(attempt, operation, config);
                    if let Some(wait) = e.retry_after() {
                        delay = delay.max(wait);
                    }
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn adaptive_factor(stats: &OperationStats, config: &RetryConfig) -> f64 {
    let Some(rate) = stats.success_rate() else {
        return 1.0;
    };
    if rate >= config.success_threshold {
        let headroom = 1.0 - config.success_threshold;
        let over = if headroom <= 0.0 {
            1.0
        } else {
            ((rate - config.success_threshold) / headroom).clamp(0.0, 1.0)
        };
        0.9 - 0.4 * over
    } else if rate <= config.failure_threshold {
        let under = if config.failure_threshold <= 0.0 {
            1.0
        } else {
            ((config.failure_threshold - rate) / config.failure_threshold).clamp(0.0, 1.0)
        };
        let factor = 1.5 + 3.5 * under;
        if stats.consecutive_failures > FAILURE_STREAK_PENALTY_AFTER {
            factor * 1.5
        } else {
            factor
        }
    } else {
        1.0
    }
}
