//! Retry controller with exponential backoff and optional jitter
//!
//! The controller re-runs an operation while its errors are retriable
//! (see [`FetchError::is_retriable`]) and the attempt budget lasts. Fatal
//! errors are handed back untouched on the attempt that produced them.

use crate::config::NetworkConfig;
use crate::network::cancel::CancellationSignal;
use crate::network::errors::FetchError;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Backoff strategy for retry delays
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay: Duration },
    /// Linear increase in delay
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },
    /// Exponential increase in delay (default)
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
    /// Full jitter (uniform random up to exponential cap)
    FullJitter {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        }
    }
}

impl BackoffStrategy {
    /// Delay after the failed attempt with the given 0-based index
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,

            BackoffStrategy::Linear {
                initial,
                increment,
                max,
            } => {
                let delay = initial.saturating_add(increment.saturating_mul(attempt));
                delay.min(*max)
            }

            BackoffStrategy::Exponential {
                initial,
                multiplier,
                max,
            } => Self::exponential_ms(*initial, *multiplier, attempt, *max),

            BackoffStrategy::FullJitter {
                initial,
                multiplier,
                max,
            } => {
                // random(0, min(cap, base * 2^attempt))
                let capped = Self::exponential_ms(*initial, *multiplier, attempt, *max);
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(0..=capped.as_millis().max(1) as u64))
            }
        }
    }

    fn exponential_ms(initial: Duration, multiplier: f64, attempt: u32, max: Duration) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = initial.as_millis() as f64 * multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= max.as_millis() as f64 {
            max
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    /// Create a fixed backoff strategy
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed { delay }
    }

    /// Create a doubling backoff strategy
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        BackoffStrategy::Exponential {
            initial,
            multiplier: 2.0,
            max,
        }
    }

    /// Create a full jitter strategy
    pub fn full_jitter(initial: Duration, max: Duration) -> Self {
        BackoffStrategy::FullJitter {
            initial,
            multiplier: 2.0,
            max,
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per operation, the first one included
    pub max_attempts: u32,
    /// Backoff strategy
    pub backoff: BackoffStrategy,
    /// Portion of each delay to randomize (0.0 disables jitter)
    pub jitter_factor: f64,
    /// Maximum total time to spend sleeping between attempts
    pub max_retry_duration: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            jitter_factor: 0.0,
            max_retry_duration: None,
        }
    }
}

impl From<&NetworkConfig> for RetryPolicy {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff: BackoffStrategy::exponential(
                Duration::from_millis(config.retry_base_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            jitter_factor: config.retry_jitter,
            max_retry_duration: None,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with a single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the total attempt budget
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Set backoff strategy
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set jitter factor
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Cap the total backoff time
    pub fn with_max_duration(mut self, budget: Duration) -> Self {
        self.max_retry_duration = Some(budget);
        self
    }

    /// Calculate the delay before the next attempt
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.backoff.delay(attempt);

        if self.jitter_factor > 0.0 {
            Self::apply_jitter(base_delay, self.jitter_factor)
        } else {
            base_delay
        }
    }

    fn apply_jitter(delay: Duration, factor: f64) -> Duration {
        let mut rng = rand::thread_rng();
        let delay_ms = delay.as_millis() as f64;
        let jitter_range = delay_ms * factor;
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        let final_ms = (delay_ms + jitter).max(1.0) as u64;
        Duration::from_millis(final_ms)
    }
}

/// Retry metrics
#[derive(Debug, Default)]
pub struct RetryMetrics {
    /// Total operations attempted
    pub total_operations: AtomicU64,
    /// Operations that succeeded on first try
    pub first_try_success: AtomicU64,
    /// Operations that succeeded after retry
    pub retry_success: AtomicU64,
    /// Operations that failed after all retries
    pub retry_exhausted: AtomicU64,
    /// Operations that ended on a fatal error
    pub fatal_errors: AtomicU64,
    /// Total retry attempts made
    pub total_retry_attempts: AtomicU64,
    /// Total time spent waiting between retries
    pub total_retry_delay_ms: AtomicU64,
}

impl RetryMetrics {
    /// Calculate retry success rate
    pub fn retry_success_rate(&self) -> f64 {
        let retry_success = self.retry_success.load(Ordering::Relaxed);
        let retry_exhausted = self.retry_exhausted.load(Ordering::Relaxed);
        let total = retry_success + retry_exhausted;
        if total == 0 {
            0.0
        } else {
            retry_success as f64 / total as f64
        }
    }

    /// Calculate average retries per failed first attempt
    pub fn avg_retries_per_failure(&self) -> f64 {
        let attempts = self.total_retry_attempts.load(Ordering::Relaxed);
        let failures =
            self.retry_success.load(Ordering::Relaxed) + self.retry_exhausted.load(Ordering::Relaxed);
        if failures == 0 {
            0.0
        } else {
            attempts as f64 / failures as f64
        }
    }
}

/// Runs operations under the current [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryController {
    policy: RwLock<RetryPolicy>,
    metrics: RetryMetrics,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            metrics: RetryMetrics::default(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy.read().clone()
    }

    /// Replace the policy; operations already running keep the old one
    pub fn reconfigure(&self, policy: RetryPolicy) {
        *self.policy.write() = policy;
    }

    pub fn metrics(&self) -> &RetryMetrics {
        &self.metrics
    }

    /// Execute an async operation with retry logic.
    ///
    /// Returns the first success, the first fatal error, or
    /// [`FetchError::RetriesExhausted`] once the attempt budget is spent on
    /// retriable errors. Cancellation is observed before every attempt and
    /// while sleeping between attempts.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationSignal,
        mut operation: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let policy = self.policy();
        let started = Instant::now();
        let mut attempt: u32 = 0;
        self.metrics.total_operations.fetch_add(1, Ordering::Relaxed);

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            attempt += 1;

            let error = match operation().await {
                Ok(result) => {
                    let counter = if attempt == 1 {
                        &self.metrics.first_try_success
                    } else {
                        &self.metrics.retry_success
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(error) => error,
            };

            if !error.is_retriable() {
                self.metrics.fatal_errors.fetch_add(1, Ordering::Relaxed);
                return Err(error);
            }

            let delay = policy.next_delay(attempt - 1);
            let over_budget = policy
                .max_retry_duration
                .is_some_and(|budget| started.elapsed() + delay > budget);
            if attempt >= policy.max_attempts || over_budget {
                self.metrics.retry_exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            tracing::warn!(
                "Attempt {} of {} failed, retrying in {:?}: {}",
                attempt,
                policy.max_attempts,
                delay,
                error
            );
            self.metrics.total_retry_attempts.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .total_retry_delay_ms
                .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            }
        }
    }
}
