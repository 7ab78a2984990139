//! Retry strategies and backoff policies for provider calls.
//!
//! This crate provides a small, classification-aware retry layer:
//! - Exponential backoff with a hard cap and bounded positive jitter
//! - Retry decisions driven by a caller-supplied error classifier, so only
//!   transient failures are retried and precondition/input errors pass
//!   through untouched
//! - An async executor that preserves the original error on exhaustion
//!
//! # Example
//!
//! ```
//! use guard_retry::{BackoffConfig, delay_for_attempt};
//!
//! let config = BackoffConfig::default();
//! let delay = delay_for_attempt(&config, 2);
//! println!("second retry waits: {:?}", delay);
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration for retried operations.
///
/// Attempt `k` (1-indexed) waits `min(max_wait, min_wait * 2^(k-1))`
/// multiplied by a random factor in `[1, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_min_wait", with = "humantime_serde")]
    pub min_wait: Duration,
    /// Cap applied to the exponential delay.
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
    /// Upper bound of the random delay inflation (0.1 = up to +10%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_max_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_wait: default_min_wait(),
            max_wait: default_max_wait(),
            jitter: default_jitter(),
        }
    }
}

/// Calculate the delay before the retry that follows attempt `attempt`.
///
/// `attempt` is 1-indexed: after the first failed attempt the wait is
/// `min_wait`, after the second `2 * min_wait`, and so on up to `max_wait`.
pub fn delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let base = config
        .min_wait
        .saturating_mul(2_u32.saturating_pow(pow))
        .min(config.max_wait);

    if config.jitter > 0.0 {
        apply_jitter(base, config.jitter)
    } else {
        base
    }
}

/// Inflate a delay by a random factor in `[1, 1 + jitter]`.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let factor: f64 = 1.0 + rng.gen_range(0.0..=jitter);
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// Outcome summary attached to exhausted retries, for logging at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    /// Number of attempts actually made.
    pub attempts: u32,
}

/// Run an async operation with retries on classified-retryable errors.
///
/// The operation receives the current attempt number (starting at 1). Errors
/// for which `is_retryable` returns false are returned immediately; retryable
/// errors are retried with backoff until `max_attempts` is reached, at which
/// point the final error is returned unchanged.
pub async fn retry<T, E, F, Fut, C>(
    config: &BackoffConfig,
    mut is_retryable: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || !is_retryable(&err) {
                    return Err(err);
                }

                let delay = delay_for_attempt(config, attempt);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Synchronous counterpart of [`retry`] for call sites that are not async.
///
/// Sleeps on the current thread between attempts; never use on an async
/// executor thread.
pub fn retry_blocking<T, E, F, C>(
    config: &BackoffConfig,
    mut is_retryable: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    C: FnMut(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || !is_retryable(&err) {
                    return Err(err);
                }

                std::thread::sleep(delay_for_attempt(config, attempt));
                attempt += 1;
            }
        }
    }
}
