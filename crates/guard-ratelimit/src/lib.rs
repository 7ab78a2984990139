//! Named token-bucket rate limiters for outbound provider calls.
//!
//! Each bucket holds up to `capacity` tokens and refills at
//! `refill_per_second`. Refill is lazy: tokens are credited from elapsed
//! time on every acquire, so no background task is needed. Acquisition waits
//! cooperatively up to `max_wait` and fails with [`RateLimitError::Timeout`]
//! beyond that.
//!
//! Buckets are registered once at startup from configuration and addressed
//! by name; acquiring from an unknown name is an error rather than a silent
//! pass-through.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Upper bound on a single cooperative wait slice while polling for tokens.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Errors surfaced by token acquisition.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RateLimitError {
    /// The bucket could not supply the tokens within `max_wait`.
    #[error("rate limited: waited {waited:?} for {tokens} token(s) from '{bucket}'")]
    Timeout {
        bucket: String,
        tokens: u32,
        waited: Duration,
    },

    /// More tokens were requested than the bucket can ever hold.
    #[error("bucket '{bucket}' capacity {capacity} cannot satisfy {tokens} token(s)")]
    ExceedsCapacity {
        bucket: String,
        capacity: u32,
        tokens: u32,
    },

    /// No bucket is registered under this name.
    #[error("rate limiter '{0}' is not registered")]
    UnknownBucket(String),

    /// A bucket with this name already exists.
    #[error("rate limiter '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Configuration for a single named bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum number of tokens the bucket holds.
    pub capacity: u32,
    /// Tokens credited per second.
    pub refill_per_second: f64,
    /// Ceiling on how long an acquire may wait.
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
}

fn default_max_wait() -> Duration {
    Duration::from_secs(60)
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single thread-safe token bucket.
pub struct TokenBucket {
    name: String,
    config: BucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(name: impl Into<String>, config: BucketConfig) -> Self {
        let tokens = f64::from(config.capacity);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BucketState {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Credit tokens for the time elapsed since the last refill.
    fn refill(state: &mut BucketState, config: &BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let credited = elapsed.as_secs_f64() * config.refill_per_second;
        state.tokens = (state.tokens + credited).min(f64::from(config.capacity));
        state.last_refill = now;
    }

    /// Take `tokens` if currently available, without waiting.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        Self::refill(&mut state, &self.config, Instant::now());

        if state.tokens >= f64::from(tokens) {
            state.tokens -= f64::from(tokens);
            true
        } else {
            false
        }
    }

    /// Acquire `tokens`, waiting cooperatively up to the bucket's `max_wait`.
    pub async fn acquire(&self, tokens: u32) -> Result<(), RateLimitError> {
        if tokens > self.config.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                bucket: self.name.clone(),
                capacity: self.config.capacity,
                tokens,
            });
        }

        let started = Instant::now();

        loop {
            let deficit = {
                let mut state = self.state.lock().expect("bucket mutex poisoned");
                Self::refill(&mut state, &self.config, Instant::now());

                if state.tokens >= f64::from(tokens) {
                    state.tokens -= f64::from(tokens);
                    return Ok(());
                }
                f64::from(tokens) - state.tokens
            };

            let waited = started.elapsed();
            if waited >= self.config.max_wait {
                return Err(RateLimitError::Timeout {
                    bucket: self.name.clone(),
                    tokens,
                    waited,
                });
            }

            // Sleep until the deficit should be covered, in bounded slices so
            // a competing acquirer cannot starve us indefinitely unnoticed.
            let until_ready = {
                let secs = deficit / self.config.refill_per_second;
                if secs.is_finite() && secs >= 0.0 && secs < self.config.max_wait.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    self.config.max_wait
                }
            };
            let remaining = self.config.max_wait - waited;
            tokio::time::sleep(until_ready.min(WAIT_SLICE).min(remaining).max(Duration::from_millis(1)))
                .await;
        }
    }

    /// Current token count after a lazy refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        Self::refill(&mut state, &self.config, Instant::now());
        state.tokens
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A fixed set of named buckets, built once at startup.
#[derive(Default)]
pub struct RateLimiterSet {
    buckets: HashMap<String, TokenBucket>,
}

impl RateLimiterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from configuration, one bucket per entry.
    pub fn from_config<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a BucketConfig)>,
    {
        let mut set = Self::new();
        for (name, config) in entries {
            // Map keys are unique, so registration cannot fail here.
            let _ = set.register(name.clone(), config.clone());
        }
        set
    }

    /// Register a bucket. Fails if the name is already taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        config: BucketConfig,
    ) -> Result<(), RateLimitError> {
        let name = name.into();
        if self.buckets.contains_key(&name) {
            return Err(RateLimitError::AlreadyRegistered(name));
        }
        self.buckets
            .insert(name.clone(), TokenBucket::new(name, config));
        Ok(())
    }

    /// Acquire tokens from a named bucket, waiting up to its `max_wait`.
    pub async fn acquire(&self, name: &str, tokens: u32) -> Result<(), RateLimitError> {
        let bucket = self
            .buckets
            .get(name)
            .ok_or_else(|| RateLimitError::UnknownBucket(name.to_string()))?;
        bucket.acquire(tokens).await
    }

    pub fn bucket(&self, name: &str) -> Option<&TokenBucket> {
        self.buckets.get(name)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
