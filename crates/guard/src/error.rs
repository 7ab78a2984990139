//! Error taxonomy for the upgrade core.
//!
//! Providers normalise their native failures into these classified errors
//! before returning, so every call site can decide on retry and abort
//! behavior from the [`ErrorKind`] alone. Only `Transient` and `RateLimited`
//! errors are eligible for retry; precondition and input failures always
//! pass through to the state machine.

use serde::{Deserialize, Serialize};

/// Classification of an error, recorded into upgrade history and used by the
/// retry layer to decide eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network hiccups, provider 5xx, rate-limit rejection. Retried.
    Transient,
    /// CAS conflicts, lost or already-held locks, failed status conditions.
    Precondition,
    /// Malformed configuration, invalid dotted path, bad upgrade spec.
    InvalidInput,
    /// Missing cluster, secret, file, or merge request.
    NotFound,
    /// Unauthorised, role cannot be assumed; fatal for the cluster.
    ProviderFatal,
    /// A step exceeded its budget.
    Timeout,
    /// The surrounding work was cancelled.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Precondition => "precondition",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ProviderFatal => "provider_fatal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error type shared by the core components and provider ports.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
    /// Transient provider failure; safe to retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The rate limiter refused the call within its wait ceiling.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A conditional write lost the race; refetch and retry the intent.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An expected-status or expected-rev condition did not hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The lock is held by another owner.
    #[error("lock already held: {0}")]
    LockHeld(String),

    /// The lease was lost to another owner or expired.
    #[error("lock lost: {0}")]
    LockLost(String),

    /// Malformed input; fail fast, never retry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unrecoverable provider failure for this cluster.
    #[error("provider failure: {0}")]
    ProviderFatal(String),

    /// A step exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Cancellation was observed at a suspension point.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl GuardError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn provider_fatal(msg: impl Into<String>) -> Self {
        Self::ProviderFatal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// The taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::Transient(_) | GuardError::RateLimited(_) => ErrorKind::Transient,
            GuardError::Conflict(_)
            | GuardError::PreconditionFailed(_)
            | GuardError::LockHeld(_)
            | GuardError::LockLost(_) => ErrorKind::Precondition,
            GuardError::InvalidInput(_) => ErrorKind::InvalidInput,
            GuardError::NotFound(_) => ErrorKind::NotFound,
            GuardError::ProviderFatal(_) => ErrorKind::ProviderFatal,
            GuardError::Timeout(_) => ErrorKind::Timeout,
            GuardError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether the retry layer may re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<guard_ratelimit::RateLimitError> for GuardError {
    fn from(err: guard_ratelimit::RateLimitError) -> Self {
        use guard_ratelimit::RateLimitError;
        match err {
            RateLimitError::Timeout { .. } => GuardError::RateLimited(err.to_string()),
            RateLimitError::UnknownBucket(_)
            | RateLimitError::AlreadyRegistered(_)
            | RateLimitError::ExceedsCapacity { .. } => GuardError::InvalidInput(err.to_string()),
        }
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, GuardError>;
