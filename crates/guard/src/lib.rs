//! # Guard
//!
//! A safety layer for progressive service-mesh upgrades across a fleet of
//! managed Kubernetes clusters.
//!
//! Guard never mutates clusters directly. It proposes version changes as
//! merge requests against a Git-backed desired-state repository and observes
//! the external reconciler applying them, comparing post-upgrade telemetry
//! against a pre-upgrade baseline and proposing an automatic rollback when
//! the verdict fails.
//!
//! ## Pipeline
//!
//! Per cluster, one invocation runs **lock → pre-check → baseline →
//! upgrade MR → merge → rollout → validate → healthy | rollback**:
//!
//! 1. [`lock::LockManager`] serializes work on the cluster across
//!    orchestrator processes, with fencing tokens and lease auto-renewal.
//! 2. [`checks`] runs the registered pre-upgrade checks with per-check
//!    timeouts and fail-fast on critical failures.
//! 3. [`validation::ValidationOrchestrator`] captures the baseline snapshot,
//!    and after the rollout compares the post-upgrade snapshot against the
//!    configured thresholds.
//! 4. [`gitops::ChangeProducer`] opens the draft upgrade merge request, and
//!    the non-draft rollback merge request when validation fails.
//! 5. [`engine::UpgradeEngine`] drives the per-cluster state machine,
//!    committing every transition through the registry's conditional-write
//!    path before the next step begins.
//! 6. [`batch::BatchEngine`] gates a batch on its prerequisite batches and
//!    fans clusters out under a bounded worker pool.
//!
//! ## Key types
//!
//! - `ClusterRecord` — the persistent unit of state, one per cluster
//! - `ClusterStatus` — the lifecycle state machine's vertex set
//! - `UpgradeSpec` — validated dotted-path edits one upgrade applies
//! - `MetricsSnapshot` — telemetry over a window; failed queries stay `None`
//! - `BatchOutcome` / `ClusterOutcome` — what a run reports back
//!
//! ## Modules
//!
//! - [`types`] — domain types: records, statuses, specs, snapshots, outcomes
//! - [`error`] — classified error taxonomy shared with the provider ports
//! - [`config`] — `guard.toml` loading and validation
//! - [`providers`] — async ports onto cloud, Kubernetes, metrics, and VCS
//! - [`middleware`] — rate-limit and retry wrappers around the ports
//! - [`store`] — cluster state store port and the in-memory adapter
//! - [`registry`] — typed registry facade with ABA-safe status transitions
//! - [`lock`] — distributed lock with fencing tokens and lease renewal
//! - [`checks`] — pre-upgrade check registry, runner, and built-in checks
//! - [`validation`] — snapshot capture, validator registry, and verdict
//! - [`gitops`] — dotted-path document editing and merge-request flows
//! - [`engine`] — the per-cluster upgrade state machine
//! - [`batch`] — batch gating, bounded parallelism, outcome aggregation
//! - [`metrics`] — in-memory operation metrics and timing helpers
//! - [`clock`] — injectable time source and identity minting

/// Batch gating, bounded parallelism, outcome aggregation.
pub mod batch;

/// Pre-upgrade check registry, runner, and built-in checks.
pub mod checks;

/// Injectable time source and identity minting.
pub mod clock;

/// Configuration file (`guard.toml`) loading and validation.
pub mod config;

/// The per-cluster upgrade state machine.
pub mod engine;

/// Classified error taxonomy shared with the provider ports.
pub mod error;

/// Dotted-path document editing and merge-request flows.
pub mod gitops;

/// Distributed lock with fencing tokens and lease renewal.
pub mod lock;

/// In-memory operation metrics and timing helpers.
pub mod metrics;

/// Rate-limit and retry middleware around the provider ports.
pub mod middleware;

/// Async ports onto cloud, Kubernetes, metrics, and version control.
pub mod providers;

/// Typed registry facade with ABA-safe status transitions.
pub mod registry;

/// Cluster state store port and the in-memory adapter.
pub mod store;

/// Domain types: records, statuses, specs, snapshots, outcomes.
pub mod types;

/// Snapshot capture, validator registry, and verdict.
pub mod validation;

/// Shared fixtures for unit tests.
#[cfg(test)]
pub(crate) mod testutil;

/// Stress tests for concurrent orchestrator behavior.
#[cfg(test)]
mod stress_tests;

/// Configurable retry strategies with backoff and jitter.
/// Re-exported from the guard-retry microcrate.
pub use guard_retry as retry;

/// Named token-bucket rate limiters.
/// Re-exported from the guard-ratelimit microcrate.
pub use guard_ratelimit as ratelimit;
