//! Configuration file support (`guard.toml`).
//!
//! Typed sections with per-field defaults; unknown keys are rejected at load
//! time so a typo fails the run before it can silently change behavior.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::gitops::GitOpsSettings;
use crate::types::ValidationThresholds;

/// Scheduling and wait-window knobs for the upgrade engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Bound on concurrently upgraded clusters within a batch.
    pub max_parallel_clusters: usize,
    /// Stabilisation window a converged rollout must hold.
    #[serde(with = "humantime_serde")]
    pub soak_window: Duration,
    /// How long to wait for the upgrade MR to merge before abandoning.
    #[serde(with = "humantime_serde")]
    pub mr_merge_wait: Duration,
    /// How long to wait for the reconciler to converge the control plane.
    #[serde(with = "humantime_serde")]
    pub rollout_wait: Duration,
    /// Length of the baseline and post-upgrade metric windows.
    #[serde(with = "humantime_serde")]
    pub snapshot_window: Duration,
    /// Stop the pre-check pipeline at the first critical failure.
    pub fail_fast_checks: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_clusters: 5,
            soak_window: Duration::from_secs(10 * 60),
            mr_merge_wait: Duration::from_secs(30 * 60),
            rollout_wait: Duration::from_secs(30 * 60),
            snapshot_window: Duration::from_secs(10 * 60),
            fail_fast_checks: true,
        }
    }
}

/// Cluster-lock lease settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    #[serde(with = "humantime_serde")]
    pub lease: Duration,
    #[serde(with = "humantime_serde")]
    pub renew_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60 * 60),
            renew_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Where the mesh control plane lives in each cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlaneConfig {
    pub deployment: String,
    pub namespace: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            deployment: "istiod".to_string(),
            namespace: "istio-system".to_string(),
        }
    }
}

/// Branch and document conventions for the desired-state repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitOpsConfig {
    pub default_branch: String,
    pub version_path: String,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        let settings = GitOpsSettings::default();
        Self {
            default_branch: settings.default_branch,
            version_path: settings.version_path,
        }
    }
}

impl From<GitOpsConfig> for GitOpsSettings {
    fn from(config: GitOpsConfig) -> Self {
        Self {
            default_branch: config.default_branch,
            version_path: config.version_path,
        }
    }
}

/// A named set of clusters upgraded as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// Top-level `guard.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    pub execution: ExecutionConfig,
    pub lock: LockConfig,
    pub control_plane: ControlPlaneConfig,
    pub gitops: GitOpsConfig,
    pub thresholds: ValidationThresholds,
    pub retry: guard_retry::BackoffConfig,
    /// Named token buckets gating each provider.
    pub rate_limits: BTreeMap<String, guard_ratelimit::BucketConfig>,
    /// Batch name to prerequisite batches that must be fully healthy.
    pub batch_order: BTreeMap<String, Vec<String>>,
    pub batches: Vec<BatchConfig>,
}

impl GuardConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: GuardConfig = toml::from_str(content)
            .map_err(|e| GuardError::invalid_input(format!("configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GuardError::not_found(format!("configuration file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn batch(&self, name: &str) -> Option<&BatchConfig> {
        self.batches.iter().find(|b| b.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.execution.max_parallel_clusters == 0 {
            return Err(GuardError::invalid_input(
                "execution.max_parallel_clusters must be at least 1",
            ));
        }
        if self.lock.renew_interval >= self.lock.lease {
            return Err(GuardError::invalid_input(format!(
                "lock.renew_interval ({:?}) must be shorter than lock.lease ({:?})",
                self.lock.renew_interval, self.lock.lease
            )));
        }
        for (name, bucket) in &self.rate_limits {
            if bucket.capacity == 0 || bucket.refill_per_second <= 0.0 {
                return Err(GuardError::invalid_input(format!(
                    "rate_limits.{name}: capacity and refill_per_second must be positive"
                )));
            }
        }
        for (batch, prerequisites) in &self.batch_order {
            if prerequisites.iter().any(|p| p == batch) {
                return Err(GuardError::invalid_input(format!(
                    "batch_order.{batch} lists itself as a prerequisite"
                )));
            }
        }
        Ok(())
    }
}
