//! In-memory operation metrics.
//!
//! Every orchestrator operation records its type, status, and duration here.
//! Each record is also emitted as a structured tracing event so an external
//! collector can scrape them from the logs; the in-memory log feeds the
//! aggregations surfaced at the end of a batch run.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorKind, GuardError};

/// Operations tracked across an upgrade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    PreCheck,
    MrCreation,
    PostCheck,
    Validation,
    Rollback,
    ClusterUpgrade,
    BatchUpgrade,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationType::PreCheck => "pre_check",
            OperationType::MrCreation => "mr_creation",
            OperationType::PostCheck => "post_check",
            OperationType::Validation => "validation",
            OperationType::Rollback => "rollback",
            OperationType::ClusterUpgrade => "cluster_upgrade",
            OperationType::BatchUpgrade => "batch_upgrade",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failure,
    Timeout,
    Error,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationStatus::Success => "success",
            OperationStatus::Failure => "failure",
            OperationStatus::Timeout => "timeout",
            OperationStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetric {
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Session-scoped metrics log with simple aggregations.
#[derive(Default)]
pub struct OperationMetrics {
    metrics: Mutex<Vec<OperationMetric>>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: OperationMetric) {
        info!(
            operation_type = %metric.operation_type,
            status = %metric.status,
            duration_seconds = metric.duration_seconds,
            cluster_id = metric.cluster_id.as_deref(),
            batch_id = metric.batch_id.as_deref(),
            error_kind = metric.error_kind.map(|k| k.to_string()),
            "operation_metric"
        );
        self.metrics.lock().expect("metrics mutex poisoned").push(metric);
    }

    /// Open a timing span; completing it records the metric.
    pub fn timed(
        &self,
        operation_type: OperationType,
        cluster_id: Option<&str>,
        batch_id: Option<&str>,
    ) -> TimedOperation<'_> {
        TimedOperation {
            collector: self,
            operation_type,
            cluster_id: cluster_id.map(str::to_string),
            batch_id: batch_id.map(str::to_string),
            metadata: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    fn filtered(
        &self,
        operation_type: Option<OperationType>,
        batch_id: Option<&str>,
    ) -> Vec<OperationMetric> {
        self.metrics
            .lock()
            .expect("metrics mutex poisoned")
            .iter()
            .filter(|m| operation_type.is_none_or(|t| m.operation_type == t))
            .filter(|m| batch_id.is_none_or(|b| m.batch_id.as_deref() == Some(b)))
            .cloned()
            .collect()
    }

    /// Share of successful operations, as a percentage. Zero when nothing
    /// matched the filter.
    pub fn success_rate(
        &self,
        operation_type: Option<OperationType>,
        batch_id: Option<&str>,
    ) -> f64 {
        let metrics = self.filtered(operation_type, batch_id);
        if metrics.is_empty() {
            return 0.0;
        }
        let successes = metrics
            .iter()
            .filter(|m| m.status == OperationStatus::Success)
            .count();
        (successes as f64 / metrics.len() as f64) * 100.0
    }

    pub fn average_duration(
        &self,
        operation_type: Option<OperationType>,
        batch_id: Option<&str>,
    ) -> Duration {
        let metrics = self.filtered(operation_type, batch_id);
        if metrics.is_empty() {
            return Duration::ZERO;
        }
        let total: f64 = metrics.iter().map(|m| m.duration_seconds).sum();
        Duration::from_secs_f64(total / metrics.len() as f64)
    }

    /// Counts of non-success operations grouped by error kind.
    pub fn error_breakdown(
        &self,
        operation_type: Option<OperationType>,
        batch_id: Option<&str>,
    ) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for metric in self.filtered(operation_type, batch_id) {
            if metric.status != OperationStatus::Success {
                if let Some(kind) = metric.error_kind {
                    *counts.entry(kind.to_string()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Operation counts grouped by type then status.
    pub fn operation_counts(
        &self,
        batch_id: Option<&str>,
    ) -> BTreeMap<String, BTreeMap<String, usize>> {
        let mut counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for metric in self.filtered(None, batch_id) {
            *counts
                .entry(metric.operation_type.to_string())
                .or_default()
                .entry(metric.status.to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().expect("metrics mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open timing span. Completing it stamps the duration and derives the
/// status from the observed error, unless marked explicitly.
pub struct TimedOperation<'a> {
    collector: &'a OperationMetrics,
    operation_type: OperationType,
    cluster_id: Option<String>,
    batch_id: Option<String>,
    metadata: BTreeMap<String, String>,
    started: Instant,
}

impl TimedOperation<'_> {
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The operation finished and did what it set out to do.
    pub fn complete_success(self) {
        self.finish(OperationStatus::Success, None);
    }

    /// The operation finished but reported a negative outcome (for example,
    /// a failed verdict).
    pub fn complete_failure(self) {
        self.finish(OperationStatus::Failure, None);
    }

    /// The operation died on an error; the status is derived from its kind.
    pub fn complete_error(self, err: &GuardError) {
        let status = match err.kind() {
            ErrorKind::Timeout => OperationStatus::Timeout,
            _ => OperationStatus::Error,
        };
        self.finish(status, Some(err.kind()));
    }

    /// Explicit status override.
    pub fn complete_with(self, status: OperationStatus, error_kind: Option<ErrorKind>) {
        self.finish(status, error_kind);
    }

    fn finish(self, status: OperationStatus, error_kind: Option<ErrorKind>) {
        let metric = OperationMetric {
            operation_type: self.operation_type,
            status,
            duration_seconds: self.started.elapsed().as_secs_f64(),
            cluster_id: self.cluster_id,
            batch_id: self.batch_id,
            error_kind,
            metadata: self.metadata,
            timestamp: Utc::now(),
        };
        self.collector.record(metric);
    }
}
