use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GuardError};

/// Lifecycle state of a managed cluster.
///
/// Serialised with the kebab-case wire strings the registry stores, e.g.
/// `pre-check-running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterStatus {
    Pending,
    PreCheckRunning,
    PreCheckPassed,
    PreCheckFailed,
    MrCreated,
    Upgrading,
    PostCheckRunning,
    Healthy,
    RollbackRequired,
    FailedUpgradeRolledBack,
}

impl ClusterStatus {
    /// Statuses that mean an orchestrator is actively driving the cluster.
    /// At most one process may hold the cluster in this set at a time.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ClusterStatus::PreCheckRunning
                | ClusterStatus::Upgrading
                | ClusterStatus::PostCheckRunning
        )
    }

    /// Terminal statuses for an upgrade attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClusterStatus::Healthy
                | ClusterStatus::PreCheckFailed
                | ClusterStatus::FailedUpgradeRolledBack
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph. Any other
    /// transition is rejected by the registry.
    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        matches!(
            (self, next),
            (Pending, PreCheckRunning)
                | (PreCheckRunning, PreCheckPassed)
                | (PreCheckRunning, PreCheckFailed)
                | (PreCheckPassed, MrCreated)
                | (MrCreated, Upgrading)
                | (Upgrading, PostCheckRunning)
                | (PostCheckRunning, Healthy)
                | (PostCheckRunning, RollbackRequired)
                | (RollbackRequired, FailedUpgradeRolledBack)
                // A healthy cluster may be re-armed for the next wave.
                | (Healthy, Pending)
        )
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterStatus::Pending => "pending",
            ClusterStatus::PreCheckRunning => "pre-check-running",
            ClusterStatus::PreCheckPassed => "pre-check-passed",
            ClusterStatus::PreCheckFailed => "pre-check-failed",
            ClusterStatus::MrCreated => "mr-created",
            ClusterStatus::Upgrading => "upgrading",
            ClusterStatus::PostCheckRunning => "post-check-running",
            ClusterStatus::Healthy => "healthy",
            ClusterStatus::RollbackRequired => "rollback-required",
            ClusterStatus::FailedUpgradeRolledBack => "failed-upgrade-rolled-back",
        };
        f.write_str(s)
    }
}

/// Outcome recorded for a finished upgrade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Success,
    Failed,
    PreCheckFailed,
}

/// Append-only audit entry on a cluster record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeHistoryEntry {
    pub version: String,
    pub outcome: UpgradeOutcome,
    pub timestamp: DateTime<Utc>,
    /// Concatenated violations or the failing error kind, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Telemetry tags attached to every metrics query for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTags {
    pub cluster: String,
    #[serde(default = "default_mesh_service")]
    pub service: String,
    pub env: String,
}

fn default_mesh_service() -> String {
    "istio-system".to_string()
}

impl MetricTags {
    /// Flat map form handed to the metrics provider.
    pub fn as_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cluster".to_string(), self.cluster.clone()),
            ("service".to_string(), self.service.clone()),
            ("env".to_string(), self.env.clone()),
        ])
    }
}

/// Free-form cluster metadata carried alongside the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_id: Option<String>,
    #[serde(default)]
    pub multi_cluster: bool,
}

/// The unit of persistent state: one managed cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Globally unique identifier; primary key in the registry.
    pub cluster_id: String,
    /// Batch the cluster is upgraded with.
    pub batch_id: String,
    /// Environment tag: dev, staging, production, ...
    pub environment: String,
    pub region: String,
    /// Desired-state repository the reconciler watches.
    pub gitops_repo: String,
    /// Path of the desired-state document inside the repo.
    pub config_path: String,
    /// Opaque reference used to obtain cluster-scoped credentials.
    pub cloud_role_ref: String,
    pub current_version: String,
    /// Set when leaving `pending`; kept until a terminal status is reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    pub metric_tags: MetricTags,
    pub team: String,
    /// Handle the upgrade merge request is assigned to.
    pub reviewer_handle: String,
    /// URL of the most recent merge request opened for this cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mr_url: Option<String>,
    #[serde(default = "default_status")]
    pub status: ClusterStatus,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub upgrade_history: Vec<UpgradeHistoryEntry>,
    #[serde(default)]
    pub metadata: ClusterMetadata,
}

fn default_status() -> ClusterStatus {
    ClusterStatus::Pending
}

/// Result of a single pre-upgrade health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn passed(check_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check_name: check_name.into(),
            passed: true,
            message: message.into(),
            metrics: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(check_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check_name: check_name.into(),
            passed: false,
            message: message.into(),
            metrics: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of a single post-upgrade validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub cluster_id: String,
    pub validator_name: String,
    pub passed: bool,
    pub violations: Vec<String>,
    /// Metric values the validator looked at; `None` marks a failed query.
    #[serde(default)]
    pub metrics: BTreeMap<String, Option<f64>>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated metric values captured over a time window.
///
/// A `None` value means the query failed; it is carried through validation
/// as "unknown" and is never treated as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub tags: BTreeMap<String, String>,
}

impl MetricsSnapshot {
    /// The value for `name`, flattening "absent" and "query failed" to `None`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }

    /// Metric names whose query failed during capture.
    pub fn missing(&self) -> Vec<&str> {
        self.metrics
            .iter()
            .filter_map(|(k, v)| v.is_none().then_some(k.as_str()))
            .collect()
    }
}

/// Thresholds the post-upgrade validators compare against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationThresholds {
    /// Maximum acceptable p95 latency increase from baseline, in percent.
    pub latency_p95_increase_percent: f64,
    /// Maximum acceptable p99 latency increase from baseline, in percent.
    pub latency_p99_increase_percent: f64,
    /// Absolute ceiling on the post-upgrade 5xx rate.
    pub error_rate_max: f64,
    /// Maximum acceptable ratio of current over baseline 5xx rate.
    pub error_rate_increase_ratio: f64,
    /// Maximum acceptable drop in request volume, in percent.
    pub request_drop_percent: f64,
    /// Minimum request volume for a comparison to be meaningful.
    pub min_request_volume: u64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            latency_p95_increase_percent: 10.0,
            latency_p99_increase_percent: 15.0,
            error_rate_max: 0.001,
            error_rate_increase_ratio: 2.0,
            request_drop_percent: 20.0,
            min_request_volume: 1000,
        }
    }
}

/// Whether `path` is a well-formed dotted field path.
///
/// Rejected: empty paths, leading/trailing dots, consecutive dots, and
/// components with surrounding whitespace.
pub fn is_valid_field_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('.') || path.ends_with('.') || path.contains("..") {
        return false;
    }
    path.split('.').all(|part| !part.is_empty() && part.trim() == part)
}

/// One field edit inside a desired-state document.
///
/// Construction validates the dotted path, so an invalid instance cannot
/// exist. Deserialization goes through the same validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFieldUpdate")]
pub struct FieldUpdate {
    path: String,
    value: serde_yaml::Value,
}

#[derive(Deserialize)]
struct RawFieldUpdate {
    path: String,
    value: serde_yaml::Value,
}

impl TryFrom<RawFieldUpdate> for FieldUpdate {
    type Error = GuardError;

    fn try_from(raw: RawFieldUpdate) -> Result<Self, Self::Error> {
        FieldUpdate::new(raw.path, raw.value)
    }
}

impl FieldUpdate {
    pub fn new(
        path: impl Into<String>,
        value: impl Into<serde_yaml::Value>,
    ) -> Result<Self, GuardError> {
        let path = path.into();
        if !is_valid_field_path(&path) {
            return Err(GuardError::invalid_input(format!(
                "invalid field path '{path}': paths must not contain consecutive dots, \
                 leading/trailing dots, or empty parts"
            )));
        }
        Ok(Self {
            path,
            value: value.into(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('.')
    }

    pub fn value(&self) -> &serde_yaml::Value {
        &self.value
    }
}

/// Specification of the field edits one upgrade applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawUpgradeSpec")]
pub struct UpgradeSpec {
    version: String,
    updates: Vec<FieldUpdate>,
}

#[derive(Deserialize)]
struct RawUpgradeSpec {
    version: String,
    updates: Vec<FieldUpdate>,
}

impl TryFrom<RawUpgradeSpec> for UpgradeSpec {
    type Error = GuardError;

    fn try_from(raw: RawUpgradeSpec) -> Result<Self, Self::Error> {
        UpgradeSpec::new(raw.version, raw.updates)
    }
}

impl UpgradeSpec {
    pub fn new(version: impl Into<String>, updates: Vec<FieldUpdate>) -> Result<Self, GuardError> {
        if updates.is_empty() {
            return Err(GuardError::invalid_input(
                "upgrade spec must contain at least one field update",
            ));
        }
        Ok(Self {
            version: version.into(),
            updates,
        })
    }

    /// The conventional spec for a mesh version bump at `version_path`.
    pub fn version_bump(version: &str, version_path: &str) -> Result<Self, GuardError> {
        let clean = version.trim_start_matches('v');
        Self::new(
            clean,
            vec![FieldUpdate::new(
                version_path,
                serde_yaml::Value::String(clean.to_string()),
            )?],
        )
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn updates(&self) -> &[FieldUpdate] {
        &self.updates
    }
}

/// Terminal report for one cluster in a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterOutcome {
    pub cluster_id: String,
    pub status: ClusterStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ClusterOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ClusterStatus::Healthy
    }
}

/// Aggregated report for a whole batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub clusters: Vec<ClusterOutcome>,
}

impl BatchOutcome {
    pub fn from_clusters(batch_id: impl Into<String>, clusters: Vec<ClusterOutcome>) -> Self {
        let succeeded = clusters.iter().filter(|c| c.succeeded()).count();
        Self {
            batch_id: batch_id.into(),
            attempted: clusters.len(),
            succeeded,
            failed: clusters.len() - succeeded,
            clusters,
        }
    }

    /// True iff every attempted cluster reached `healthy`.
    pub fn all_healthy(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_record;

    #[test]
    fn status_serializes_with_kebab_case_wire_strings() {
        let json = serde_json::to_string(&ClusterStatus::PreCheckRunning).expect("serialize");
        assert_eq!(json, "\"pre-check-running\"");

        let parsed: ClusterStatus =
            serde_json::from_str("\"failed-upgrade-rolled-back\"").expect("deserialize");
        assert_eq!(parsed, ClusterStatus::FailedUpgradeRolledBack);
    }

    #[test]
    fn transition_graph_accepts_only_lifecycle_edges() {
        use ClusterStatus::*;

        let legal = [
            (Pending, PreCheckRunning),
            (PreCheckRunning, PreCheckPassed),
            (PreCheckRunning, PreCheckFailed),
            (PreCheckPassed, MrCreated),
            (MrCreated, Upgrading),
            (Upgrading, PostCheckRunning),
            (PostCheckRunning, Healthy),
            (PostCheckRunning, RollbackRequired),
            (RollbackRequired, FailedUpgradeRolledBack),
            (Healthy, Pending),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{from} -> {to} should be legal");
        }

        let illegal = [
            (Pending, Upgrading),
            (Pending, Healthy),
            (PreCheckFailed, PreCheckRunning),
            (MrCreated, PostCheckRunning),
            (Upgrading, Healthy),
            (RollbackRequired, Healthy),
            (FailedUpgradeRolledBack, Pending),
            (Healthy, Upgrading),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
        }
    }

    #[test]
    fn active_set_matches_exclusive_holder_invariant() {
        assert!(ClusterStatus::PreCheckRunning.is_active());
        assert!(ClusterStatus::Upgrading.is_active());
        assert!(ClusterStatus::PostCheckRunning.is_active());
        assert!(!ClusterStatus::Pending.is_active());
        assert!(!ClusterStatus::MrCreated.is_active());
        assert!(!ClusterStatus::Healthy.is_active());
    }

    #[test]
    fn record_roundtrips_json() {
        let mut record = sample_record("prod-eu-1", "wave-1");
        record.target_version = Some("1.20.0".to_string());
        record.upgrade_history.push(UpgradeHistoryEntry {
            version: "1.19.3".to_string(),
            outcome: UpgradeOutcome::Success,
            timestamp: Utc::now(),
            detail: None,
        });

        let json = serde_json::to_string_pretty(&record).expect("serialize");
        let parsed: ClusterRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, record);
    }

    #[test]
    fn snapshot_flattens_missing_and_failed_queries() {
        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            metrics: BTreeMap::from([
                ("latency.p95".to_string(), Some(104.2)),
                ("error.rate".to_string(), None),
            ]),
            tags: BTreeMap::new(),
        };

        assert_eq!(snapshot.value("latency.p95"), Some(104.2));
        assert_eq!(snapshot.value("error.rate"), None);
        assert_eq!(snapshot.value("absent"), None);
        assert_eq!(snapshot.missing(), vec!["error.rate"]);
    }

    #[test]
    fn field_path_validation_rejects_malformed_paths() {
        for bad in ["", ".", "spec.", ".spec", "spec..version", "a. b", "a .b"] {
            assert!(!is_valid_field_path(bad), "'{bad}' should be rejected");
            assert!(FieldUpdate::new(bad, serde_yaml::Value::Null).is_err());
        }

        for good in ["version", "spec.chart.spec.version", "a.b.c", "with space.ok"] {
            assert!(is_valid_field_path(good), "'{good}' should be accepted");
        }
    }

    #[test]
    fn upgrade_spec_rejects_invalid_paths_at_deserialization() {
        let yaml = r#"
version: "1.20.0"
updates:
  - path: "spec..version"
    value: "1.20.0"
"#;
        let result: Result<UpgradeSpec, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn upgrade_spec_requires_at_least_one_update() {
        let result = UpgradeSpec::new("1.20.0", Vec::new());
        assert!(matches!(result, Err(GuardError::InvalidInput(_))));
    }

    #[test]
    fn version_bump_strips_v_prefix() {
        let spec = UpgradeSpec::version_bump("v1.20.0", "spec.chart.spec.version").expect("spec");
        assert_eq!(spec.version(), "1.20.0");
        assert_eq!(spec.updates().len(), 1);
        assert_eq!(spec.updates()[0].path(), "spec.chart.spec.version");
    }

    #[test]
    fn batch_outcome_counts_mixed_results() {
        let outcome = BatchOutcome::from_clusters(
            "wave-1",
            vec![
                ClusterOutcome {
                    cluster_id: "a".to_string(),
                    status: ClusterStatus::Healthy,
                    message: "validation passed".to_string(),
                    mr_url: Some("https://git.example/mr/1".to_string()),
                    error_kind: None,
                },
                ClusterOutcome {
                    cluster_id: "b".to_string(),
                    status: ClusterStatus::FailedUpgradeRolledBack,
                    message: "p95 regression".to_string(),
                    mr_url: Some("https://git.example/mr/2".to_string()),
                    error_kind: None,
                },
            ],
        );

        assert_eq!(outcome.attempted, 2);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.all_healthy());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any dot-joined sequence of trimmed non-empty components is a
            // valid path, and the segment iterator returns it faithfully.
            #[test]
            fn joined_components_roundtrip(
                parts in proptest::collection::vec("[a-zA-Z0-9_-]{1,12}", 1..6)
            ) {
                let path = parts.join(".");
                prop_assert!(is_valid_field_path(&path));

                let update = FieldUpdate::new(path.clone(), serde_yaml::Value::Null)
                    .expect("valid path");
                let segments: Vec<&str> = update.segments().collect();
                prop_assert_eq!(segments, parts.iter().map(String::as_str).collect::<Vec<_>>());
            }

            // Doubling any dot always invalidates the path.
            #[test]
            fn consecutive_dots_always_rejected(
                parts in proptest::collection::vec("[a-z]{1,8}", 2..5),
                split in 1usize..4,
            ) {
                let split = split.min(parts.len() - 1);
                let path = format!("{}..{}", parts[..split].join("."), parts[split..].join("."));
                prop_assert!(!is_valid_field_path(&path));
            }
        }
    }
}
