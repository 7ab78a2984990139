//! Typed facade over the cluster state store.
//!
//! All status changes flow through [`ClusterRegistry::transition_status`],
//! which conditions on both the expected status and the revision observed at
//! read time, so a stale writer can never resurrect an old state (ABA-safe).
//! CAS conflicts are retried at most twice with a refetched record before
//! the step is abandoned.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{GuardError, Result};
use crate::store::{StateStore, VersionedRecord};
use crate::types::{ClusterRecord, ClusterStatus, UpgradeHistoryEntry};

/// Maximum refetch-and-retry rounds after a CAS conflict.
const MAX_CONFLICT_RETRIES: usize = 2;

/// Fields a transition may update atomically alongside the status.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub target_version: Option<String>,
    pub current_version: Option<String>,
    pub mr_url: Option<String>,
    pub history: Option<UpgradeHistoryEntry>,
}

impl RecordPatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_target_version(mut self, version: impl Into<String>) -> Self {
        self.target_version = Some(version.into());
        self
    }

    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = Some(version.into());
        self
    }

    pub fn with_mr_url(mut self, url: impl Into<String>) -> Self {
        self.mr_url = Some(url.into());
        self
    }

    pub fn with_history(mut self, entry: UpgradeHistoryEntry) -> Self {
        self.history = Some(entry);
        self
    }

    fn apply(&self, record: &mut ClusterRecord) {
        if let Some(target) = &self.target_version {
            record.target_version = Some(target.clone());
        }
        if let Some(current) = &self.current_version {
            record.current_version = current.clone();
        }
        if let Some(url) = &self.mr_url {
            record.last_mr_url = Some(url.clone());
        }
        if let Some(entry) = &self.history {
            record.upgrade_history.push(entry.clone());
        }
    }
}

/// The persistent cluster registry.
#[derive(Clone)]
pub struct ClusterRegistry {
    store: Arc<dyn StateStore>,
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, cluster_id: &str) -> Result<VersionedRecord> {
        self.store.get(cluster_id).await
    }

    pub async fn list(
        &self,
        batch_id: Option<&str>,
        status: Option<ClusterStatus>,
    ) -> Result<Vec<ClusterRecord>> {
        let records = self.store.list(batch_id, status).await?;
        debug!(count = records.len(), ?batch_id, "clusters_listed");
        Ok(records.into_iter().map(|v| v.record).collect())
    }

    /// Import a cluster record created from configuration. Fails on a
    /// duplicate id.
    pub async fn register(&self, record: ClusterRecord) -> Result<u64> {
        let cluster_id = record.cluster_id.clone();
        let rev = self.store.put_new(record).await?;
        info!(cluster_id = %cluster_id, "cluster_registered");
        Ok(rev)
    }

    /// Atomically move a cluster from `expected` to `next`, applying
    /// `patch` in the same write.
    ///
    /// Fails with `PreconditionFailed` when the stored status is not
    /// `expected` or the edge is not part of the lifecycle graph; retries
    /// revision conflicts at most twice with a refetched record.
    pub async fn transition_status(
        &self,
        cluster_id: &str,
        expected: ClusterStatus,
        next: ClusterStatus,
        patch: RecordPatch,
    ) -> Result<VersionedRecord> {
        if !expected.can_transition_to(next) {
            return Err(GuardError::precondition(format!(
                "illegal transition {expected} -> {next} for cluster '{cluster_id}'"
            )));
        }

        let mut attempt = 0;
        loop {
            let current = self.store.get(cluster_id).await?;

            if current.record.status != expected {
                return Err(GuardError::precondition(format!(
                    "cluster '{cluster_id}' is {} but transition expected {expected}",
                    current.record.status
                )));
            }

            let mut updated = current.record.clone();
            updated.status = next;
            patch.apply(&mut updated);
            updated.last_updated = Utc::now();

            // target_version must be pinned from the moment the cluster
            // leaves `pending` (I4).
            if expected == ClusterStatus::Pending && updated.target_version.is_none() {
                return Err(GuardError::precondition(format!(
                    "cluster '{cluster_id}' cannot leave {expected} without a target version"
                )));
            }

            match self
                .store
                .compare_and_swap(cluster_id, current.rev, updated.clone())
                .await
            {
                Ok(rev) => {
                    info!(
                        cluster_id = %cluster_id,
                        from = %expected,
                        to = %next,
                        rev,
                        "cluster_status_updated"
                    );
                    return Ok(VersionedRecord {
                        record: updated,
                        rev,
                    });
                }
                Err(GuardError::Conflict(msg)) if attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    warn!(
                        cluster_id = %cluster_id,
                        attempt,
                        "transition_conflict_retry"
                    );
                    debug!(cluster_id = %cluster_id, %msg, "conflict_detail");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Append an audit entry without changing the status.
    pub async fn append_history(
        &self,
        cluster_id: &str,
        entry: UpgradeHistoryEntry,
    ) -> Result<VersionedRecord> {
        let mut attempt = 0;
        loop {
            let current = self.store.get(cluster_id).await?;
            let mut updated = current.record.clone();
            updated.upgrade_history.push(entry.clone());
            updated.last_updated = Utc::now();

            match self
                .store
                .compare_and_swap(cluster_id, current.rev, updated.clone())
                .await
            {
                Ok(rev) => {
                    return Ok(VersionedRecord {
                        record: updated,
                        rev,
                    });
                }
                Err(GuardError::Conflict(_)) if attempt < MAX_CONFLICT_RETRIES => attempt += 1,
                Err(err) => return Err(err),
            }
        }
    }

    /// Verify that every cluster in every prerequisite batch of `batch_id`
    /// is `healthy`. The error names each offending cluster and its status.
    pub async fn validate_batch_prerequisites(
        &self,
        batch_id: &str,
        batch_order: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let Some(prerequisites) = batch_order.get(batch_id) else {
            debug!(batch_id = %batch_id, "batch_has_no_prerequisites");
            return Ok(());
        };

        let mut offenders = Vec::new();
        for prereq in prerequisites {
            let clusters = self.list(Some(prereq), None).await?;
            for cluster in clusters {
                if cluster.status != ClusterStatus::Healthy {
                    offenders.push(format!(
                        "{}/{} ({})",
                        prereq, cluster.cluster_id, cluster.status
                    ));
                }
            }
        }

        if offenders.is_empty() {
            debug!(batch_id = %batch_id, "batch_prerequisites_met");
            Ok(())
        } else {
            Err(GuardError::precondition(format!(
                "batch '{batch_id}' prerequisites not completed: {}",
                offenders.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::MemoryStateStore;
    use crate::testutil::sample_record;
    use crate::types::UpgradeOutcome;

    fn registry_with(records: impl IntoIterator<Item = ClusterRecord>) -> ClusterRegistry {
        ClusterRegistry::new(Arc::new(MemoryStateStore::with_records(records)))
    }

    fn pending_with_target(cluster_id: &str) -> ClusterRecord {
        let mut record = sample_record(cluster_id, "wave-1");
        record.target_version = Some("1.20.0".to_string());
        record
    }

    #[tokio::test]
    async fn legal_transition_updates_status_and_rev() {
        let registry = registry_with([pending_with_target("c1")]);

        let updated = registry
            .transition_status(
                "c1",
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                RecordPatch::none(),
            )
            .await
            .expect("transition");

        assert_eq!(updated.record.status, ClusterStatus::PreCheckRunning);
        assert_eq!(updated.rev, 2);
    }

    #[tokio::test]
    async fn illegal_edge_is_rejected_before_any_write() {
        let registry = registry_with([pending_with_target("c1")]);

        let err = registry
            .transition_status(
                "c1",
                ClusterStatus::Pending,
                ClusterStatus::Healthy,
                RecordPatch::none(),
            )
            .await
            .expect_err("illegal edge");
        assert!(matches!(err, GuardError::PreconditionFailed(_)));

        let unchanged = registry.get("c1").await.expect("get");
        assert_eq!(unchanged.rev, 1);
        assert_eq!(unchanged.record.status, ClusterStatus::Pending);
    }

    #[tokio::test]
    async fn mismatched_expected_status_fails_precondition() {
        let registry = registry_with([pending_with_target("c1")]);

        let err = registry
            .transition_status(
                "c1",
                ClusterStatus::PreCheckPassed,
                ClusterStatus::MrCreated,
                RecordPatch::none(),
            )
            .await
            .expect_err("status mismatch");
        assert!(matches!(err, GuardError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn leaving_pending_without_target_version_is_rejected() {
        let registry = registry_with([sample_record("c1", "wave-1")]);

        let err = registry
            .transition_status(
                "c1",
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                RecordPatch::none(),
            )
            .await
            .expect_err("no target version");
        assert!(matches!(err, GuardError::PreconditionFailed(_)));

        // Supplying the target in the same patch satisfies the invariant.
        registry
            .transition_status(
                "c1",
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                RecordPatch::none().with_target_version("1.20.0"),
            )
            .await
            .expect("transition with target");
    }

    #[tokio::test]
    async fn patch_fields_apply_atomically_with_the_transition() {
        let registry = registry_with([pending_with_target("c1")]);
        registry
            .transition_status(
                "c1",
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                RecordPatch::none(),
            )
            .await
            .expect("to pre-check");
        registry
            .transition_status(
                "c1",
                ClusterStatus::PreCheckRunning,
                ClusterStatus::PreCheckPassed,
                RecordPatch::none(),
            )
            .await
            .expect("to passed");

        let updated = registry
            .transition_status(
                "c1",
                ClusterStatus::PreCheckPassed,
                ClusterStatus::MrCreated,
                RecordPatch::none().with_mr_url("https://git.example/mr/7"),
            )
            .await
            .expect("to mr-created");

        assert_eq!(
            updated.record.last_mr_url.as_deref(),
            Some("https://git.example/mr/7")
        );
    }

    #[tokio::test]
    async fn append_history_preserves_existing_entries() {
        let registry = registry_with([pending_with_target("c1")]);

        registry
            .append_history(
                "c1",
                UpgradeHistoryEntry {
                    version: "1.20.0".to_string(),
                    outcome: UpgradeOutcome::Success,
                    timestamp: Utc::now(),
                    detail: None,
                },
            )
            .await
            .expect("append");

        let record = registry.get("c1").await.expect("get").record;
        assert_eq!(record.upgrade_history.len(), 1);
        assert_eq!(record.upgrade_history[0].version, "1.20.0");
    }

    /// Store wrapper that forces the first N CAS calls to conflict.
    struct FlakyCasStore {
        inner: MemoryStateStore,
        conflicts_left: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for FlakyCasStore {
        async fn get(&self, cluster_id: &str) -> Result<VersionedRecord> {
            self.inner.get(cluster_id).await
        }

        async fn list(
            &self,
            batch_id: Option<&str>,
            status: Option<ClusterStatus>,
        ) -> Result<Vec<VersionedRecord>> {
            self.inner.list(batch_id, status).await
        }

        async fn put_new(&self, record: ClusterRecord) -> Result<u64> {
            self.inner.put_new(record).await
        }

        async fn compare_and_swap(
            &self,
            cluster_id: &str,
            expected_rev: u64,
            record: ClusterRecord,
        ) -> Result<u64> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GuardError::conflict("injected conflict"));
            }
            self.inner.compare_and_swap(cluster_id, expected_rev, record).await
        }

        async fn delete(&self, cluster_id: &str) -> Result<()> {
            self.inner.delete(cluster_id).await
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_with_refetch_up_to_twice() {
        let store = Arc::new(FlakyCasStore {
            inner: MemoryStateStore::with_records([pending_with_target("c1")]),
            conflicts_left: AtomicUsize::new(2),
        });
        let registry = ClusterRegistry::new(store);

        let updated = registry
            .transition_status(
                "c1",
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                RecordPatch::none(),
            )
            .await
            .expect("succeeds on third attempt");
        assert_eq!(updated.record.status, ClusterStatus::PreCheckRunning);
    }

    #[tokio::test]
    async fn persistent_conflicts_abort_the_step() {
        let store = Arc::new(FlakyCasStore {
            inner: MemoryStateStore::with_records([pending_with_target("c1")]),
            conflicts_left: AtomicUsize::new(usize::MAX),
        });
        let registry = ClusterRegistry::new(store);

        let err = registry
            .transition_status(
                "c1",
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                RecordPatch::none(),
            )
            .await
            .expect_err("gives up after retries");
        assert!(matches!(err, GuardError::Conflict(_)));
    }

    #[tokio::test]
    async fn prerequisite_gate_passes_when_all_prereq_clusters_healthy() {
        let mut healthy = sample_record("c0", "wave-0");
        healthy.status = ClusterStatus::Healthy;
        let registry = registry_with([healthy, sample_record("c1", "wave-1")]);

        let order = BTreeMap::from([("wave-1".to_string(), vec!["wave-0".to_string()])]);
        registry
            .validate_batch_prerequisites("wave-1", &order)
            .await
            .expect("prerequisites met");
    }

    #[tokio::test]
    async fn prerequisite_gate_names_offending_clusters() {
        let mut rolled_back = sample_record("c0", "wave-0");
        rolled_back.status = ClusterStatus::FailedUpgradeRolledBack;
        let registry = registry_with([rolled_back, sample_record("c1", "wave-1")]);

        let order = BTreeMap::from([("wave-1".to_string(), vec!["wave-0".to_string()])]);
        let err = registry
            .validate_batch_prerequisites("wave-1", &order)
            .await
            .expect_err("unhealthy prerequisite");

        let msg = err.to_string();
        assert!(msg.contains("c0"), "diagnostic should name the cluster: {msg}");
        assert!(msg.contains("failed-upgrade-rolled-back"));
    }

    #[tokio::test]
    async fn no_prerequisites_means_gate_is_open() {
        let registry = registry_with([sample_record("c1", "wave-1")]);
        registry
            .validate_batch_prerequisites("wave-1", &BTreeMap::new())
            .await
            .expect("no prerequisites configured");
    }
}
