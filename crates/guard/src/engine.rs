//! Per-cluster upgrade state machine.
//!
//! One invocation drives one cluster through the lifecycle: acquire the
//! cluster lock, pre-check, capture baseline telemetry, propose the upgrade
//! merge request, observe the merge and the reconciler's rollout, validate
//! against the baseline, and finish healthy or rolled back. Every transition
//! is committed through the registry's conditional-write path before the
//! next step begins, so a crashed or raced orchestrator can never corrupt
//! the record.
//!
//! Cancellation is observed at every suspension point. The lock is released
//! on every exit path; if the process dies without releasing, lease expiry
//! plus fencing guarantees the next orchestrator can take over safely.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checks::{CheckContext, CheckRegistry, CheckRunner};
use crate::config::GuardConfig;
use crate::error::{ErrorKind, GuardError, Result};
use crate::gitops::ChangeProducer;
use crate::lock::{AcquireWait, LockManager};
use crate::metrics::{OperationMetrics, OperationType};
use crate::providers::{
    CloudProvider, GitOpsProvider, KubernetesConnector, KubernetesProvider, MergeRequestState,
    MetricsProvider,
};
use crate::registry::{ClusterRegistry, RecordPatch};
use crate::types::{
    ClusterOutcome, ClusterRecord, ClusterStatus, UpgradeHistoryEntry, UpgradeOutcome,
    UpgradeSpec,
};
use crate::validation::{ValidationOrchestrator, ValidatorRegistry};

const MERGE_POLL_INTERVAL: Duration = Duration::from_secs(15);
const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const SOAK_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Everything the engine talks to. Constructed once at startup and shared
/// across cluster workers.
pub struct UpgradeDeps {
    pub registry: ClusterRegistry,
    pub locks: LockManager,
    pub checks: Arc<CheckRegistry>,
    pub validators: Arc<ValidatorRegistry>,
    pub changes: Arc<ChangeProducer>,
    pub connector: Arc<dyn KubernetesConnector>,
    pub cloud: Arc<dyn CloudProvider>,
    pub metrics: Arc<dyn MetricsProvider>,
    pub gitops: Arc<dyn GitOpsProvider>,
    pub operation_metrics: Arc<OperationMetrics>,
}

/// Drives a single cluster through the upgrade lifecycle.
pub struct UpgradeEngine {
    registry: ClusterRegistry,
    locks: LockManager,
    checks: Arc<CheckRegistry>,
    check_runner: CheckRunner,
    validators: Arc<ValidatorRegistry>,
    validation: ValidationOrchestrator,
    changes: Arc<ChangeProducer>,
    connector: Arc<dyn KubernetesConnector>,
    cloud: Arc<dyn CloudProvider>,
    metrics: Arc<dyn MetricsProvider>,
    gitops: Arc<dyn GitOpsProvider>,
    operation_metrics: Arc<OperationMetrics>,
    config: Arc<GuardConfig>,
}

fn ensure_live(work: &CancellationToken) -> Result<()> {
    if work.is_cancelled() {
        Err(GuardError::cancelled("upgrade work was cancelled"))
    } else {
        Ok(())
    }
}

/// Await `fut`, aborting with `Cancelled` if the work token fires first.
async fn cancellable<T>(
    work: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = work.cancelled() => Err(GuardError::cancelled("cancelled at suspension point")),
        value = fut => Ok(value),
    }
}

impl UpgradeEngine {
    pub fn new(deps: UpgradeDeps, config: Arc<GuardConfig>) -> Self {
        let check_runner = CheckRunner::new(config.execution.fail_fast_checks);
        let validation = ValidationOrchestrator::new(deps.metrics.clone());
        Self {
            registry: deps.registry,
            locks: deps.locks,
            checks: deps.checks,
            check_runner,
            validators: deps.validators,
            validation,
            changes: deps.changes,
            connector: deps.connector,
            cloud: deps.cloud,
            metrics: deps.metrics,
            gitops: deps.gitops,
            operation_metrics: deps.operation_metrics,
            config,
        }
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Run the full lifecycle for one cluster. Never panics the caller:
    /// every failure is folded into the returned outcome.
    pub async fn run_cluster(
        &self,
        cluster_id: &str,
        target_version: &str,
        cancel: &CancellationToken,
    ) -> ClusterOutcome {
        let versioned = match self.registry.get(cluster_id).await {
            Ok(v) => v,
            Err(err) => {
                return outcome_with_error(cluster_id, ClusterStatus::Pending, &err);
            }
        };
        let record = versioned.record;

        // A restarted orchestrator lands here for clusters that already
        // progressed; clean abandonment, no side effects.
        if record.status != ClusterStatus::Pending {
            debug!(cluster_id = %cluster_id, status = %record.status, "cluster_not_pending_skipping");
            return outcome(
                cluster_id,
                record.status,
                format!("cluster is {}; nothing to do", record.status),
                record.last_mr_url,
                None,
            );
        }

        let lease = self.config.lock.lease;
        let handle = match self
            .locks
            .acquire(cluster_id, lease, AcquireWait::NoWait)
            .await
        {
            Ok(handle) => handle,
            Err(GuardError::LockHeld(msg)) => {
                info!(cluster_id = %cluster_id, "cluster_locked_by_peer");
                return outcome(
                    cluster_id,
                    record.status,
                    format!("skipped: {msg}"),
                    None,
                    None,
                );
            }
            Err(err) => return outcome_with_error(cluster_id, record.status, &err),
        };

        // Auto-renew keeps the lease alive; losing it cancels `work`, which
        // stops all in-flight provider calls for this cluster.
        let work = cancel.child_token();
        let stop_renew = CancellationToken::new();
        let renew_task = self.locks.spawn_auto_renew(
            handle.clone(),
            lease,
            self.config.lock.renew_interval,
            stop_renew.clone(),
            work.clone(),
        );

        let span = self.operation_metrics.timed(
            OperationType::ClusterUpgrade,
            Some(cluster_id),
            Some(&record.batch_id),
        );

        let batch_id = record.batch_id.clone();
        let result = self.drive(record, target_version, &work).await;

        stop_renew.cancel();
        let _ = renew_task.await;
        if let Err(err) = self.locks.release(&handle).await {
            warn!(cluster_id = %cluster_id, error = %err, "lock_release_failed");
        }

        match result {
            Ok(outcome) => {
                if outcome.succeeded() {
                    span.complete_success();
                } else {
                    span.complete_failure();
                }
                outcome
            }
            Err(err) => {
                span.complete_error(&err);
                warn!(
                    cluster_id = %cluster_id,
                    batch_id = %batch_id,
                    error = %err,
                    "cluster_upgrade_aborted"
                );
                let status = match self.registry.get(cluster_id).await {
                    Ok(v) => v.record.status,
                    Err(_) => ClusterStatus::Pending,
                };
                outcome_with_error(cluster_id, status, &err)
            }
        }
    }

    async fn drive(
        &self,
        record: ClusterRecord,
        target_version: &str,
        work: &CancellationToken,
    ) -> Result<ClusterOutcome> {
        let cluster_id = record.cluster_id.clone();
        let target = target_version.trim_start_matches('v').to_string();
        ensure_live(work)?;

        // PENDING -> PRE_CHECK_RUNNING pins the target version (I4). A
        // precondition failure means a peer won the race; abandon cleanly.
        let versioned = match self
            .registry
            .transition_status(
                &cluster_id,
                ClusterStatus::Pending,
                ClusterStatus::PreCheckRunning,
                RecordPatch::none().with_target_version(&target),
            )
            .await
        {
            Ok(v) => v,
            Err(GuardError::PreconditionFailed(msg)) => {
                info!(cluster_id = %cluster_id, "cluster_already_claimed");
                let status = self.registry.get(&cluster_id).await?.record.status;
                return Ok(outcome(
                    &cluster_id,
                    status,
                    format!("skipped: {msg}"),
                    None,
                    None,
                ));
            }
            Err(err) => return Err(err),
        };
        let mut record = versioned.record;

        // Per-cluster access; owned by this worker while the lock is held.
        let ctx = match self.check_context(&record).await {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(cluster_id = %cluster_id, error = %err, "cluster_access_failed");
                self.registry
                    .transition_status(
                        &cluster_id,
                        ClusterStatus::PreCheckRunning,
                        ClusterStatus::PreCheckFailed,
                        RecordPatch::none(),
                    )
                    .await?;
                return Ok(outcome(
                    &cluster_id,
                    ClusterStatus::PreCheckFailed,
                    format!("cluster access failed: {err}"),
                    None,
                    Some(err.kind()),
                ));
            }
        };

        // Pre-checks.
        let span = self.operation_metrics.timed(
            OperationType::PreCheck,
            Some(&cluster_id),
            Some(&record.batch_id),
        );
        let run = cancellable(work, self.check_runner.run(&self.checks, &record, &ctx)).await?;
        if !run.passed {
            span.complete_failure();
            let failures = run.failure_messages().join("; ");
            self.registry
                .transition_status(
                    &cluster_id,
                    ClusterStatus::PreCheckRunning,
                    ClusterStatus::PreCheckFailed,
                    RecordPatch::none(),
                )
                .await?;
            return Ok(outcome(
                &cluster_id,
                ClusterStatus::PreCheckFailed,
                format!("pre-checks failed: {failures}"),
                None,
                None,
            ));
        }
        span.complete_success();
        ensure_live(work)?;

        // Baseline telemetry, held in memory only, captured right before
        // the change is proposed.
        let window = self.config.execution.snapshot_window;
        let baseline = cancellable(
            work,
            self.validation
                .capture_snapshot(&self.validators, &record, window),
        )
        .await?;

        record = self
            .registry
            .transition_status(
                &cluster_id,
                ClusterStatus::PreCheckRunning,
                ClusterStatus::PreCheckPassed,
                RecordPatch::none(),
            )
            .await?
            .record;
        ensure_live(work)?;

        // Propose the upgrade.
        let mr_span = self.operation_metrics.timed(
            OperationType::MrCreation,
            Some(&cluster_id),
            Some(&record.batch_id),
        );
        let spec = UpgradeSpec::version_bump(&target, &self.changes.settings().version_path)?;
        let mr = match cancellable(work, self.changes.open_upgrade_mr(&record, &spec)).await? {
            Ok(mr) => {
                mr_span.complete_success();
                mr
            }
            Err(err) => {
                mr_span.complete_error(&err);
                return Err(err);
            }
        };

        record = self
            .registry
            .transition_status(
                &cluster_id,
                ClusterStatus::PreCheckPassed,
                ClusterStatus::MrCreated,
                RecordPatch::none().with_mr_url(&mr.web_url),
            )
            .await?
            .record;

        // Observe the merge. Nothing was applied yet, so a timeout or a
        // closed MR abandons the attempt without rollback.
        match self.wait_for_merge(&record.gitops_repo, mr.id, work).await {
            Ok(()) => {}
            Err(err @ (GuardError::Timeout(_) | GuardError::PreconditionFailed(_))) => {
                return Ok(outcome(
                    &cluster_id,
                    ClusterStatus::MrCreated,
                    format!("no change applied: {err}"),
                    Some(mr.web_url),
                    Some(err.kind()),
                ));
            }
            Err(err) => return Err(err),
        }

        // The merge is the signal that the upgrade is now rolling out.
        self.registry
            .transition_status(
                &cluster_id,
                ClusterStatus::MrCreated,
                ClusterStatus::Upgrading,
                RecordPatch::none(),
            )
            .await?;

        // Wait for the reconciler to converge the control plane, then hold
        // the stabilisation window. A convergence timeout is treated as a
        // failed verdict and rolls back.
        let converged = match self.wait_for_rollout(&ctx.kubernetes, work).await {
            Ok(()) => true,
            Err(GuardError::Timeout(msg)) => {
                warn!(cluster_id = %cluster_id, %msg, "rollout_convergence_timeout");
                false
            }
            Err(err) => return Err(err),
        };

        record = self
            .registry
            .transition_status(
                &cluster_id,
                ClusterStatus::Upgrading,
                ClusterStatus::PostCheckRunning,
                RecordPatch::none(),
            )
            .await?
            .record;

        // Post-upgrade verdict.
        let post_span = self.operation_metrics.timed(
            OperationType::PostCheck,
            Some(&cluster_id),
            Some(&record.batch_id),
        );
        let (passed, violations, failed_metrics) = if converged {
            let current = cancellable(
                work,
                self.validation
                    .capture_snapshot(&self.validators, &record, window),
            )
            .await?;
            let validation_span = self.operation_metrics.timed(
                OperationType::Validation,
                Some(&cluster_id),
                Some(&record.batch_id),
            );
            let run = cancellable(
                work,
                self.validation.validate(
                    &self.validators,
                    &record,
                    &baseline,
                    &current,
                    &self.config.thresholds,
                ),
            )
            .await?;
            if run.passed {
                validation_span.complete_success();
            } else {
                validation_span.complete_failure();
            }
            (run.passed, run.violations(), run.failed_metrics())
        } else {
            (
                false,
                vec![format!(
                    "control plane did not converge within {}",
                    humantime::format_duration(self.config.execution.rollout_wait)
                )],
                BTreeMap::new(),
            )
        };

        if passed {
            post_span.complete_success();
            let entry = UpgradeHistoryEntry {
                version: target.clone(),
                outcome: UpgradeOutcome::Success,
                timestamp: Utc::now(),
                detail: None,
            };
            self.registry
                .transition_status(
                    &cluster_id,
                    ClusterStatus::PostCheckRunning,
                    ClusterStatus::Healthy,
                    RecordPatch::none()
                        .with_current_version(&target)
                        .with_history(entry),
                )
                .await?;
            info!(cluster_id = %cluster_id, version = %target, "cluster_healthy");
            return Ok(outcome(
                &cluster_id,
                ClusterStatus::Healthy,
                format!("upgraded to {target}"),
                Some(mr.web_url),
                None,
            ));
        }
        post_span.complete_failure();

        // Verdict failed: exactly one rollback MR per entry into
        // ROLLBACK_REQUIRED, pinned to this transition's timestamp.
        let rollback_entry = self
            .registry
            .transition_status(
                &cluster_id,
                ClusterStatus::PostCheckRunning,
                ClusterStatus::RollbackRequired,
                RecordPatch::none(),
            )
            .await?;
        let pinned_at = rollback_entry.record.last_updated;
        let previous_version = record.current_version.clone();
        let reason = violations.join("; ");

        let rollback_span = self.operation_metrics.timed(
            OperationType::Rollback,
            Some(&cluster_id),
            Some(&record.batch_id),
        );
        let rollback_mr = match self
            .changes
            .open_rollback_mr(
                &rollback_entry.record,
                &target,
                &previous_version,
                &reason,
                &failed_metrics,
                pinned_at,
            )
            .await
        {
            Ok(mr) => {
                rollback_span.complete_success();
                mr
            }
            Err(err) => {
                rollback_span.complete_error(&err);
                return Err(err);
            }
        };

        let entry = UpgradeHistoryEntry {
            version: target.clone(),
            outcome: UpgradeOutcome::Failed,
            timestamp: Utc::now(),
            detail: Some(reason.clone()),
        };
        self.registry
            .transition_status(
                &cluster_id,
                ClusterStatus::RollbackRequired,
                ClusterStatus::FailedUpgradeRolledBack,
                RecordPatch::none()
                    .with_mr_url(&rollback_mr.web_url)
                    .with_history(entry),
            )
            .await?;

        info!(
            cluster_id = %cluster_id,
            rollback_mr = %rollback_mr.web_url,
            "cluster_rolled_back"
        );
        Ok(outcome(
            &cluster_id,
            ClusterStatus::FailedUpgradeRolledBack,
            format!("rolled back to {previous_version}: {reason}"),
            Some(rollback_mr.web_url),
            None,
        ))
    }

    async fn check_context(&self, record: &ClusterRecord) -> Result<CheckContext> {
        let kubernetes = self.connector.connect(record).await?;
        Ok(CheckContext {
            cloud: self.cloud.clone(),
            kubernetes,
            metrics: self.metrics.clone(),
            extras: BTreeMap::new(),
        })
    }

    async fn wait_for_merge(
        &self,
        repository: &str,
        mr_id: u64,
        work: &CancellationToken,
    ) -> Result<()> {
        let wait = self.config.execution.mr_merge_wait;
        let deadline = tokio::time::Instant::now() + wait;
        debug!(repository = %repository, mr_id, "waiting_for_merge");

        loop {
            ensure_live(work)?;
            let mr = self.gitops.get_merge_request(repository, mr_id).await?;
            match mr.state {
                MergeRequestState::Merged => {
                    info!(repository = %repository, mr_id, "merge_observed");
                    return Ok(());
                }
                MergeRequestState::Closed | MergeRequestState::Locked => {
                    return Err(GuardError::precondition(format!(
                        "merge request {mr_id} was closed without merging"
                    )));
                }
                MergeRequestState::Open => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GuardError::timeout(format!(
                    "merge request {mr_id} not merged within {}",
                    humantime::format_duration(wait)
                )));
            }
            cancellable(work, tokio::time::sleep(MERGE_POLL_INTERVAL)).await?;
        }
    }

    async fn wait_for_rollout(
        &self,
        kubernetes: &Arc<dyn KubernetesProvider>,
        work: &CancellationToken,
    ) -> Result<()> {
        let control_plane = &self.config.control_plane;
        let rollout_wait = self.config.execution.rollout_wait;
        let deadline = tokio::time::Instant::now() + rollout_wait;

        'converge: loop {
            ensure_live(work)?;
            let converged = match kubernetes
                .get_deployment(&control_plane.deployment, &control_plane.namespace)
                .await
            {
                Ok(status) => status.converged(),
                // Transient blips while polling are tolerated until the
                // overall deadline.
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "rollout_poll_failed");
                    false
                }
                Err(err) => return Err(err),
            };

            if converged {
                let soak_deadline = tokio::time::Instant::now() + self.config.execution.soak_window;
                debug!(
                    deployment = %control_plane.deployment,
                    "rollout_converged_starting_soak"
                );
                loop {
                    let now = tokio::time::Instant::now();
                    if now >= soak_deadline {
                        info!(deployment = %control_plane.deployment, "rollout_stabilised");
                        return Ok(());
                    }
                    let slice = SOAK_POLL_INTERVAL.min(soak_deadline - now);
                    cancellable(work, tokio::time::sleep(slice)).await?;

                    let still_converged = kubernetes
                        .get_deployment(&control_plane.deployment, &control_plane.namespace)
                        .await
                        .map(|s| s.converged())
                        .unwrap_or(false);
                    if !still_converged {
                        warn!(
                            deployment = %control_plane.deployment,
                            "rollout_regressed_during_soak"
                        );
                        continue 'converge;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GuardError::timeout(format!(
                    "control plane did not converge within {}",
                    humantime::format_duration(rollout_wait)
                )));
            }
            cancellable(work, tokio::time::sleep(ROLLOUT_POLL_INTERVAL)).await?;
        }
    }
}

fn outcome(
    cluster_id: &str,
    status: ClusterStatus,
    message: impl Into<String>,
    mr_url: Option<String>,
    error_kind: Option<ErrorKind>,
) -> ClusterOutcome {
    ClusterOutcome {
        cluster_id: cluster_id.to_string(),
        status,
        message: message.into(),
        mr_url,
        error_kind,
    }
}

fn outcome_with_error(cluster_id: &str, status: ClusterStatus, err: &GuardError) -> ClusterOutcome {
    outcome(cluster_id, status, err.to_string(), None, Some(err.kind()))
}
