//! Batch orchestrator.
//!
//! Resolves the clusters of a named batch, verifies that every prerequisite
//! batch is fully healthy, and runs the per-cluster state machines under a
//! bounded worker pool. Partial failure is the expected case: one cluster
//! failing never cancels its peers, and the batch outcome reports the mix.
//!
//! Cancellation stops new dispatches (a worker counts as dispatched once it
//! holds a pool permit) and is forwarded to in-flight workers, which abandon
//! at their next suspension point in a legal state.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GuardConfig;
use crate::engine::UpgradeEngine;
use crate::error::Result;
use crate::metrics::{OperationMetrics, OperationType};
use crate::types::{BatchOutcome, ClusterOutcome};

/// Runs one batch end to end.
pub struct BatchEngine {
    engine: Arc<UpgradeEngine>,
    config: Arc<GuardConfig>,
    operation_metrics: Arc<OperationMetrics>,
}

impl BatchEngine {
    pub fn new(
        engine: Arc<UpgradeEngine>,
        config: Arc<GuardConfig>,
        operation_metrics: Arc<OperationMetrics>,
    ) -> Self {
        Self {
            engine,
            config,
            operation_metrics,
        }
    }

    /// Upgrade every cluster of `batch_id` to `target_version`.
    ///
    /// Refuses with a diagnostic, and zero side effects, when a prerequisite
    /// batch has clusters that are not healthy.
    pub async fn run_batch(
        &self,
        batch_id: &str,
        target_version: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let span = self
            .operation_metrics
            .timed(OperationType::BatchUpgrade, None, Some(batch_id));

        let result = self.run_inner(batch_id, target_version, cancel).await;
        match &result {
            Ok(outcome) if outcome.all_healthy() => span.complete_success(),
            Ok(_) => span.complete_failure(),
            Err(err) => span.complete_error(err),
        }
        result
    }

    async fn run_inner(
        &self,
        batch_id: &str,
        target_version: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let registry = self.engine.registry();

        registry
            .validate_batch_prerequisites(batch_id, &self.config.batch_order)
            .await?;

        let clusters = registry.list(Some(batch_id), None).await?;
        info!(
            batch_id = %batch_id,
            target_version = %target_version,
            clusters = clusters.len(),
            max_parallel = self.config.execution.max_parallel_clusters,
            "batch_upgrade_started"
        );

        let pool = Arc::new(Semaphore::new(self.config.execution.max_parallel_clusters));
        let mut workers: JoinSet<Option<ClusterOutcome>> = JoinSet::new();

        for cluster in clusters {
            let engine = self.engine.clone();
            let pool = pool.clone();
            let cancel = cancel.clone();
            let target = target_version.to_string();

            workers.spawn(async move {
                // Holding a permit is what "dispatched" means; once the
                // cancel signal fires, waiting workers never start.
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = pool.acquire_owned() => permit.expect("pool is never closed"),
                };
                Some(engine.run_cluster(&cluster.cluster_id, &target, &cancel).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => warn!(batch_id = %batch_id, error = %err, "cluster_worker_failed"),
            }
        }
        outcomes.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));

        let outcome = BatchOutcome::from_clusters(batch_id, outcomes);
        info!(
            batch_id = %batch_id,
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "batch_upgrade_finished"
        );
        Ok(outcome)
    }
}
