//! Stress tests for concurrent orchestrator behavior.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::checks::{CheckRegistry, NodeReadinessCheck};
use crate::config::GuardConfig;
use crate::engine::{UpgradeDeps, UpgradeEngine};
use crate::gitops::{ChangeProducer, GitOpsSettings};
use crate::lock::{AcquireWait, LockManager, MemoryLockStore};
use crate::registry::ClusterRegistry;
use crate::store::{MemoryStateStore, StateStore};
use crate::testutil::{
    HELMRELEASE, ScriptedCloud, ScriptedGitOps, ScriptedKubernetes, ScriptedMetrics,
    StaticConnector, sample_record,
};
use crate::types::{ClusterStatus, UpgradeOutcome};
use crate::validation::{
    ERROR_RATE_5XX, ErrorRateValidator, LATENCY_P95, LATENCY_P99, LatencyValidator, REQUEST_RATE,
    ValidatorRegistry,
};

fn engine_over(
    store: Arc<MemoryStateStore>,
    locks: Arc<MemoryLockStore>,
    gitops: Arc<ScriptedGitOps>,
) -> Arc<UpgradeEngine> {
    let mut config = GuardConfig::default();
    config.execution.snapshot_window = Duration::from_secs(60);
    config.execution.soak_window = Duration::from_secs(30);

    let mut checks = CheckRegistry::new();
    checks.register(Arc::new(NodeReadinessCheck)).expect("check");
    let mut validators = ValidatorRegistry::new();
    validators.register(Arc::new(LatencyValidator)).expect("latency");
    validators
        .register(Arc::new(ErrorRateValidator))
        .expect("error-rate");

    let metrics = Arc::new(ScriptedMetrics::with_scalars(&[
        (LATENCY_P95, 100.0),
        (LATENCY_P99, 180.0),
        (ERROR_RATE_5XX, 0.0001),
        (REQUEST_RATE, 2000.0),
    ]));

    let deps = UpgradeDeps {
        registry: ClusterRegistry::new(store),
        locks: LockManager::new(locks),
        checks: Arc::new(checks),
        validators: Arc::new(validators),
        changes: Arc::new(ChangeProducer::new(gitops.clone(), GitOpsSettings::default())),
        connector: Arc::new(StaticConnector {
            kubernetes: Arc::new(ScriptedKubernetes::default()),
        }),
        cloud: Arc::new(ScriptedCloud),
        metrics,
        gitops,
        operation_metrics: Arc::new(crate::metrics::OperationMetrics::new()),
    };
    Arc::new(UpgradeEngine::new(deps, Arc::new(config)))
}

/// Race several orchestrator processes against one cluster: exactly one may
/// proceed past `pending -> pre-check-running`; everyone else must exit
/// without side effects.
#[tokio::test(start_paused = true)]
async fn racing_orchestrators_admit_exactly_one_winner() {
    let record = sample_record("contested", "wave-1");
    let store = Arc::new(MemoryStateStore::with_records([record.clone()]));
    let locks = Arc::new(MemoryLockStore::new());
    let gitops = Arc::new(ScriptedGitOps::merging_after(0));
    gitops.seed_file(&record.config_path, HELMRELEASE);

    // Each worker gets its own engine, sharing only the durable stores,
    // mirroring separate orchestrator processes.
    let mut workers = Vec::new();
    for _ in 0..6 {
        let engine = engine_over(store.clone(), locks.clone(), gitops.clone());
        workers.push(tokio::spawn(async move {
            engine
                .run_cluster("contested", "1.20.0", &CancellationToken::new())
                .await
        }));
    }

    let mut winners = 0;
    for worker in workers {
        let outcome = worker.await.expect("worker");
        // Only the worker that actually drove the lifecycle reports the
        // upgrade; the rest observed a held lock or a non-pending record.
        if outcome.message.starts_with("upgraded to") {
            winners += 1;
        }
    }

    assert_eq!(winners, 1, "exactly one worker may drive the cluster");
    assert_eq!(gitops.mr_count(), 1, "one upgrade MR in total");

    let record = store.get("contested").await.expect("get").record;
    assert_eq!(record.status, ClusterStatus::Healthy);
    assert_eq!(record.upgrade_history.len(), 1);
    assert_eq!(record.upgrade_history[0].outcome, UpgradeOutcome::Success);
}

/// Fencing across engine runs: a worker that lost its lease cannot finish
/// the lifecycle later, and tokens keep increasing for new acquirers.
#[tokio::test]
async fn lease_takeover_yields_strictly_increasing_tokens() {
    let locks = Arc::new(MemoryLockStore::new());
    let manager = LockManager::new(locks);

    let mut last_token = 0;
    for _ in 0..4 {
        let handle = manager
            .acquire("cluster-x", Duration::from_millis(10), AcquireWait::NoWait)
            .await
            .expect("acquire");
        assert!(handle.fencing_token > last_token);
        last_token = handle.fencing_token;

        // Let the lease lapse instead of releasing.
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}
