//! Pre-upgrade check registry and runner.
//!
//! Checks are pure async operations that inspect a cluster through the
//! provider ports and report pass/fail. The runner executes them in
//! registration order with a per-check timeout; timeouts, errors, and panics
//! inside a check become failing results rather than aborting the pipeline,
//! and a critical failure stops the run when fail-fast is on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{GuardError, Result};
use crate::providers::{CloudProvider, KubernetesProvider, MetricsProvider};
use crate::types::{CheckResult, ClusterRecord};

/// Provider handles and free-form extras handed to every check.
#[derive(Clone)]
pub struct CheckContext {
    pub cloud: Arc<dyn CloudProvider>,
    pub kubernetes: Arc<dyn KubernetesProvider>,
    pub metrics: Arc<dyn MetricsProvider>,
    pub extras: BTreeMap<String, String>,
}

/// A single pre-upgrade health check.
#[async_trait]
pub trait Check: Send + Sync {
    /// Stable name used for registration, logging, and reporting.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether a failure of this check blocks the upgrade.
    fn is_critical(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, cluster: &ClusterRecord, ctx: &CheckContext) -> Result<CheckResult>;
}

/// Ordered collection of registered checks.
#[derive(Default)]
pub struct CheckRegistry {
    checks: Vec<Arc<dyn Check>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check. Duplicate names are rejected.
    pub fn register(&mut self, check: Arc<dyn Check>) -> Result<()> {
        if self.checks.iter().any(|c| c.name() == check.name()) {
            return Err(GuardError::invalid_input(format!(
                "check '{}' is already registered",
                check.name()
            )));
        }
        debug!(check_name = check.name(), "check_registered");
        self.checks.push(check);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.checks.len();
        self.checks.retain(|c| c.name() != name);
        before != self.checks.len()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Check>> {
        self.checks.iter().find(|c| c.name() == name)
    }

    /// All checks, in registration order.
    pub fn all(&self) -> &[Arc<dyn Check>] {
        &self.checks
    }

    pub fn critical(&self) -> Vec<&Arc<dyn Check>> {
        self.checks.iter().filter(|c| c.is_critical()).collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

/// Outcome of one pre-check run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRun {
    pub results: Vec<CheckResult>,
    /// True iff no critical check failed. Non-critical failures are recorded
    /// but do not block.
    pub passed: bool,
}

impl CheckRun {
    /// Messages of every failing result, for history and diagnostics.
    pub fn failure_messages(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: {}", r.check_name, r.message))
            .collect()
    }
}

/// Stateless executor over a [`CheckRegistry`]; safe to share across
/// concurrently upgraded clusters.
#[derive(Debug, Clone)]
pub struct CheckRunner {
    fail_fast: bool,
}

impl Default for CheckRunner {
    fn default() -> Self {
        Self { fail_fast: true }
    }
}

impl CheckRunner {
    pub fn new(fail_fast: bool) -> Self {
        Self { fail_fast }
    }

    /// Run every registered check against `cluster`.
    pub async fn run(
        &self,
        registry: &CheckRegistry,
        cluster: &ClusterRecord,
        ctx: &CheckContext,
    ) -> CheckRun {
        info!(cluster_id = %cluster.cluster_id, checks = registry.len(), "running_checks");

        let mut results = Vec::with_capacity(registry.len());
        let mut passed = true;

        for check in registry.all() {
            let result = self.run_one(check.as_ref(), cluster, ctx).await;
            let failed = !result.passed;
            results.push(result);

            if failed && check.is_critical() {
                passed = false;
                if self.fail_fast {
                    warn!(
                        cluster_id = %cluster.cluster_id,
                        check_name = check.name(),
                        "critical_check_failed_stopping"
                    );
                    break;
                }
            }
        }

        info!(
            cluster_id = %cluster.cluster_id,
            total = results.len(),
            passed_count = results.iter().filter(|r| r.passed).count(),
            passed,
            "checks_completed"
        );

        CheckRun { results, passed }
    }

    async fn run_one(
        &self,
        check: &dyn Check,
        cluster: &ClusterRecord,
        ctx: &CheckContext,
    ) -> CheckResult {
        let timeout = check.timeout();
        match tokio::time::timeout(timeout, check.execute(cluster, ctx)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(check_name = check.name(), error = %err, "check_execution_failed");
                CheckResult::failed(
                    check.name(),
                    format!("check failed ({}): {err}", err.kind()),
                )
            }
            Err(_elapsed) => {
                warn!(
                    check_name = check.name(),
                    timeout_secs = timeout.as_secs(),
                    "check_timeout"
                );
                CheckResult::failed(
                    check.name(),
                    format!("timed out after {}s", timeout.as_secs()),
                )
            }
        }
    }
}

/// All worker nodes must report Ready.
#[derive(Debug, Default)]
pub struct NodeReadinessCheck;

#[async_trait]
impl Check for NodeReadinessCheck {
    fn name(&self) -> &str {
        "node-readiness"
    }

    fn description(&self) -> &str {
        "All cluster nodes report the Ready condition"
    }

    async fn execute(&self, _cluster: &ClusterRecord, ctx: &CheckContext) -> Result<CheckResult> {
        let (all_ready, unready) = ctx.kubernetes.check_nodes_ready().await?;
        if all_ready {
            Ok(CheckResult::passed(self.name(), "all nodes ready"))
        } else {
            Ok(CheckResult::failed(
                self.name(),
                format!("unready nodes: {}", unready.join(", ")),
            ))
        }
    }
}

/// All mesh pods in the target namespace must be ready.
#[derive(Debug)]
pub struct PodHealthCheck {
    namespace: String,
    selector: Option<String>,
}

impl PodHealthCheck {
    pub fn new(namespace: impl Into<String>, selector: Option<String>) -> Self {
        Self {
            namespace: namespace.into(),
            selector,
        }
    }
}

impl Default for PodHealthCheck {
    fn default() -> Self {
        Self::new("istio-system", None)
    }
}

#[async_trait]
impl Check for PodHealthCheck {
    fn name(&self) -> &str {
        "pod-health"
    }

    fn description(&self) -> &str {
        "Mesh pods in the control-plane namespace are ready"
    }

    async fn execute(&self, _cluster: &ClusterRecord, ctx: &CheckContext) -> Result<CheckResult> {
        let (all_ready, unready) = ctx
            .kubernetes
            .check_pods_ready(&self.namespace, self.selector.as_deref())
            .await?;
        if all_ready {
            Ok(CheckResult::passed(
                self.name(),
                format!("all pods ready in {}", self.namespace),
            ))
        } else {
            Ok(CheckResult::failed(
                self.name(),
                format!("unready pods in {}: {}", self.namespace, unready.join(", ")),
            ))
        }
    }
}

/// The control-plane deployment must be fully available before an upgrade.
#[derive(Debug)]
pub struct ControlPlaneHealthCheck {
    deployment: String,
    namespace: String,
}

impl ControlPlaneHealthCheck {
    pub fn new(deployment: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            namespace: namespace.into(),
        }
    }
}

impl Default for ControlPlaneHealthCheck {
    fn default() -> Self {
        Self::new("istiod", "istio-system")
    }
}

#[async_trait]
impl Check for ControlPlaneHealthCheck {
    fn name(&self) -> &str {
        "control-plane-health"
    }

    fn description(&self) -> &str {
        "Control-plane deployment reports all replicas ready"
    }

    async fn execute(&self, _cluster: &ClusterRecord, ctx: &CheckContext) -> Result<CheckResult> {
        let status = ctx
            .kubernetes
            .get_deployment(&self.deployment, &self.namespace)
            .await?;

        let mut result = if status.converged() {
            CheckResult::passed(
                self.name(),
                format!("{}/{} fully available", self.namespace, self.deployment),
            )
        } else {
            CheckResult::failed(
                self.name(),
                format!(
                    "{}/{}: {}/{} ready, {}/{} updated",
                    self.namespace,
                    self.deployment,
                    status.ready,
                    status.desired,
                    status.updated,
                    status.desired
                ),
            )
        };
        result.metrics.insert("desired".to_string(), f64::from(status.desired));
        result.metrics.insert("ready".to_string(), f64::from(status.ready));
        result.metrics.insert("updated".to_string(), f64::from(status.updated));
        Ok(result)
    }
}

/// No active telemetry alerts for the cluster. Advisory only.
#[derive(Debug, Default)]
pub struct ActiveAlertsCheck;

#[async_trait]
impl Check for ActiveAlertsCheck {
    fn name(&self) -> &str {
        "active-alerts"
    }

    fn description(&self) -> &str {
        "No active monitor alerts match the cluster's tags"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn execute(&self, cluster: &ClusterRecord, ctx: &CheckContext) -> Result<CheckResult> {
        let tags = cluster.metric_tags.as_map();
        let (healthy, alerts) = ctx.metrics.check_active_alerts(Some(&tags)).await?;
        if healthy {
            Ok(CheckResult::passed(self.name(), "no active alerts"))
        } else {
            let names: Vec<&str> = alerts.iter().map(|a| a.name.as_str()).collect();
            Ok(CheckResult::failed(
                self.name(),
                format!("active alerts: {}", names.join(", ")),
            ))
        }
    }
}
