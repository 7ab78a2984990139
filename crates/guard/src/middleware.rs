//! Rate-limit and retry middleware for provider ports.
//!
//! Both concerns are applied here, around constructed adapters, instead of
//! inside the core components: every outbound call first takes a token from
//! the provider's named bucket, then runs under the classified-retry policy.
//! Only errors classified transient are retried; precondition, input, and
//! fatal errors surface immediately, and the final failure preserves the
//! original classified error.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guard_ratelimit::RateLimiterSet;
use guard_retry::BackoffConfig;

use crate::error::{GuardError, Result};
use crate::providers::{
    Aggregation, AlertInfo, ClusterInfo, ClusterToken, CloudProvider, DeploymentStatus,
    ExecOutput, GitOpsProvider, KubernetesProvider, MergeRequestInfo, MetricPoint,
    MetricsProvider, NewMergeRequest, NodeInfo, PodInfo,
};

/// Shared policy handed to each wrapped port.
#[derive(Clone)]
pub struct CallPolicy {
    limiters: Arc<RateLimiterSet>,
    backoff: BackoffConfig,
}

impl CallPolicy {
    pub fn new(limiters: Arc<RateLimiterSet>, backoff: BackoffConfig) -> Self {
        Self { limiters, backoff }
    }
}

/// Gate `$call` behind the wrapper's bucket and retry transient failures.
/// The expression is re-evaluated on every attempt, and each attempt pays
/// its own token.
macro_rules! guarded {
    ($self:expr, $call:expr) => {{
        let policy = &$self.policy;
        let bucket = $self.bucket.as_str();
        let mut attempt: u32 = 1;
        loop {
            let outcome = match policy.limiters.acquire(bucket, 1).await {
                Ok(()) => $call.await,
                Err(err) => Err(GuardError::from(err)),
            };
            match outcome {
                Ok(value) => break Ok(value),
                Err(err) => {
                    if attempt >= policy.backoff.max_attempts || !err.is_retryable() {
                        break Err(err);
                    }
                    let delay = guard_retry::delay_for_attempt(&policy.backoff, attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }};
}

/// [`GitOpsProvider`] wrapper drawing from the `gitops` bucket.
pub struct GitOpsMiddleware {
    inner: Arc<dyn GitOpsProvider>,
    policy: CallPolicy,
    bucket: String,
}

impl GitOpsMiddleware {
    pub fn new(inner: Arc<dyn GitOpsProvider>, policy: CallPolicy) -> Self {
        Self {
            inner,
            policy,
            bucket: "gitops".to_string(),
        }
    }
}

#[async_trait]
impl GitOpsProvider for GitOpsMiddleware {
    async fn create_branch(&self, repository: &str, branch: &str, from: &str) -> Result<()> {
        guarded!(self, self.inner.create_branch(repository, branch, from))
    }

    async fn get_file_content(
        &self,
        repository: &str,
        path: &str,
        reference: &str,
    ) -> Result<String> {
        guarded!(self, self.inner.get_file_content(repository, path, reference))
    }

    async fn update_file(
        &self,
        repository: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> Result<()> {
        guarded!(
            self,
            self.inner.update_file(repository, path, content, message, branch)
        )
    }

    async fn create_merge_request(&self, request: NewMergeRequest) -> Result<MergeRequestInfo> {
        guarded!(self, self.inner.create_merge_request(request.clone()))
    }

    async fn get_merge_request(&self, repository: &str, id: u64) -> Result<MergeRequestInfo> {
        guarded!(self, self.inner.get_merge_request(repository, id))
    }

    async fn add_merge_request_comment(
        &self,
        repository: &str,
        id: u64,
        comment: &str,
    ) -> Result<()> {
        guarded!(self, self.inner.add_merge_request_comment(repository, id, comment))
    }

    async fn check_branch_exists(&self, repository: &str, branch: &str) -> Result<bool> {
        guarded!(self, self.inner.check_branch_exists(repository, branch))
    }
}

/// [`MetricsProvider`] wrapper drawing from the `metrics` bucket.
pub struct MetricsMiddleware {
    inner: Arc<dyn MetricsProvider>,
    policy: CallPolicy,
    bucket: String,
}

impl MetricsMiddleware {
    pub fn new(inner: Arc<dyn MetricsProvider>, policy: CallPolicy) -> Self {
        Self {
            inner,
            policy,
            bucket: "metrics".to_string(),
        }
    }
}

#[async_trait]
impl MetricsProvider for MetricsMiddleware {
    async fn query_timeseries(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &BTreeMap<String, String>,
        aggregation: Option<Aggregation>,
    ) -> Result<Vec<MetricPoint>> {
        guarded!(
            self,
            self.inner
                .query_timeseries(metric_name, start, end, tags, aggregation)
        )
    }

    async fn query_scalar(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &BTreeMap<String, String>,
        aggregation: Aggregation,
    ) -> Result<f64> {
        guarded!(
            self,
            self.inner
                .query_scalar(metric_name, start, end, tags, aggregation)
        )
    }

    async fn query_statistics(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, f64>> {
        guarded!(self, self.inner.query_statistics(metric_name, start, end, tags))
    }

    async fn check_active_alerts(
        &self,
        tags: Option<&BTreeMap<String, String>>,
    ) -> Result<(bool, Vec<AlertInfo>)> {
        guarded!(self, self.inner.check_active_alerts(tags))
    }

    async fn get_monitor_status(&self, monitor_id: &str) -> Result<serde_json::Value> {
        guarded!(self, self.inner.get_monitor_status(monitor_id))
    }

    async fn query_raw(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<serde_json::Value> {
        guarded!(self, self.inner.query_raw(query, start, end))
    }
}

/// [`CloudProvider`] wrapper drawing from the `cloud` bucket.
pub struct CloudMiddleware {
    inner: Arc<dyn CloudProvider>,
    policy: CallPolicy,
    bucket: String,
}

impl CloudMiddleware {
    pub fn new(inner: Arc<dyn CloudProvider>, policy: CallPolicy) -> Self {
        Self {
            inner,
            policy,
            bucket: "cloud".to_string(),
        }
    }
}

#[async_trait]
impl CloudProvider for CloudMiddleware {
    async fn assume_role(&self, role_ref: &str, session_name: &str) -> Result<()> {
        guarded!(self, self.inner.assume_role(role_ref, session_name))
    }

    async fn get_secret(&self, name: &str) -> Result<String> {
        guarded!(self, self.inner.get_secret(name))
    }

    async fn get_cluster_info(&self, name: &str) -> Result<ClusterInfo> {
        guarded!(self, self.inner.get_cluster_info(name))
    }

    async fn generate_cluster_token(&self, name: &str) -> Result<ClusterToken> {
        guarded!(self, self.inner.generate_cluster_token(name))
    }

    async fn list_clusters(&self, region: Option<&str>) -> Result<Vec<String>> {
        guarded!(self, self.inner.list_clusters(region))
    }
}

/// [`KubernetesProvider`] wrapper drawing from the `kubernetes` bucket.
pub struct KubernetesMiddleware {
    inner: Arc<dyn KubernetesProvider>,
    policy: CallPolicy,
    bucket: String,
}

impl KubernetesMiddleware {
    pub fn new(inner: Arc<dyn KubernetesProvider>, policy: CallPolicy) -> Self {
        Self {
            inner,
            policy,
            bucket: "kubernetes".to_string(),
        }
    }
}

#[async_trait]
impl KubernetesProvider for KubernetesMiddleware {
    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        guarded!(self, self.inner.get_nodes())
    }

    async fn check_nodes_ready(&self) -> Result<(bool, Vec<String>)> {
        guarded!(self, self.inner.check_nodes_ready())
    }

    async fn get_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<PodInfo>> {
        guarded!(self, self.inner.get_pods(namespace, selector))
    }

    async fn check_pods_ready(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<(bool, Vec<String>)> {
        guarded!(self, self.inner.check_pods_ready(namespace, selector))
    }

    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<DeploymentStatus> {
        guarded!(self, self.inner.get_deployment(name, namespace))
    }

    async fn check_deployment_ready(&self, name: &str, namespace: &str) -> Result<bool> {
        guarded!(self, self.inner.check_deployment_ready(name, namespace))
    }

    async fn get_namespaces(&self, selector: Option<&str>) -> Result<Vec<String>> {
        guarded!(self, self.inner.get_namespaces(selector))
    }

    async fn restart_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        guarded!(self, self.inner.restart_deployment(name, namespace))
    }

    async fn restart_daemon_set(&self, name: &str, namespace: &str) -> Result<()> {
        guarded!(self, self.inner.restart_daemon_set(name, namespace))
    }

    async fn restart_stateful_set(&self, name: &str, namespace: &str) -> Result<()> {
        guarded!(self, self.inner.restart_stateful_set(name, namespace))
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        container: Option<&str>,
    ) -> Result<ExecOutput> {
        guarded!(self, self.inner.exec_in_pod(namespace, pod, command, container))
    }
}
