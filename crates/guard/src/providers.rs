//! Ports to the outside world.
//!
//! The core interacts with cloud, Kubernetes, metrics, and version-control
//! systems exclusively through these traits. Adapters normalise their native
//! errors into the [`crate::error::GuardError`] taxonomy before returning;
//! retry and rate limiting are applied as middleware around constructed
//! adapters, never inside the core.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::ClusterRecord;

/// Control-plane facts about a managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub endpoint: String,
    pub ca_cert: String,
    pub version: String,
    pub status: String,
}

/// Short-lived, single-use credential bundle for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub endpoint: String,
    pub ca_cert: String,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Assume the cluster-scoped role; subsequent calls run under it.
    async fn assume_role(&self, role_ref: &str, session_name: &str) -> Result<()>;

    async fn get_secret(&self, name: &str) -> Result<String>;

    async fn get_cluster_info(&self, name: &str) -> Result<ClusterInfo>;

    /// Mint a short-lived access token for the named cluster.
    async fn generate_cluster_token(&self, name: &str) -> Result<ClusterToken>;

    async fn list_clusters(&self, region: Option<&str>) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,
    #[serde(default)]
    pub allocatable: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub ready: bool,
    pub restarts: u32,
}

/// Replica accounting for a deployment, as reported by the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
    pub updated: u32,
}

impl DeploymentStatus {
    /// All replicas updated to the latest template and serving.
    pub fn converged(&self) -> bool {
        self.desired > 0
            && self.updated == self.desired
            && self.ready == self.desired
            && self.available == self.desired
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait KubernetesProvider: Send + Sync {
    async fn get_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// `(all_ready, names_of_unready_nodes)`.
    async fn check_nodes_ready(&self) -> Result<(bool, Vec<String>)>;

    async fn get_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<PodInfo>>;

    /// `(all_ready, names_of_unready_pods)`.
    async fn check_pods_ready(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<(bool, Vec<String>)>;

    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<DeploymentStatus>;

    async fn check_deployment_ready(&self, name: &str, namespace: &str) -> Result<bool>;

    async fn get_namespaces(&self, selector: Option<&str>) -> Result<Vec<String>>;

    async fn restart_deployment(&self, name: &str, namespace: &str) -> Result<()>;

    async fn restart_daemon_set(&self, name: &str, namespace: &str) -> Result<()>;

    async fn restart_stateful_set(&self, name: &str, namespace: &str) -> Result<()>;

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        container: Option<&str>,
    ) -> Result<ExecOutput>;
}

/// Mints a per-cluster [`KubernetesProvider`] from the cluster's credential
/// reference. The connection is owned by the single worker holding the
/// cluster lock.
#[async_trait]
pub trait KubernetesConnector: Send + Sync {
    async fn connect(&self, cluster: &ClusterRecord) -> Result<Arc<dyn KubernetesProvider>>;
}

/// Aggregation applied when collapsing a timeseries to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Avg,
    Sum,
    Max,
    Min,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn query_timeseries(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &BTreeMap<String, String>,
        aggregation: Option<Aggregation>,
    ) -> Result<Vec<MetricPoint>>;

    /// Collapse a metric over `[start, end]` into one value.
    async fn query_scalar(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &BTreeMap<String, String>,
        aggregation: Aggregation,
    ) -> Result<f64>;

    /// min / max / avg / last / count over the window.
    async fn query_statistics(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, f64>>;

    /// `(healthy, active_alerts)`; healthy means no active alerts matched.
    async fn check_active_alerts(
        &self,
        tags: Option<&BTreeMap<String, String>>,
    ) -> Result<(bool, Vec<AlertInfo>)>;

    async fn get_monitor_status(&self, monitor_id: &str) -> Result<serde_json::Value>;

    /// Escape hatch for provider-native query syntax.
    async fn query_raw(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<serde_json::Value>;
}

/// Review state of a merge request, normalised across VCS providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    Open,
    Merged,
    Closed,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequestInfo {
    pub id: u64,
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
    pub state: MergeRequestState,
    pub web_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for opening a merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMergeRequest {
    pub repository: String,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub draft: bool,
    pub assignees: Vec<String>,
}

#[async_trait]
pub trait GitOpsProvider: Send + Sync {
    async fn create_branch(&self, repository: &str, branch: &str, from: &str) -> Result<()>;

    async fn get_file_content(&self, repository: &str, path: &str, reference: &str)
    -> Result<String>;

    async fn update_file(
        &self,
        repository: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> Result<()>;

    async fn create_merge_request(&self, request: NewMergeRequest) -> Result<MergeRequestInfo>;

    /// Carries `state` so callers can observe merges by polling.
    async fn get_merge_request(&self, repository: &str, id: u64) -> Result<MergeRequestInfo>;

    async fn add_merge_request_comment(
        &self,
        repository: &str,
        id: u64,
        comment: &str,
    ) -> Result<()>;

    async fn check_branch_exists(&self, repository: &str, branch: &str) -> Result<bool>;
}
