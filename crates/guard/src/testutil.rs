//! Shared fixtures and scripted providers for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{GuardError, Result};
use crate::providers::{
    Aggregation, AlertInfo, ClusterInfo, ClusterToken, CloudProvider, DeploymentStatus,
    ExecOutput, GitOpsProvider, KubernetesConnector, KubernetesProvider, MergeRequestInfo,
    MergeRequestState, MetricPoint, MetricsProvider, NewMergeRequest, NodeInfo, PodInfo,
};
use crate::types::{ClusterMetadata, ClusterRecord, ClusterStatus, MetricTags};

/// Minimal desired-state document used across engine and batch tests.
pub(crate) const HELMRELEASE: &str = "\
spec:
  chart:
    spec:
      chart: base
      version: \"1.19.3\"
";

pub(crate) fn sample_record(cluster_id: &str, batch_id: &str) -> ClusterRecord {
    ClusterRecord {
        cluster_id: cluster_id.to_string(),
        batch_id: batch_id.to_string(),
        environment: "staging".to_string(),
        region: "eu-west-1".to_string(),
        gitops_repo: "platform/mesh-config".to_string(),
        config_path: "clusters/staging/istio.yaml".to_string(),
        cloud_role_ref: "arn:aws:iam::123456789012:role/mesh-upgrade".to_string(),
        current_version: "1.19.3".to_string(),
        target_version: None,
        metric_tags: MetricTags {
            cluster: cluster_id.to_string(),
            service: "istio-system".to_string(),
            env: "staging".to_string(),
        },
        team: "platform".to_string(),
        reviewer_handle: "mesh-oncall".to_string(),
        last_mr_url: None,
        status: ClusterStatus::Pending,
        last_updated: Utc::now(),
        upgrade_history: Vec::new(),
        metadata: ClusterMetadata::default(),
    }
}

/// Kubernetes provider with scripted readiness answers.
pub(crate) struct ScriptedKubernetes {
    pub nodes_ready: (bool, Vec<String>),
    pub pods_ready: (bool, Vec<String>),
    pub deployment: DeploymentStatus,
}

impl Default for ScriptedKubernetes {
    fn default() -> Self {
        Self {
            nodes_ready: (true, Vec::new()),
            pods_ready: (true, Vec::new()),
            deployment: DeploymentStatus {
                desired: 2,
                ready: 2,
                available: 2,
                updated: 2,
            },
        }
    }
}

#[async_trait]
impl KubernetesProvider for ScriptedKubernetes {
    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(Vec::new())
    }

    async fn check_nodes_ready(&self) -> Result<(bool, Vec<String>)> {
        Ok(self.nodes_ready.clone())
    }

    async fn get_pods(&self, _namespace: &str, _selector: Option<&str>) -> Result<Vec<PodInfo>> {
        Ok(Vec::new())
    }

    async fn check_pods_ready(
        &self,
        _namespace: &str,
        _selector: Option<&str>,
    ) -> Result<(bool, Vec<String>)> {
        Ok(self.pods_ready.clone())
    }

    async fn get_deployment(&self, _name: &str, _namespace: &str) -> Result<DeploymentStatus> {
        Ok(self.deployment)
    }

    async fn check_deployment_ready(&self, _name: &str, _namespace: &str) -> Result<bool> {
        Ok(self.deployment.converged())
    }

    async fn get_namespaces(&self, _selector: Option<&str>) -> Result<Vec<String>> {
        Ok(vec!["istio-system".to_string()])
    }

    async fn restart_deployment(&self, _name: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn restart_daemon_set(&self, _name: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn restart_stateful_set(&self, _name: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn exec_in_pod(
        &self,
        _namespace: &str,
        _pod: &str,
        _command: &[String],
        _container: Option<&str>,
    ) -> Result<ExecOutput> {
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Metrics provider returning scripted scalars; names in `failing` error
/// out. Each metric holds a queue of values: queries pop the front until one
/// value remains, which then repeats. This lets a test serve one value to
/// the baseline snapshot and another to the post-upgrade snapshot.
#[derive(Default)]
pub(crate) struct ScriptedMetrics {
    pub scalars: Mutex<BTreeMap<String, VecDeque<f64>>>,
    pub failing: Vec<String>,
    pub alerts: Vec<AlertInfo>,
}

impl ScriptedMetrics {
    pub fn with_scalars(entries: &[(&str, f64)]) -> Self {
        Self {
            scalars: Mutex::new(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), VecDeque::from([*v])))
                    .collect(),
            ),
            failing: Vec::new(),
            alerts: Vec::new(),
        }
    }

    /// Serve `values` in order to successive queries, repeating the last.
    pub fn push_sequence(&self, name: &str, values: &[f64]) {
        self.scalars
            .lock()
            .expect("metrics mutex poisoned")
            .insert(name.to_string(), values.iter().copied().collect());
    }
}

#[async_trait]
impl MetricsProvider for ScriptedMetrics {
    async fn query_timeseries(
        &self,
        _metric_name: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _tags: &BTreeMap<String, String>,
        _aggregation: Option<Aggregation>,
    ) -> Result<Vec<MetricPoint>> {
        Ok(Vec::new())
    }

    async fn query_scalar(
        &self,
        metric_name: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _tags: &BTreeMap<String, String>,
        _aggregation: Aggregation,
    ) -> Result<f64> {
        if self.failing.iter().any(|f| f == metric_name) {
            return Err(GuardError::transient(format!(
                "query for '{metric_name}' failed"
            )));
        }
        let mut scalars = self.scalars.lock().expect("metrics mutex poisoned");
        let queue = scalars
            .get_mut(metric_name)
            .ok_or_else(|| GuardError::not_found(format!("metric '{metric_name}'")))?;
        let value = if queue.len() > 1 {
            queue.pop_front().expect("non-empty queue")
        } else {
            *queue.front().expect("non-empty queue")
        };
        Ok(value)
    }

    async fn query_statistics(
        &self,
        _metric_name: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _tags: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, f64>> {
        Ok(BTreeMap::new())
    }

    async fn check_active_alerts(
        &self,
        _tags: Option<&BTreeMap<String, String>>,
    ) -> Result<(bool, Vec<AlertInfo>)> {
        Ok((self.alerts.is_empty(), self.alerts.clone()))
    }

    async fn get_monitor_status(&self, _monitor_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn query_raw(
        &self,
        _query: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

/// Cloud provider that hands out canned answers.
#[derive(Default)]
pub(crate) struct ScriptedCloud;

#[async_trait]
impl CloudProvider for ScriptedCloud {
    async fn assume_role(&self, _role_ref: &str, _session_name: &str) -> Result<()> {
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<String> {
        Ok(format!("secret-{name}"))
    }

    async fn get_cluster_info(&self, name: &str) -> Result<ClusterInfo> {
        Ok(ClusterInfo {
            endpoint: format!("https://{name}.example"),
            ca_cert: "ca".to_string(),
            version: "1.29".to_string(),
            status: "ACTIVE".to_string(),
        })
    }

    async fn generate_cluster_token(&self, name: &str) -> Result<ClusterToken> {
        Ok(ClusterToken {
            token: format!("token-{name}"),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
            endpoint: format!("https://{name}.example"),
            ca_cert: "ca".to_string(),
        })
    }

    async fn list_clusters(&self, _region: Option<&str>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// GitOps stub: per-branch file trees, merge requests merge (or close)
/// after a scripted number of polls.
pub(crate) struct ScriptedGitOps {
    pub files: Mutex<BTreeMap<(String, String), String>>,
    pub merge_requests: Mutex<Vec<NewMergeRequest>>,
    pub branches: Mutex<Vec<String>>,
    pub polls_until_merge: Mutex<u32>,
    pub terminal_state: MergeRequestState,
}

impl ScriptedGitOps {
    pub fn merging_after(polls: u32) -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            merge_requests: Mutex::new(Vec::new()),
            branches: Mutex::new(Vec::new()),
            polls_until_merge: Mutex::new(polls),
            terminal_state: MergeRequestState::Merged,
        }
    }

    pub fn closing_after(polls: u32) -> Self {
        Self {
            terminal_state: MergeRequestState::Closed,
            ..Self::merging_after(polls)
        }
    }

    pub fn seed_file(&self, path: &str, content: &str) {
        self.files.lock().expect("poisoned").insert(
            ("main".to_string(), path.to_string()),
            content.to_string(),
        );
    }

    pub fn mr_count(&self) -> usize {
        self.merge_requests.lock().expect("poisoned").len()
    }
}

#[async_trait]
impl GitOpsProvider for ScriptedGitOps {
    async fn create_branch(&self, _repo: &str, branch: &str, from: &str) -> Result<()> {
        let mut files = self.files.lock().expect("poisoned");
        let copied: Vec<((String, String), String)> = files
            .iter()
            .filter(|((b, _), _)| b == from)
            .map(|((_, p), c)| ((branch.to_string(), p.clone()), c.clone()))
            .collect();
        files.extend(copied);
        self.branches.lock().expect("poisoned").push(branch.to_string());
        Ok(())
    }

    async fn get_file_content(&self, _repo: &str, path: &str, reference: &str) -> Result<String> {
        self.files
            .lock()
            .expect("poisoned")
            .get(&(reference.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| GuardError::not_found(format!("{reference}:{path}")))
    }

    async fn update_file(
        &self,
        _repo: &str,
        path: &str,
        content: &str,
        _message: &str,
        branch: &str,
    ) -> Result<()> {
        self.files.lock().expect("poisoned").insert(
            (branch.to_string(), path.to_string()),
            content.to_string(),
        );
        Ok(())
    }

    async fn create_merge_request(&self, request: NewMergeRequest) -> Result<MergeRequestInfo> {
        let mut mrs = self.merge_requests.lock().expect("poisoned");
        let id = mrs.len() as u64 + 1;
        let info = MergeRequestInfo {
            id,
            title: request.title.clone(),
            source_branch: request.source_branch.clone(),
            target_branch: request.target_branch.clone(),
            state: MergeRequestState::Open,
            web_url: format!("https://git.example/mr/{id}"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        mrs.push(request);
        Ok(info)
    }

    async fn get_merge_request(&self, _repo: &str, id: u64) -> Result<MergeRequestInfo> {
        let request = {
            let mrs = self.merge_requests.lock().expect("poisoned");
            mrs.get(id as usize - 1)
                .cloned()
                .ok_or_else(|| GuardError::not_found(format!("mr {id}")))?
        };

        let state = {
            let mut polls = self.polls_until_merge.lock().expect("poisoned");
            if *polls == 0 {
                self.terminal_state
            } else {
                *polls -= 1;
                MergeRequestState::Open
            }
        };

        Ok(MergeRequestInfo {
            id,
            title: request.title,
            source_branch: request.source_branch,
            target_branch: request.target_branch,
            state,
            web_url: format!("https://git.example/mr/{id}"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    async fn add_merge_request_comment(&self, _repo: &str, _id: u64, _comment: &str) -> Result<()> {
        Ok(())
    }

    async fn check_branch_exists(&self, _repo: &str, branch: &str) -> Result<bool> {
        Ok(self.branches.lock().expect("poisoned").iter().any(|b| b == branch))
    }
}

/// Connector handing out the same provider for every cluster.
pub(crate) struct StaticConnector {
    pub kubernetes: Arc<dyn KubernetesProvider>,
}

#[async_trait]
impl KubernetesConnector for StaticConnector {
    async fn connect(&self, _cluster: &ClusterRecord) -> Result<Arc<dyn KubernetesProvider>> {
        Ok(self.kubernetes.clone())
    }
}

/// Connector with a distinct provider per cluster id.
pub(crate) struct MapConnector {
    pub map: BTreeMap<String, Arc<dyn KubernetesProvider>>,
}

#[async_trait]
impl KubernetesConnector for MapConnector {
    async fn connect(&self, cluster: &ClusterRecord) -> Result<Arc<dyn KubernetesProvider>> {
        self.map
            .get(&cluster.cluster_id)
            .cloned()
            .ok_or_else(|| GuardError::provider_fatal(format!(
                "no access configured for '{}'",
                cluster.cluster_id
            )))
    }
}
