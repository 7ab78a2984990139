//! GitOps change producer.
//!
//! The core never mutates clusters directly: version changes are proposed as
//! merge requests against the desired-state repository, and the external
//! reconciler applies whatever lands on the default branch. Two symmetric
//! flows live here: the draft upgrade MR, and the non-draft, high-priority
//! rollback MR whose branch name is pinned to the rollback transition time
//! so that retries reuse one branch instead of minting siblings.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::error::{GuardError, Result};
use crate::providers::{GitOpsProvider, MergeRequestInfo, NewMergeRequest};
use crate::types::{ClusterRecord, FieldUpdate, UpgradeSpec};

/// Set `update`'s value at its dotted path inside `doc`.
///
/// Every intermediate level must already be a mapping; `create_missing`
/// additionally creates absent intermediate mappings (used for document
/// initialisation, not upgrades). The leaf value replaces whatever existed;
/// sibling keys are preserved.
pub fn apply_update(doc: &mut Value, update: &FieldUpdate, create_missing: bool) -> Result<()> {
    let segments: Vec<&str> = update.segments().collect();
    let (leaf, intermediates) = segments.split_last().expect("validated path is non-empty");

    let mut cursor = doc;
    for segment in intermediates {
        let mapping = cursor.as_mapping_mut().ok_or_else(|| {
            GuardError::invalid_input(format!(
                "cannot descend into '{segment}' in path '{}': not a mapping",
                update.path()
            ))
        })?;

        let key = Value::String((*segment).to_string());
        if !mapping.contains_key(&key) {
            if create_missing {
                mapping.insert(key.clone(), Value::Mapping(Mapping::new()));
            } else {
                return Err(GuardError::not_found(format!(
                    "intermediate '{segment}' missing in path '{}'",
                    update.path()
                )));
            }
        }
        cursor = mapping.get_mut(&key).expect("key inserted or present");
    }

    let mapping = cursor.as_mapping_mut().ok_or_else(|| {
        GuardError::invalid_input(format!(
            "cannot set '{leaf}' in path '{}': parent is not a mapping",
            update.path()
        ))
    })?;
    mapping.insert(Value::String((*leaf).to_string()), update.value().clone());
    Ok(())
}

/// Read the value at a dotted path, if present.
pub fn read_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = doc;
    for segment in path.split('.') {
        cursor = cursor.as_mapping()?.get(Value::String(segment.to_string()))?;
    }
    Some(cursor)
}

/// Settings for branch and document conventions.
#[derive(Debug, Clone)]
pub struct GitOpsSettings {
    /// Branch merge requests target and branches fork from.
    pub default_branch: String,
    /// Dotted path of the mesh version inside the desired-state document.
    pub version_path: String,
}

impl Default for GitOpsSettings {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            version_path: "spec.chart.spec.version".to_string(),
        }
    }
}

/// Produces upgrade and rollback merge requests through the GitOps port.
pub struct ChangeProducer {
    provider: Arc<dyn GitOpsProvider>,
    settings: GitOpsSettings,
}

impl ChangeProducer {
    pub fn new(provider: Arc<dyn GitOpsProvider>, settings: GitOpsSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &GitOpsSettings {
        &self.settings
    }

    /// Apply `spec` to the cluster's desired-state document on a fresh
    /// branch and open a draft merge request assigned to the reviewer.
    pub async fn open_upgrade_mr(
        &self,
        cluster: &ClusterRecord,
        spec: &UpgradeSpec,
    ) -> Result<MergeRequestInfo> {
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let branch = format!(
            "upgrade/{}-{}-{}",
            spec.version(),
            cluster.batch_id,
            &short_id[..8]
        );

        info!(
            cluster_id = %cluster.cluster_id,
            target_version = spec.version(),
            branch = %branch,
            "creating_upgrade_mr"
        );

        self.provider
            .create_branch(&cluster.gitops_repo, &branch, &self.settings.default_branch)
            .await?;

        let content = self
            .provider
            .get_file_content(&cluster.gitops_repo, &cluster.config_path, &branch)
            .await?;
        let updated = self.apply_spec(&content, spec)?;

        let commit_message = format!(
            "Upgrade Istio to {} for {}\n\nCluster: {}\nManaged by guard.",
            spec.version(),
            cluster.batch_id,
            cluster.cluster_id
        );
        self.provider
            .update_file(
                &cluster.gitops_repo,
                &cluster.config_path,
                &updated,
                &commit_message,
                &branch,
            )
            .await?;

        let description = format!(
            "## Istio upgrade: {target}\n\n\
             **Cluster**: {cluster_id}\n\
             **Batch**: {batch}\n\
             **Current version**: {current}\n\n\
             ### Checklist\n\
             - [ ] Review the pre-upgrade health report\n\
             - [ ] Verify telemetry dashboards\n\
             - [ ] Approve and merge to proceed\n",
            target = spec.version(),
            cluster_id = cluster.cluster_id,
            batch = cluster.batch_id,
            current = cluster.current_version,
        );

        let mr = self
            .provider
            .create_merge_request(NewMergeRequest {
                repository: cluster.gitops_repo.clone(),
                source_branch: branch,
                target_branch: self.settings.default_branch.clone(),
                title: format!("Istio {} upgrade for {}", spec.version(), cluster.batch_id),
                description,
                draft: true,
                assignees: vec![cluster.reviewer_handle.clone()],
            })
            .await?;

        info!(cluster_id = %cluster.cluster_id, mr_url = %mr.web_url, "upgrade_mr_created");
        Ok(mr)
    }

    /// Open the rollback merge request resetting the version path to
    /// `previous_version`. The branch name is pinned to `pinned_at` (the
    /// rollback transition time), so a retried call finds the branch already
    /// there and reuses it instead of creating a second one.
    pub async fn open_rollback_mr(
        &self,
        cluster: &ClusterRecord,
        failed_version: &str,
        previous_version: &str,
        failure_reason: &str,
        failed_metrics: &BTreeMap<String, Option<f64>>,
        pinned_at: DateTime<Utc>,
    ) -> Result<MergeRequestInfo> {
        let branch = format!(
            "rollback/{}-{}-{}",
            previous_version,
            cluster.batch_id,
            pinned_at.format("%Y%m%d-%H%M%S")
        );

        info!(
            cluster_id = %cluster.cluster_id,
            previous_version,
            branch = %branch,
            "creating_rollback_mr"
        );

        let exists = self
            .provider
            .check_branch_exists(&cluster.gitops_repo, &branch)
            .await?;
        if exists {
            debug!(branch = %branch, "rollback_branch_reused");
        } else {
            self.provider
                .create_branch(&cluster.gitops_repo, &branch, &self.settings.default_branch)
                .await?;
        }

        let content = self
            .provider
            .get_file_content(&cluster.gitops_repo, &cluster.config_path, &branch)
            .await?;
        let spec = UpgradeSpec::version_bump(previous_version, &self.settings.version_path)?;
        let updated = self.apply_spec(&content, &spec)?;

        let metrics_block = if failed_metrics.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = failed_metrics
                .iter()
                .map(|(name, value)| match value {
                    Some(v) => format!("- {name}: {v:.4}"),
                    None => format!("- {name}: unavailable"),
                })
                .collect();
            format!("\n\nFailure metrics:\n{}", lines.join("\n"))
        };

        let commit_message = format!(
            "Rollback Istio from {failed_version} to {previous_version} for {}\n\n\
             Reason: {failure_reason}{metrics_block}\n\n\
             Automated rollback created by guard.",
            cluster.batch_id
        );
        self.provider
            .update_file(
                &cluster.gitops_repo,
                &cluster.config_path,
                &updated,
                &commit_message,
                &branch,
            )
            .await?;

        let description = format!(
            "## Automated rollback\n\n\
             **Cluster**: {cluster_id}\n\
             **Batch**: {batch}\n\
             **Rollback**: {failed_version} -> {previous_version}\n\n\
             ### Failure reason\n{failure_reason}{metrics_block}\n\n\
             ### Action required\n\
             This is an emergency rollback MR. Review and merge as soon as possible.\n",
            cluster_id = cluster.cluster_id,
            batch = cluster.batch_id,
        );

        let mr = self
            .provider
            .create_merge_request(NewMergeRequest {
                repository: cluster.gitops_repo.clone(),
                source_branch: branch,
                target_branch: self.settings.default_branch.clone(),
                title: format!(
                    "[ROLLBACK] Istio {failed_version} -> {previous_version} ({})",
                    cluster.batch_id
                ),
                description,
                draft: false,
                assignees: vec![cluster.reviewer_handle.clone()],
            })
            .await?;

        info!(cluster_id = %cluster.cluster_id, mr_url = %mr.web_url, "rollback_mr_created");
        Ok(mr)
    }

    fn apply_spec(&self, content: &str, spec: &UpgradeSpec) -> Result<String> {
        let mut doc: Value = serde_yaml::from_str(content)
            .map_err(|e| GuardError::invalid_input(format!("desired-state document: {e}")))?;

        for update in spec.updates() {
            apply_update(&mut doc, update, false)?;
        }

        serde_yaml::to_string(&doc)
            .map_err(|e| GuardError::invalid_input(format!("serializing document: {e}")))
    }
}
