//! State store abstraction for cluster records.
//!
//! This module provides the trait-based port onto the strongly consistent
//! KV store holding cluster state, plus the in-memory adapter used for tests
//! and dry runs. Real deployments plug in a wide-column store with
//! conditional writes behind the same trait.
//!
//! Every mutation is a read-modify-conditional-write on the record's `rev`;
//! there is no unconditional update path.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{GuardError, Result};
use crate::types::{ClusterRecord, ClusterStatus};

/// A cluster record paired with the revision it was read at.
///
/// `rev` is the optimistic-concurrency token: strictly increasing on every
/// accepted mutation, and required by [`StateStore::compare_and_swap`].
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub record: ClusterRecord,
    pub rev: u64,
}

/// Port onto the persistent cluster registry.
///
/// Guarantees required of implementations: linearizable reads and writes per
/// `cluster_id`, and atomic multi-field updates within one
/// `compare_and_swap`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch a record and its current revision.
    async fn get(&self, cluster_id: &str) -> Result<VersionedRecord>;

    /// List records, optionally filtered by batch and/or status.
    async fn list(
        &self,
        batch_id: Option<&str>,
        status: Option<ClusterStatus>,
    ) -> Result<Vec<VersionedRecord>>;

    /// Create a record that must not already exist. Returns the initial rev.
    async fn put_new(&self, record: ClusterRecord) -> Result<u64>;

    /// Replace the record iff its stored revision equals `expected_rev`.
    /// Returns the new revision on success, `Conflict` when the revision
    /// moved, `NotFound` when the record is gone.
    async fn compare_and_swap(
        &self,
        cluster_id: &str,
        expected_rev: u64,
        record: ClusterRecord,
    ) -> Result<u64>;

    /// Administrative removal. Upgrade logic never calls this.
    async fn delete(&self, cluster_id: &str) -> Result<()>;
}

/// In-memory [`StateStore`] with per-key linearizability.
///
/// The default backend for tests and `--dry-run` invocations.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, (ClusterRecord, u64)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, assigning each record revision 1.
    pub fn with_records(records: impl IntoIterator<Item = ClusterRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock().expect("state store mutex poisoned");
            for record in records {
                map.insert(record.cluster_id.clone(), (record, 1));
            }
        }
        store
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, cluster_id: &str) -> Result<VersionedRecord> {
        let map = self.records.lock().expect("state store mutex poisoned");
        map.get(cluster_id)
            .map(|(record, rev)| VersionedRecord {
                record: record.clone(),
                rev: *rev,
            })
            .ok_or_else(|| GuardError::not_found(format!("cluster '{cluster_id}'")))
    }

    async fn list(
        &self,
        batch_id: Option<&str>,
        status: Option<ClusterStatus>,
    ) -> Result<Vec<VersionedRecord>> {
        let map = self.records.lock().expect("state store mutex poisoned");
        Ok(map
            .values()
            .filter(|(record, _)| batch_id.is_none_or(|b| record.batch_id == b))
            .filter(|(record, _)| status.is_none_or(|s| record.status == s))
            .map(|(record, rev)| VersionedRecord {
                record: record.clone(),
                rev: *rev,
            })
            .collect())
    }

    async fn put_new(&self, record: ClusterRecord) -> Result<u64> {
        let mut map = self.records.lock().expect("state store mutex poisoned");
        if map.contains_key(&record.cluster_id) {
            return Err(GuardError::conflict(format!(
                "cluster '{}' already exists",
                record.cluster_id
            )));
        }
        map.insert(record.cluster_id.clone(), (record, 1));
        Ok(1)
    }

    async fn compare_and_swap(
        &self,
        cluster_id: &str,
        expected_rev: u64,
        record: ClusterRecord,
    ) -> Result<u64> {
        let mut map = self.records.lock().expect("state store mutex poisoned");
        let Some((stored, rev)) = map.get_mut(cluster_id) else {
            return Err(GuardError::not_found(format!("cluster '{cluster_id}'")));
        };

        if *rev != expected_rev {
            return Err(GuardError::conflict(format!(
                "cluster '{cluster_id}' is at rev {} but caller expected {expected_rev}",
                *rev
            )));
        }

        *stored = record;
        *rev += 1;
        Ok(*rev)
    }

    async fn delete(&self, cluster_id: &str) -> Result<()> {
        let mut map = self.records.lock().expect("state store mutex poisoned");
        map.remove(cluster_id)
            .map(|_| ())
            .ok_or_else(|| GuardError::not_found(format!("cluster '{cluster_id}'")))
    }
}
