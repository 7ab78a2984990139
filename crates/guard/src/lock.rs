//! Distributed lock with fencing tokens and lease renewal.
//!
//! Serializes mutating work on a cluster across orchestrator processes. Each
//! acquisition is handed a fencing token that increases strictly per
//! resource, across lease expiries, clean releases, and process restarts, so
//! a stale holder can always be rejected downstream.
//!
//! Releasing writes an expired tombstone rather than deleting the row: the
//! lease ends immediately, but the token counter survives for the next
//! acquirer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock, mint_owner_id};
use crate::error::{GuardError, Result};

/// Pause between polls while waiting for a held lock to expire.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Persistent state of one lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub resource_id: String,
    pub owner: String,
    pub fencing_token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Port onto the lock table. All writes are conditional.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn get(&self, resource_id: &str) -> Result<Option<LockRecord>>;

    /// Write `record` iff the stored token still equals `expected_token`
    /// (`None` = no row yet) and any stored lease has expired. `Conflict`
    /// when another acquirer won the race, `LockHeld` when the lease is
    /// still live.
    async fn acquire_if(
        &self,
        resource_id: &str,
        expected_token: Option<u64>,
        record: LockRecord,
    ) -> Result<()>;

    /// Move `expires_at` forward iff owner and token match and the lease is
    /// still live. `LockLost` otherwise.
    async fn extend_if(
        &self,
        resource_id: &str,
        owner: &str,
        token: u64,
        new_expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// End the lease iff owner and token match, keeping the token counter.
    /// `LockLost` otherwise.
    async fn release_if(&self, resource_id: &str, owner: &str, token: u64) -> Result<()>;
}

/// In-memory [`LockStore`] with the same conditional-write semantics a
/// transact-write KV table provides.
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, LockRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, resource_id: &str) -> Result<Option<LockRecord>> {
        let locks = self.locks.lock().expect("lock store mutex poisoned");
        Ok(locks.get(resource_id).cloned())
    }

    async fn acquire_if(
        &self,
        resource_id: &str,
        expected_token: Option<u64>,
        record: LockRecord,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().expect("lock store mutex poisoned");

        match locks.get(resource_id) {
            Some(stored) => {
                if stored.is_live(now) {
                    return Err(GuardError::LockHeld(format!(
                        "'{resource_id}' held by {} until {}",
                        stored.owner, stored.expires_at
                    )));
                }
                if expected_token != Some(stored.fencing_token) {
                    return Err(GuardError::conflict(format!(
                        "lock '{resource_id}' token moved to {}",
                        stored.fencing_token
                    )));
                }
            }
            None => {
                if expected_token.is_some() {
                    return Err(GuardError::conflict(format!(
                        "lock '{resource_id}' no longer exists"
                    )));
                }
            }
        }

        locks.insert(resource_id.to_string(), record);
        Ok(())
    }

    async fn extend_if(
        &self,
        resource_id: &str,
        owner: &str,
        token: u64,
        new_expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().expect("lock store mutex poisoned");

        match locks.get_mut(resource_id) {
            Some(stored)
                if stored.owner == owner && stored.fencing_token == token && stored.is_live(now) =>
            {
                stored.expires_at = new_expires_at;
                Ok(())
            }
            Some(stored) => Err(GuardError::LockLost(format!(
                "'{resource_id}': stored owner {} token {} (lease live: {})",
                stored.owner,
                stored.fencing_token,
                stored.is_live(now)
            ))),
            None => Err(GuardError::LockLost(format!("'{resource_id}' has no lock row"))),
        }
    }

    async fn release_if(&self, resource_id: &str, owner: &str, token: u64) -> Result<()> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().expect("lock store mutex poisoned");

        match locks.get_mut(resource_id) {
            Some(stored) if stored.owner == owner && stored.fencing_token == token => {
                // Tombstone: lease over, token preserved for the next holder.
                stored.expires_at = now;
                Ok(())
            }
            _ => Err(GuardError::LockLost(format!(
                "'{resource_id}' not held by {owner} with token {token}"
            ))),
        }
    }
}

/// A held lease: the proof of exclusivity the engine carries through an
/// upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource_id: String,
    pub owner: String,
    pub fencing_token: u64,
    pub expires_at: DateTime<Utc>,
}

/// How long an acquire may block on a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireWait {
    /// Fail with `LockHeld` immediately.
    NoWait,
    /// Poll until the live lease expires, up to this ceiling.
    WaitUpTo(Duration),
}

/// Cluster-scoped mutual exclusion over a [`LockStore`].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Acquire the lock on `resource_id` for `lease`, minting a fresh owner
    /// id and the next fencing token.
    pub async fn acquire(
        &self,
        resource_id: &str,
        lease: Duration,
        wait: AcquireWait,
    ) -> Result<LockHandle> {
        let deadline = match wait {
            AcquireWait::NoWait => None,
            AcquireWait::WaitUpTo(limit) => Some(tokio::time::Instant::now() + limit),
        };

        loop {
            let current = self.store.get(resource_id).await?;
            let now = self.clock.now();

            if let Some(stored) = &current {
                if stored.is_live(now) {
                    match deadline {
                        None => {
                            return Err(GuardError::LockHeld(format!(
                                "'{resource_id}' held by {} until {}",
                                stored.owner, stored.expires_at
                            )));
                        }
                        Some(deadline) if tokio::time::Instant::now() >= deadline => {
                            return Err(GuardError::timeout(format!(
                                "gave up waiting for lock '{resource_id}'"
                            )));
                        }
                        Some(_) => {
                            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
                            continue;
                        }
                    }
                }
            }

            let expected_token = current.as_ref().map(|c| c.fencing_token);
            let record = LockRecord {
                resource_id: resource_id.to_string(),
                owner: mint_owner_id(),
                fencing_token: expected_token.unwrap_or(0) + 1,
                acquired_at: now,
                expires_at: now + lease_duration(lease),
            };

            match self
                .store
                .acquire_if(resource_id, expected_token, record.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        resource_id = %resource_id,
                        owner = %record.owner,
                        fencing_token = record.fencing_token,
                        "lock_acquired"
                    );
                    return Ok(LockHandle {
                        resource_id: record.resource_id,
                        owner: record.owner,
                        fencing_token: record.fencing_token,
                        expires_at: record.expires_at,
                    });
                }
                // Lost the creation race or the lease came back to life;
                // re-read and decide again.
                Err(GuardError::Conflict(_)) | Err(GuardError::LockHeld(_)) => {
                    if deadline.is_none() {
                        let refreshed = self.store.get(resource_id).await?;
                        if refreshed.is_some_and(|r| r.is_live(self.clock.now())) {
                            return Err(GuardError::LockHeld(format!(
                                "'{resource_id}' was taken by a concurrent acquirer"
                            )));
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Push the lease forward. Fails with `LockLost` when another owner or
    /// token holds the row, or the lease already expired.
    pub async fn extend(&self, handle: &mut LockHandle, lease: Duration) -> Result<()> {
        let new_expires_at = self.clock.now() + lease_duration(lease);
        self.store
            .extend_if(
                &handle.resource_id,
                &handle.owner,
                handle.fencing_token,
                new_expires_at,
            )
            .await?;
        handle.expires_at = new_expires_at;
        debug!(
            resource_id = %handle.resource_id,
            fencing_token = handle.fencing_token,
            "lock_extended"
        );
        Ok(())
    }

    /// End the lease. The token counter is preserved for the next acquirer.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        self.store
            .release_if(&handle.resource_id, &handle.owner, handle.fencing_token)
            .await?;
        info!(
            resource_id = %handle.resource_id,
            fencing_token = handle.fencing_token,
            "lock_released"
        );
        Ok(())
    }

    /// Keep the lease alive in the background until `stop` fires or an
    /// extension fails. A failed extension cancels `abort`, signalling the
    /// holder to stop all in-flight work for the resource.
    pub fn spawn_auto_renew(
        &self,
        mut handle: LockHandle,
        lease: Duration,
        interval: Duration,
        stop: CancellationToken,
        abort: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match manager.extend(&mut handle, lease).await {
                            Ok(()) => {}
                            Err(err) => {
                                warn!(
                                    resource_id = %handle.resource_id,
                                    error = %err,
                                    "lock_renewal_failed"
                                );
                                abort.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

fn lease_duration(lease: Duration) -> ChronoDuration {
    ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(3600))
}
