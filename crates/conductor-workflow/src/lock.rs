//! Resource leases
//!
//! Mutually exclusive, TTL-bounded locks on named resources. The backend
//! provides one atomic conditional insert; the manager layers polling, lease
//! renewal and per-run bookkeeping on top of it.

use crate::{Result, WorkflowError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A live lease on a resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLock {
    pub resource_key: String,
    pub holder_run_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn new(resource_key: &str, holder_run_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            resource_key: resource_key.to_string(),
            holder_run_id: holder_run_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono_ttl(ttl),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

pub(crate) fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Result of a single acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(ResourceLock),
    /// Someone else holds a live lease
    Blocked(ResourceLock),
}

/// How long to keep trying when the resource is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Wait { timeout: Duration },
    FailFast,
}

/// Storage for leases. `try_acquire` must be atomic.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take the lease if it is free or expired. A holder re-acquiring extends it.
    async fn try_acquire(&self, key: &str, run_id: &str, ttl: Duration) -> Result<AcquireOutcome>;

    /// Extend a live lease held by `run_id`; `None` if it was lost
    async fn renew(&self, key: &str, run_id: &str, ttl: Duration) -> Result<Option<ResourceLock>>;

    /// Drop the lease if `run_id` holds it. Returns whether anything was released.
    async fn release(&self, key: &str, run_id: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<ResourceLock>>;

    /// Live leases held by a run
    async fn held_by(&self, run_id: &str) -> Result<Vec<ResourceLock>>;
}

/// Single-process lease backend
#[derive(Default)]
pub struct InMemoryLockBackend {
    locks: Mutex<HashMap<String, ResourceLock>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, run_id: &str, ttl: Duration) -> Result<AcquireOutcome> {
        let mut locks = self.locks.lock();

        if let Some(current) = locks.get_mut(key) {
            if !current.is_expired() {
                if current.holder_run_id != run_id {
                    return Ok(AcquireOutcome::Blocked(current.clone()));
                }
                current.expires_at = Utc::now() + chrono_ttl(ttl);
                return Ok(AcquireOutcome::Acquired(current.clone()));
            }
        }

        let lock = ResourceLock::new(key, run_id, ttl);
        locks.insert(key.to_string(), lock.clone());
        Ok(AcquireOutcome::Acquired(lock))
    }

    async fn renew(&self, key: &str, run_id: &str, ttl: Duration) -> Result<Option<ResourceLock>> {
        let mut locks = self.locks.lock();
        match locks.get_mut(key) {
            Some(lock) if lock.holder_run_id == run_id && !lock.is_expired() => {
                lock.expires_at = Utc::now() + chrono_ttl(ttl);
                Ok(Some(lock.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, key: &str, run_id: &str) -> Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(lock) if lock.holder_run_id == run_id => {
                let live = !lock.is_expired();
                locks.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<ResourceLock>> {
        Ok(self
            .locks
            .lock()
            .get(key)
            .filter(|lock| !lock.is_expired())
            .cloned())
    }

    async fn held_by(&self, run_id: &str) -> Result<Vec<ResourceLock>> {
        let mut held: Vec<ResourceLock> = self
            .locks
            .lock()
            .values()
            .filter(|lock| lock.holder_run_id == run_id && !lock.is_expired())
            .cloned()
            .collect();
        held.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(held)
    }
}

/// Lease keeper registry key: (run id, resource key)
type KeeperKey = (String, String);

/// Acquires, renews and releases leases for workflow runs
pub struct ResourceLockManager {
    backend: Arc<dyn LockBackend>,
    poll_interval: Duration,
    default_ttl: Duration,
    keepers: DashMap<KeeperKey, CancellationToken>,
}

impl ResourceLockManager {
    pub fn new(backend: Arc<dyn LockBackend>, poll_interval: Duration, default_ttl: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            default_ttl,
            keepers: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryLockBackend::new()),
            Duration::from_secs(1),
            Duration::from_secs(300),
        )
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Acquire a lease, polling while another run holds it in `Wait` mode.
    ///
    /// `on_blocked` runs once, the first time the resource is found taken.
    pub async fn acquire<F>(
        &self,
        key: &str,
        run_id: &str,
        ttl: Option<Duration>,
        mode: AcquireMode,
        cancel: &CancellationToken,
        on_blocked: F,
    ) -> Result<ResourceLock>
    where
        F: FnOnce(&ResourceLock) + Send,
    {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let deadline = match mode {
            AcquireMode::Wait { timeout } => Some(Instant::now() + timeout),
            AcquireMode::FailFast => None,
        };
        let mut on_blocked = Some(on_blocked);

        loop {
            let holder = match self.backend.try_acquire(key, run_id, ttl).await? {
                AcquireOutcome::Acquired(lock) => {
                    if cancel.is_cancelled() {
                        // The run ended while the backend call was in flight
                        self.backend.release(key, run_id).await?;
                        debug!(resource = %key, run_id = %run_id, "Lease dropped, run cancelled during acquire");
                        return Err(WorkflowError::Cancelled(format!("acquiring lease on {}", key)));
                    }
                    self.spawn_keeper(key, run_id, ttl, Some(cancel.clone()));
                    info!(resource = %key, run_id = %run_id, ttl_secs = ttl.as_secs(), "Lease acquired");
                    return Ok(lock);
                }
                AcquireOutcome::Blocked(holder) => holder,
            };

            let contention = || WorkflowError::LockContention {
                resource: key.to_string(),
                holder: holder.holder_run_id.clone(),
            };

            let Some(deadline) = deadline else {
                return Err(contention());
            };
            let now = Instant::now();
            if now >= deadline {
                warn!(resource = %key, run_id = %run_id, holder = %holder.holder_run_id, "Gave up waiting for lease");
                return Err(contention());
            }

            if let Some(notify) = on_blocked.take() {
                debug!(resource = %key, run_id = %run_id, holder = %holder.holder_run_id, "Waiting for lease");
                notify(&holder);
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WorkflowError::Cancelled(format!("waiting for lease on {}", key)));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Extend a lease held by `run_id`
    pub async fn renew(&self, key: &str, run_id: &str, ttl: Option<Duration>) -> Result<Option<ResourceLock>> {
        self.backend
            .renew(key, run_id, ttl.unwrap_or(self.default_ttl))
            .await
    }

    /// Release a lease. Releasing something not held is a warning, not an error.
    pub async fn release(&self, key: &str, run_id: &str) -> Result<bool> {
        if let Some((_, token)) = self.keepers.remove(&(run_id.to_string(), key.to_string())) {
            token.cancel();
        }

        let released = self.backend.release(key, run_id).await?;
        if released {
            info!(resource = %key, run_id = %run_id, "Lease released");
        } else {
            warn!(resource = %key, run_id = %run_id, "Release requested for a lease that was not held");
        }
        Ok(released)
    }

    /// Release every lease held by a run
    pub async fn release_all(&self, run_id: &str) -> Result<Vec<String>> {
        self.stop_keepers_for(run_id);

        let mut released = Vec::new();
        for lock in self.backend.held_by(run_id).await? {
            if self.backend.release(&lock.resource_key, run_id).await? {
                info!(resource = %lock.resource_key, run_id = %run_id, "Lease released");
                released.push(lock.resource_key);
            }
        }
        Ok(released)
    }

    /// Restart renewal for leases a run still holds, after a restart
    pub async fn resume_keepers(&self, run_id: &str) -> Result<usize> {
        let held = self.backend.held_by(run_id).await?;
        for lock in &held {
            if self
                .backend
                .renew(&lock.resource_key, run_id, self.default_ttl)
                .await?
                .is_some()
            {
                self.spawn_keeper(&lock.resource_key, run_id, self.default_ttl, None);
            }
        }
        Ok(held.len())
    }

    /// Stop renewing without releasing. Leases then lapse at their TTL.
    pub fn stop_keepers(&self) {
        for entry in self.keepers.iter() {
            entry.value().cancel();
        }
        self.keepers.clear();
    }

    pub async fn get(&self, key: &str) -> Result<Option<ResourceLock>> {
        self.backend.get(key).await
    }

    pub async fn holdings(&self, run_id: &str) -> Result<Vec<ResourceLock>> {
        self.backend.held_by(run_id).await
    }

    fn stop_keepers_for(&self, run_id: &str) {
        self.keepers.retain(|(holder, _), token| {
            if holder == run_id {
                token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Renew at half the TTL until released. With `owner`, renewal also stops
    /// once the owning run's token fires.
    fn spawn_keeper(&self, key: &str, run_id: &str, ttl: Duration, owner: Option<CancellationToken>) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .keepers
            .insert((run_id.to_string(), key.to_string()), token.clone())
        {
            previous.cancel();
        }

        let backend = self.backend.clone();
        let key = key.to_string();
        let run_id = run_id.to_string();
        let interval = (ttl / 2).max(Duration::from_millis(10));
        let owner = owner.unwrap_or_default();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = owner.cancelled() => {
                        debug!(resource = %key, run_id = %run_id, "Owning run cancelled, renewal stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                match backend.renew(&key, &run_id, ttl).await {
                    Ok(Some(lock)) => {
                        debug!(resource = %key, run_id = %run_id, expires_at = %lock.expires_at, "Lease renewed");
                    }
                    Ok(None) => {
                        warn!(resource = %key, run_id = %run_id, "Lease lost before renewal");
                        break;
                    }
                    Err(e) => {
                        warn!(resource = %key, run_id = %run_id, error = %e, "Lease renewal failed");
                    }
                }
            }
        });
    }
}
