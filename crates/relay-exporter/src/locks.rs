//! Per-artifact locking.
//!
//! An export holds the lock for its artifact from before the pull until the
//! artifact has been advertised. The lock then becomes a lease that keeps the
//! artifact reserved for the importer that was told about it, until that
//! importer's `/cleanup` ends the lease or the lease runs out. Two exports
//! that map to the same file therefore never write it concurrently, a second
//! export never replaces a file that is still being fetched, and cleanup never
//! deletes a file that is being written.
//!
//! Entries are created on demand and pruned when the last holder, waiter or
//! lease goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relay_protocol::ArtifactName;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from lock operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("artifact {0} is busy")]
    Busy(ArtifactName),

    #[error("timed out after {after:?} waiting for artifact {name}")]
    Timeout { name: ArtifactName, after: Duration },
}

type LockMap = HashMap<ArtifactName, Arc<AsyncMutex<()>>>;

/// Lock held on behalf of an importer that has not cleaned up yet.
#[derive(Debug)]
struct Lease {
    id: Uuid,
    guard: OwnedMutexGuard<()>,
}

type LeaseMap = HashMap<ArtifactName, Lease>;

/// Registry of per-artifact locks and leases.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLocks {
    inner: Arc<Mutex<LockMap>>,
    leases: Arc<Mutex<LeaseMap>>,
}

impl ArtifactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `name` without waiting.
    pub fn try_acquire(&self, name: &ArtifactName) -> Result<ArtifactGuard, LockError> {
        let mutex = self.entry(name);
        let result = mutex.clone().try_lock_owned();
        match result {
            Ok(guard) => Ok(self.guard(name, guard)),
            Err(_) => {
                drop(mutex);
                self.prune(name);
                Err(LockError::Busy(name.clone()))
            }
        }
    }

    /// Take the lock for `name`, waiting up to `timeout`.
    ///
    /// Logs a warning when the lock is contended and again when it is
    /// finally acquired.
    pub async fn acquire(
        &self,
        name: &ArtifactName,
        timeout: Duration,
    ) -> Result<ArtifactGuard, LockError> {
        let mutex = self.entry(name);
        if let Ok(guard) = mutex.clone().try_lock_owned() {
            return Ok(self.guard(name, guard));
        }

        warn!(artifact = %name, "artifact busy, waiting for running operation");
        let start = Instant::now();

        let result = tokio::time::timeout(timeout, mutex.clone().lock_owned()).await;
        drop(mutex);
        match result {
            Ok(guard) => {
                info!(
                    artifact = %name,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "artifact lock acquired after contention"
                );
                Ok(self.guard(name, guard))
            }
            Err(_) => {
                self.prune(name);
                Err(LockError::Timeout {
                    name: name.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// End the lease on `name` and hand its lock to the caller.
    ///
    /// Returns `None` when the artifact is not leased.
    pub fn release(&self, name: &ArtifactName) -> Option<ArtifactGuard> {
        let lease = self.lease_map().remove(name)?;
        debug!(artifact = %name, lease = %lease.id, "lease released");
        Some(self.guard(name, lease.guard))
    }

    /// Number of artifacts currently held, waited on or leased.
    pub fn active(&self) -> usize {
        self.map().len()
    }

    /// Number of artifacts reserved for a pending cleanup.
    pub fn leased(&self) -> usize {
        self.lease_map().len()
    }

    fn hold(&self, name: &ArtifactName, guard: OwnedMutexGuard<()>, id: Uuid, ttl: Duration) {
        self.lease_map().insert(name.clone(), Lease { id, guard });
        info!(artifact = %name, lease = %id, ttl_secs = ttl.as_secs(), "artifact leased");

        let locks = self.clone();
        let name = name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            locks.expire(&name, id);
        });
    }

    /// Drop the lease `id` on `name` if it is still the current one.
    fn expire(&self, name: &ArtifactName, id: Uuid) {
        let expired = {
            let mut leases = self.lease_map();
            match leases.get(name) {
                Some(lease) if lease.id == id => leases.remove(name),
                _ => None,
            }
        };
        if let Some(lease) = expired {
            warn!(artifact = %name, lease = %lease.id, "lease expired without cleanup");
            drop(lease);
            self.prune(name);
        }
    }

    fn entry(&self, name: &ArtifactName) -> Arc<AsyncMutex<()>> {
        self.map()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn guard(&self, name: &ArtifactName, guard: OwnedMutexGuard<()>) -> ArtifactGuard {
        ArtifactGuard {
            name: name.clone(),
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Drop the entry for `name` if nobody else references it.
    fn prune(&self, name: &ArtifactName) {
        let mut map = self.map();
        if map
            .get(name)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            map.remove(name);
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, LockMap> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lease_map(&self) -> std::sync::MutexGuard<'_, LeaseMap> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive hold on one artifact. Released on drop.
#[derive(Debug)]
pub struct ArtifactGuard {
    name: ArtifactName,
    guard: Option<OwnedMutexGuard<()>>,
    locks: ArtifactLocks,
}

impl ArtifactGuard {
    pub fn name(&self) -> &ArtifactName {
        &self.name
    }

    /// Keep the artifact locked after this guard goes away, until
    /// [`ArtifactLocks::release`] is called for it or `ttl` passes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_lease(mut self, id: Uuid, ttl: Duration) {
        if let Some(guard) = self.guard.take() {
            self.locks.hold(&self.name, guard, id, ttl);
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.prune(&self.name);
    }
}
