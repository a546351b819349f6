use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::StorageError;

/// Proof of holding a resource lock, returned by [`LockManager::acquire`].
///
/// The `holder_id` is unique per acquisition, so a lease that outlived its
/// lock (forced expiry) cannot release the lock of whoever holds it next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub resource_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// Result of a lock release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockReleaseResult {
    /// Whether the lease still owned the lock and released it.
    pub released: bool,
    /// Empty on success, otherwise `not_held` or `not_owner`.
    pub reason: String,
}

impl LockReleaseResult {
    pub fn released() -> Self {
        Self {
            released: true,
            reason: String::new(),
        }
    }

    /// The resource has no holder (the lease expired and nobody took over).
    pub fn not_held() -> Self {
        Self {
            released: false,
            reason: "not_held".to_string(),
        }
    }

    /// Another holder owns the resource now.
    pub fn not_owner() -> Self {
        Self {
            released: false,
            reason: "not_owner".to_string(),
        }
    }
}

/// Diagnostic snapshot of a held resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Callers queued behind the holder.
    pub waiters: usize,
}

/// Mutual exclusion keyed by arbitrary resource names.
///
/// The document store locks each collection under its own name; other
/// callers can guard unrelated critical sections (e.g. `quota:{user_id}`)
/// with the same manager by picking distinct names.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns the lock implementation identifier.
    fn lock_type(&self) -> &'static str;

    /// Acquire `resource_id`, waiting at most `timeout`.
    ///
    /// Waiters for the same resource are served in arrival order. On
    /// `StorageError::LockTimeout` the caller never held the lock.
    async fn acquire(&self, resource_id: &str, timeout: Duration)
        -> Result<LockLease, StorageError>;

    /// Release the lock held by `lease` and hand it to the next waiter.
    ///
    /// Releasing a lease that no longer owns the lock is not an error; the
    /// result reports why nothing was released.
    async fn release(&self, lease: &LockLease) -> Result<LockReleaseResult, StorageError>;

    /// Current holder of `resource_id`, if any.
    async fn holder(&self, resource_id: &str) -> Result<Option<LockHolder>, StorageError>;
}

/// Run `work` while holding `resource_id`.
///
/// The lock is released whether `work` succeeds or fails. An error from
/// `work` takes precedence over a release error.
///
/// If the returned future is dropped while `work` runs, nothing releases the
/// lease and the resource stays held until the manager expires it. Callers
/// that can be cancelled should drive this from a spawned task.
pub async fn with_lock<L, T, F, Fut>(
    locks: &L,
    resource_id: &str,
    timeout: Duration,
    work: F,
) -> Result<T, StorageError>
where
    L: LockManager + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let lease = locks.acquire(resource_id, timeout).await?;
    let result = work().await;

    match locks.release(&lease).await {
        Ok(release) if release.released => {
            debug!("Critical section on {} done", resource_id);
            result
        }
        Ok(release) => {
            warn!(
                "Lock on {} expired before holder {} finished ({})",
                resource_id, lease.holder_id, release.reason
            );
            result
        }
        Err(e) => match result {
            Ok(_) => Err(e),
            Err(work_err) => {
                warn!("Failed to release lock on {}: {}", resource_id, e);
                Err(work_err)
            }
        },
    }
}
