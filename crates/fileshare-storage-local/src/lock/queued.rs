use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileshare_storage_core::{LockHolder, LockLease, LockManager, LockReleaseResult, StorageError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Default maximum time a holder may keep a lock before it is force-released.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_secs(30);

/// In-process lock manager with FIFO wait queues and forced expiry.
///
/// Each resource is either free (no entry in the registry) or held by one
/// holder with a queue of waiters behind it. Releasing hands the lock straight
/// to the oldest live waiter; when nobody waits the entry is dropped, so idle
/// resources cost nothing.
///
/// Every grant schedules an expiry task. If the holder has not released after
/// `max_hold`, the lock is taken away and passed on. Work still running under
/// the expired lease is not undone.
///
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct QueuedLockManager {
    inner: Arc<Registry>,
}

struct Registry {
    max_hold: Duration,
    /// Held resources: resource_id -> (holder, waiters)
    resources: Mutex<HashMap<String, ResourceState>>,
}

struct ResourceState {
    holder: Holder,
    waiters: VecDeque<Waiter>,
}

struct Holder {
    holder_id: String,
    acquired_at: DateTime<Utc>,
    expiry: Option<JoinHandle<()>>,
}

struct Waiter {
    holder_id: String,
    grant: oneshot::Sender<DateTime<Utc>>,
}

impl QueuedLockManager {
    /// Create a manager that force-releases locks held longer than `max_hold`.
    pub fn new(max_hold: Duration) -> Self {
        Self {
            inner: Arc::new(Registry {
                max_hold,
                resources: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Maximum hold duration before forced expiry.
    pub fn max_hold(&self) -> Duration {
        self.inner.max_hold
    }

    /// Number of resources currently held (0 when idle).
    pub fn tracked_resources(&self) -> usize {
        self.inner
            .registry()
            .map(|resources| resources.len())
            .unwrap_or(0)
    }
}

impl Default for QueuedLockManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HOLD)
    }
}

impl std::fmt::Debug for QueuedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedLockManager")
            .field("max_hold", &self.inner.max_hold)
            .field("tracked_resources", &self.tracked_resources())
            .finish()
    }
}

impl Registry {
    fn registry(&self) -> Result<MutexGuard<'_, HashMap<String, ResourceState>>, StorageError> {
        self.resources
            .lock()
            .map_err(|_| StorageError::Lock("lock registry poisoned".to_string()))
    }

    /// Start the forced-expiry timer for a fresh grant.
    ///
    /// Outside a tokio runtime there is nothing to run the timer on; the lock
    /// is then only freed by release.
    fn schedule_expiry(
        self: &Arc<Self>,
        resource_id: &str,
        holder_id: &str,
    ) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to expire lock on {} held by {}", resource_id, holder_id);
            return None;
        };
        let registry: Weak<Self> = Arc::downgrade(self);
        let resource_id = resource_id.to_string();
        let holder_id = holder_id.to_string();
        let max_hold = self.max_hold;

        Some(runtime.spawn(async move {
            tokio::time::sleep(max_hold).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&resource_id, &holder_id);
            }
        }))
    }

    fn expire(self: &Arc<Self>, resource_id: &str, holder_id: &str) {
        let mut resources = match self.registry() {
            Ok(resources) => resources,
            Err(e) => {
                warn!("Cannot expire lock on {}: {}", resource_id, e);
                return;
            }
        };

        let still_held = resources
            .get(resource_id)
            .is_some_and(|state| state.holder.holder_id == holder_id);
        if !still_held {
            return;
        }

        warn!(
            "Lock on {} held by {} exceeded {:?}, forcing release",
            resource_id, holder_id, self.max_hold
        );
        self.hand_off(&mut resources, resource_id);
    }

    /// Pass `resource_id` to the oldest live waiter, or free it.
    ///
    /// Waiters whose receiver is gone (cancelled callers) are skipped.
    fn hand_off(self: &Arc<Self>, resources: &mut HashMap<String, ResourceState>, resource_id: &str) {
        let Some(state) = resources.get_mut(resource_id) else {
            return;
        };
        if let Some(expiry) = &state.holder.expiry {
            expiry.abort();
        }

        while let Some(waiter) = state.waiters.pop_front() {
            let acquired_at = Utc::now();
            if waiter.grant.send(acquired_at).is_err() {
                debug!(
                    "Waiter {} on {} went away, skipping",
                    waiter.holder_id, resource_id
                );
                continue;
            }

            debug!(
                "Handed lock on {} to {} ({} still waiting)",
                resource_id,
                waiter.holder_id,
                state.waiters.len()
            );
            state.holder = Holder {
                expiry: self.schedule_expiry(resource_id, &waiter.holder_id),
                holder_id: waiter.holder_id,
                acquired_at,
            };
            return;
        }

        resources.remove(resource_id);
        debug!("Lock on {} is free", resource_id);
    }
}

/// Cleans up after a queued `acquire` whose future is dropped before it returns.
///
/// The waiter is either still queued, or was already handed the lock but
/// never saw the grant. Either way the resource moves on without it.
struct PendingGrant {
    registry: Arc<Registry>,
    resource_id: String,
    holder_id: String,
    armed: bool,
}

impl PendingGrant {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut resources = match self.registry.registry() {
            Ok(resources) => resources,
            Err(e) => {
                warn!("Cannot clean up waiter on {}: {}", self.resource_id, e);
                return;
            }
        };
        let Some(state) = resources.get_mut(&self.resource_id) else {
            return;
        };

        if let Some(pos) = state.waiters.iter().position(|w| w.holder_id == self.holder_id) {
            state.waiters.remove(pos);
            debug!("Waiter {} on {} cancelled", self.holder_id, self.resource_id);
            return;
        }

        let granted = state.holder.holder_id == self.holder_id;
        if granted {
            debug!(
                "Lock on {} was granted to cancelled waiter {}, passing it on",
                self.resource_id, self.holder_id
            );
            self.registry.hand_off(&mut resources, &self.resource_id);
        }
    }
}

#[async_trait]
impl LockManager for QueuedLockManager {
    fn lock_type(&self) -> &'static str {
        "queued"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<LockLease, StorageError> {
        let holder_id = Uuid::new_v4().to_string();

        let mut grant = {
            let mut resources = self.inner.registry()?;
            match resources.entry(resource_id.to_string()) {
                Entry::Vacant(slot) => {
                    let acquired_at = Utc::now();
                    slot.insert(ResourceState {
                        holder: Holder {
                            holder_id: holder_id.clone(),
                            acquired_at,
                            expiry: self.inner.schedule_expiry(resource_id, &holder_id),
                        },
                        waiters: VecDeque::new(),
                    });
                    debug!("Acquired lock on {} for {}", resource_id, holder_id);
                    return Ok(LockLease {
                        resource_id: resource_id.to_string(),
                        holder_id,
                        acquired_at,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let (tx, rx) = oneshot::channel();
                    let state = slot.get_mut();
                    state.waiters.push_back(Waiter {
                        holder_id: holder_id.clone(),
                        grant: tx,
                    });
                    debug!(
                        "Lock on {} held by {}, {} queued at position {}",
                        resource_id,
                        state.holder.holder_id,
                        holder_id,
                        state.waiters.len()
                    );
                    rx
                }
            }
        };

        let mut pending = PendingGrant {
            registry: Arc::clone(&self.inner),
            resource_id: resource_id.to_string(),
            holder_id: holder_id.clone(),
            armed: true,
        };

        let lease = |acquired_at| LockLease {
            resource_id: resource_id.to_string(),
            holder_id: holder_id.clone(),
            acquired_at,
        };

        let waited = tokio::time::timeout(timeout, &mut grant).await;
        pending.disarm();

        match waited {
            Ok(Ok(acquired_at)) => Ok(lease(acquired_at)),
            Ok(Err(_)) => Err(StorageError::Lock(format!(
                "Wait queue for {} dropped before {} was granted",
                resource_id, holder_id
            ))),
            Err(_) => {
                let mut resources = self.inner.registry()?;
                if let Some(state) = resources.get_mut(resource_id) {
                    if let Some(pos) = state.waiters.iter().position(|w| w.holder_id == holder_id) {
                        state.waiters.remove(pos);
                        debug!("Gave up waiting for {} after {:?}", resource_id, timeout);
                        return Err(StorageError::LockTimeout {
                            resource: resource_id.to_string(),
                            timeout,
                        });
                    }
                }

                // Not queued any more: the grant raced the deadline and won.
                match grant.try_recv() {
                    Ok(acquired_at) => Ok(lease(acquired_at)),
                    Err(_) => Err(StorageError::LockTimeout {
                        resource: resource_id.to_string(),
                        timeout,
                    }),
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(&self, lease: &LockLease) -> Result<LockReleaseResult, StorageError> {
        let mut resources = self.inner.registry()?;

        let Some(state) = resources.get(&lease.resource_id) else {
            debug!(
                "Lock on {} not held, nothing to release for {}",
                lease.resource_id, lease.holder_id
            );
            return Ok(LockReleaseResult::not_held());
        };

        if state.holder.holder_id != lease.holder_id {
            debug!(
                "Cannot release lock on {}: held by {} not {}",
                lease.resource_id, state.holder.holder_id, lease.holder_id
            );
            return Ok(LockReleaseResult::not_owner());
        }

        debug!("Released lock on {} by {}", lease.resource_id, lease.holder_id);
        self.inner.hand_off(&mut resources, &lease.resource_id);
        Ok(LockReleaseResult::released())
    }

    async fn holder(&self, resource_id: &str) -> Result<Option<LockHolder>, StorageError> {
        let resources = self.inner.registry()?;
        Ok(resources.get(resource_id).map(|state| LockHolder {
            holder_id: state.holder.holder_id.clone(),
            acquired_at: state.holder.acquired_at,
            waiters: state.waiters.len(),
        }))
    }
}
