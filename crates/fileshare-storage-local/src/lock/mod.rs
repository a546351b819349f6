mod queued;

pub use fileshare_storage_core::{with_lock, LockHolder, LockLease, LockManager, LockReleaseResult};
pub use queued::{QueuedLockManager, DEFAULT_MAX_HOLD};
