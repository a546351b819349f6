//! Core traits and types for fileshare storage adapters.
//!
//! This crate defines the abstractions shared by every storage backend:
//! - `StorageAdapter`: CRUD and query contract over named collections
//! - `LockManager`: Named-resource mutual exclusion with FIFO waiters
//! - `Filter`: The query filter language evaluated against records
//! - `Record`: Open-ended records with store-managed id and timestamps

mod error;
mod filter;
mod lock;
mod record;
mod storage;

pub use error::StorageError;
pub use filter::{Condition, Filter};
pub use lock::{with_lock, LockHolder, LockLease, LockManager, LockReleaseResult};
pub use record::{
    is_reserved, Fields, Record, CREATED_AT_FIELD, ID_FIELD, RESERVED_FIELDS, UPDATED_AT_FIELD,
};
pub use storage::{Capabilities, StorageAdapter, TransactionFn};
