//! Flat-file backend for fileshare storage.
//!
//! - `DocumentStore`: one JSON file per collection, atomic replace on write
//! - `QueuedLockManager`: in-process FIFO locks with abandoned-holder expiry
//! - `commands`: the administrative CLI operations over any `StorageAdapter`

pub mod commands;
pub mod config;
pub mod lock;
pub mod storage;

pub use lock::{QueuedLockManager, DEFAULT_MAX_HOLD};
pub use storage::{DocumentStore, StoreOptions};
