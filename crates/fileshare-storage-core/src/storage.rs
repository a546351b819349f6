use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::filter::Filter;
use crate::record::{Fields, Record};

/// What a backend can guarantee beyond the basic CRUD contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Multi-operation atomicity for [`StorageAdapter::transaction`].
    pub transactions: bool,
}

/// Unit of work passed to [`StorageAdapter::transaction`].
///
/// The callback owns whatever handles it needs (typically a cloned
/// `Arc<dyn StorageAdapter>`).
pub type TransactionFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StorageError>> + Send>;

/// Storage adapter abstraction the application depends on.
///
/// Every backend implements the same contract so callers stay
/// storage-agnostic. Collections are addressed by name; records by their
/// store-assigned numeric id.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Returns the backend identifier (e.g., "document").
    fn backend_name(&self) -> &'static str;

    /// Returns the guarantees this backend offers.
    fn capabilities(&self) -> Capabilities;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Make the backend ready. Idempotent.
    async fn connect(&self) -> Result<(), StorageError>;

    /// Release the backend. Idempotent; a no-op before `connect`.
    async fn disconnect(&self) -> Result<(), StorageError>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// All records of a collection, in persisted order.
    async fn find_all(&self, collection: &str) -> Result<Vec<Record>, StorageError>;

    /// Records matching `filter`; the empty filter returns all records.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, StorageError>;

    /// The record with `id`, or `StorageError::RecordNotFound`.
    async fn find_by_id(&self, collection: &str, id: u64) -> Result<Record, StorageError>;

    /// The first record matching `filter`, or `StorageError::RecordNotFound`.
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Record, StorageError>;

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert a new record, assigning its id and timestamps.
    ///
    /// Once this returns, the record is visible to every subsequent read.
    async fn insert(&self, collection: &str, fields: Fields) -> Result<Record, StorageError>;

    /// Merge `fields` into the record with `id` and refresh `updatedAt`.
    async fn update(&self, collection: &str, id: u64, fields: Fields)
        -> Result<Record, StorageError>;

    /// Remove the record with `id`. Returns `false` if it did not exist.
    async fn delete(&self, collection: &str, id: u64) -> Result<bool, StorageError>;

    /// Remove every record matching `filter`. Returns how many were removed.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError>;

    /// Run `work` as one transaction.
    ///
    /// Backends whose [`Capabilities::transactions`] is `false` return
    /// `StorageError::Unsupported` without running `work`.
    async fn transaction(&self, work: TransactionFn) -> Result<(), StorageError>;
}
