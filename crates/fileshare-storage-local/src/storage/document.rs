use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fileshare_storage_core::{
    with_lock, Capabilities, Fields, Filter, LockManager, Record, StorageAdapter, StorageError,
    TransactionFn,
};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use super::atomic::AtomicWriter;
use super::snapshot::CollectionSnapshot;

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME_LEN: usize = 128;

/// Tuning for [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a mutation waits for its collection lock.
    pub lock_timeout: Duration,
    /// Extra attempts when a collection file fails to decode.
    pub read_retries: u32,
    /// Base delay between read attempts; attempt `n` waits `n * read_backoff`.
    pub read_backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            read_retries: 3,
            read_backoff: Duration::from_millis(50),
        }
    }
}

/// Flat-file document store.
///
/// One JSON file per collection:
/// ```text
/// {root_dir}/
///   {collection}.json
/// ```
///
/// Reads decode the whole file and need no lock: files are only ever replaced
/// by rename, so a reader sees one complete snapshot. Every mutation holds the
/// lock named after its collection across read, modify and write, and runs in
/// its own task: dropping the caller's future does not abandon a write or
/// leave the lock held.
///
/// `transaction` is not supported; see [`Capabilities`].
pub struct DocumentStore {
    shared: Arc<Shared>,
    connected: AtomicBool,
}

/// State a detached mutation task needs.
struct Shared {
    root_dir: PathBuf,
    locks: Arc<dyn LockManager>,
    writer: AtomicWriter,
    options: StoreOptions,
}

impl DocumentStore {
    /// Create a store rooted at `root_dir` that serializes writers through `locks`.
    pub fn new(root_dir: impl AsRef<Path>, locks: Arc<dyn LockManager>) -> Self {
        Self::with_options(root_dir, locks, StoreOptions::default())
    }

    pub fn with_options(
        root_dir: impl AsRef<Path>,
        locks: Arc<dyn LockManager>,
        options: StoreOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                root_dir: root_dir.as_ref().to_path_buf(),
                locks,
                writer: AtomicWriter::new(),
                options,
            }),
            connected: AtomicBool::new(false),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.shared.root_dir
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get the path to a collection file.
    pub fn collection_path(&self, collection: &str) -> Result<PathBuf, StorageError> {
        self.shared.collection_path(collection)
    }

    /// Read-modify-write `collection` under its lock.
    ///
    /// `apply` returns the operation's result and whether the snapshot
    /// changed; unchanged snapshots are not rewritten. An error from `apply`
    /// leaves the file untouched. The work runs on a spawned task and
    /// finishes even if the returned future is dropped.
    async fn mutate<T, F>(&self, collection: &str, apply: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut CollectionSnapshot) -> Result<(T, bool), StorageError> + Send + 'static,
    {
        validate_collection_name(collection)?;
        let shared = Arc::clone(&self.shared);
        let collection = collection.to_string();

        let task = tokio::spawn(async move {
            with_lock(
                shared.locks.as_ref(),
                &collection,
                shared.options.lock_timeout,
                || async {
                    let mut snapshot = shared.load(&collection).await?;
                    let (value, changed) = apply(&mut snapshot)?;
                    if changed {
                        shared.save(&collection, &snapshot).await?;
                    }
                    Ok(value)
                },
            )
            .await
        });

        task.await
            .map_err(|e| StorageError::Internal(format!("Mutation task failed: {}", e)))?
    }
}

impl Shared {
    fn collection_path(&self, collection: &str) -> Result<PathBuf, StorageError> {
        validate_collection_name(collection)?;
        Ok(self.root_dir.join(format!("{}.json", collection)))
    }

    /// Load a collection, treating a missing file as empty.
    ///
    /// Decode failures are retried with a linear backoff before giving up
    /// with `StorageReadFailure`. The file is never modified here.
    async fn load(&self, collection: &str) -> Result<CollectionSnapshot, StorageError> {
        let path = self.collection_path(collection)?;
        let attempts = self.options.read_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.options.read_backoff * (attempt - 1)).await;
            }

            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(CollectionSnapshot::default());
                }
                Err(e) => {
                    last_error = format!("Failed to read {}: {}", path.display(), e);
                    warn!("{} (attempt {}/{})", last_error, attempt, attempts);
                    continue;
                }
            };

            match CollectionSnapshot::decode(&bytes) {
                Ok(snapshot) => {
                    debug!(
                        "Loaded {} with {} records",
                        collection,
                        snapshot.records.len()
                    );
                    return Ok(snapshot);
                }
                Err(e) => {
                    last_error = format!("Failed to parse {}: {}", path.display(), e);
                    warn!("{} (attempt {}/{})", last_error, attempt, attempts);
                }
            }
        }

        Err(StorageError::StorageReadFailure {
            collection: collection.to_string(),
            reason: last_error,
        })
    }

    async fn save(
        &self,
        collection: &str,
        snapshot: &CollectionSnapshot,
    ) -> Result<(), StorageError> {
        let path = self.collection_path(collection)?;
        let bytes = snapshot
            .encode()
            .map_err(|e| StorageError::StorageWriteFailure {
                collection: collection.to_string(),
                reason: format!("Failed to encode: {}", e),
            })?;
        self.writer.write(collection, &path, &bytes).await
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("root_dir", &self.shared.root_dir)
            .field("lock_type", &self.shared.locks.lock_type())
            .field("options", &self.shared.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Collection names map straight to file names, so only `[A-Za-z0-9_-]`.
pub fn validate_collection_name(collection: &str) -> Result<(), StorageError> {
    let valid = !collection.is_empty()
        && collection.len() <= MAX_COLLECTION_NAME_LEN
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidArgument(format!(
            "Invalid collection name {:?}",
            collection
        )))
    }
}

#[async_trait]
impl StorageAdapter for DocumentStore {
    fn backend_name(&self) -> &'static str {
        "document"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactions: false,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn connect(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.shared.root_dir).await.map_err(|e| {
            StorageError::Internal(format!(
                "Failed to create data dir {}: {}",
                self.shared.root_dir.display(),
                e
            ))
        })?;
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Document store ready at {}", self.shared.root_dir.display());
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self) -> Result<(), StorageError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Document store at {} disconnected", self.shared.root_dir.display());
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn find_all(&self, collection: &str) -> Result<Vec<Record>, StorageError> {
        Ok(self.shared.load(collection).await?.records)
    }

    #[instrument(skip(self), level = "debug")]
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, StorageError> {
        let records = self.shared.load(collection).await?.records;
        if filter.is_empty() {
            return Ok(records);
        }
        let matched: Vec<Record> = records.into_iter().filter(|r| filter.matches(r)).collect();
        debug!("Matched {} records in {}", matched.len(), collection);
        Ok(matched)
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_by_id(&self, collection: &str, id: u64) -> Result<Record, StorageError> {
        self.shared.load(collection)
            .await?
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(collection, format!("id {}", id)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Record, StorageError> {
        self.shared.load(collection)
            .await?
            .records
            .into_iter()
            .find(|r| filter.matches(r))
            .ok_or_else(|| StorageError::not_found(collection, "no record matches filter"))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    #[instrument(skip(self, fields), level = "debug", fields(fields_len = fields.len()))]
    async fn insert(&self, collection: &str, fields: Fields) -> Result<Record, StorageError> {
        let record = self
            .mutate(collection, move |snapshot| {
                let record = Record::new(snapshot.next_id(), Utc::now(), fields);
                snapshot.push(record.clone());
                Ok((record, true))
            })
            .await?;

        debug!("Inserted {} into {}", record.id, collection);
        Ok(record)
    }

    #[instrument(skip(self, fields), level = "debug", fields(fields_len = fields.len()))]
    async fn update(
        &self,
        collection: &str,
        id: u64,
        fields: Fields,
    ) -> Result<Record, StorageError> {
        let name = collection.to_string();
        let record = self
            .mutate(collection, move |snapshot| {
                let record = snapshot
                    .get_mut(id)
                    .ok_or_else(|| StorageError::not_found(&name, format!("id {}", id)))?;
                record.merge(fields);
                record.updated_at = Utc::now().max(record.created_at);
                Ok((record.clone(), true))
            })
            .await?;

        debug!("Updated {} in {}", id, collection);
        Ok(record)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, collection: &str, id: u64) -> Result<bool, StorageError> {
        let existed = self
            .mutate(collection, move |snapshot| {
                let existed = snapshot.remove(id).is_some();
                Ok((existed, existed))
            })
            .await?;

        debug!("Deleted {} from {} (existed: {})", id, collection, existed);
        Ok(existed)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        let filter = filter.clone();
        let removed = self
            .mutate(collection, move |snapshot| {
                let removed = snapshot.remove_where(|r| filter.matches(r));
                Ok((removed, removed > 0))
            })
            .await?;

        debug!("Deleted {} records from {}", removed, collection);
        Ok(removed)
    }

    async fn transaction(&self, _work: TransactionFn) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(format!(
            "{} backend has no multi-operation transactions",
            self.backend_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::QueuedLockManager;
    use crate::storage::is_temp_file;
    use futures::FutureExt;
    use serde::Deserialize;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (DocumentStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::new(temp.path(), Arc::new(QueuedLockManager::default()));
        (store, temp)
    }

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| is_temp_file(p))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let (store, _temp) = setup();

        for expected in 1..=3 {
            let record = store
                .insert("files", fields(json!({"name": format!("f{}", expected)})))
                .await
                .unwrap();
            assert_eq!(record.id, expected);
            assert_eq!(record.created_at, record.updated_at);
        }

        let all = store.find_all("files").await.unwrap();
        let ids: Vec<u64> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_insert_then_find_by_id() {
        let (store, _temp) = setup();

        let inserted = store
            .insert("files", fields(json!({"name": "report.pdf", "size": 2048})))
            .await
            .unwrap();
        let found = store.find_by_id("files", inserted.id).await.unwrap();

        assert_eq!(found, inserted);
        assert_eq!(*found.get("name").unwrap(), json!("report.pdf"));
    }

    #[tokio::test]
    async fn test_insert_ignores_reserved_fields() {
        let (store, _temp) = setup();

        let record = store
            .insert("files", fields(json!({"id": 99, "createdAt": "yesterday", "name": "a"})))
            .await
            .unwrap();

        assert_eq!(record.id, 1);
        assert!(!record.fields.contains_key("createdAt"));
        assert_eq!(record.fields.len(), 1);
    }

    #[tokio::test]
    async fn test_find_with_not_equals_filter() {
        let (store, _temp) = setup();
        store
            .insert("shares", fields(json!({"status": "active"})))
            .await
            .unwrap();
        store
            .insert("shares", fields(json!({"status": "expired"})))
            .await
            .unwrap();
        store
            .insert("shares", fields(json!({"status": "active"})))
            .await
            .unwrap();

        let filter = Filter::from_value(json!({"status": {"$ne": "expired"}})).unwrap();
        let found = store.find("shares", &filter).await.unwrap();

        let ids: Vec<u64> = found.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_find_one_and_not_found() {
        let (store, _temp) = setup();
        store
            .insert("users", fields(json!({"email": "a@example.com"})))
            .await
            .unwrap();
        store
            .insert("users", fields(json!({"email": "b@example.com"})))
            .await
            .unwrap();

        let filter = Filter::new().equals("email", "b@example.com");
        assert_eq!(store.find_one("users", &filter).await.unwrap().id, 2);

        let missing = Filter::new().equals("email", "c@example.com");
        let err = store.find_one("users", &missing).await.unwrap_err();
        assert_eq!(err.code(), "RECORD_NOT_FOUND");

        let err = store.find_by_id("users", 42).await.unwrap_err();
        assert!(matches!(err, StorageError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let (store, _temp) = setup();
        let inserted = store
            .insert("files", fields(json!({"name": "a.txt", "downloads": 0})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let updated = store
            .update("files", inserted.id, fields(json!({"downloads": 1, "id": 7})))
            .await
            .unwrap();

        assert_eq!(updated.id, inserted.id);
        assert_eq!(updated.created_at, inserted.created_at);
        assert!(updated.updated_at > inserted.updated_at);
        assert_eq!(updated.fields.get("name"), Some(&json!("a.txt")));
        assert_eq!(updated.fields.get("downloads"), Some(&json!(1)));

        let stored = store.find_by_id("files", inserted.id).await.unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn test_update_missing_leaves_file_unchanged() {
        let (store, temp) = setup();
        store
            .insert("files", fields(json!({"name": "a"})))
            .await
            .unwrap();
        let path = temp.path().join("files.json");
        let before = std::fs::read(&path).unwrap();

        let err = store
            .update("files", 5, fields(json!({"name": "b"})))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::RecordNotFound { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp) = setup();
        let record = store
            .insert("files", fields(json!({"name": "a"})))
            .await
            .unwrap();

        assert!(store.delete("files", record.id).await.unwrap());
        assert!(!store.delete("files", record.id).await.unwrap());
        assert!(store.find_all("files").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_delete() {
        let (store, _temp) = setup();
        store.insert("files", Fields::new()).await.unwrap();
        let second = store.insert("files", Fields::new()).await.unwrap();

        store.delete("files", second.id).await.unwrap();
        let third = store.insert("files", Fields::new()).await.unwrap();

        assert_eq!(third.id, 3);
    }

    #[tokio::test]
    async fn test_delete_many() {
        let (store, _temp) = setup();
        for size in [10, 200, 30, 400] {
            store
                .insert("files", fields(json!({"size": size})))
                .await
                .unwrap();
        }

        let filter = Filter::new().greater_than("size", 100);
        assert_eq!(store.delete_many("files", &filter).await.unwrap(), 2);
        assert_eq!(store.delete_many("files", &filter).await.unwrap(), 0);

        let left: Vec<u64> = store
            .find_all("files")
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(left, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_snapshot() {
        let (store, temp) = setup();
        store
            .insert("files", fields(json!({"name": "kept"})))
            .await
            .unwrap();
        let path = temp.path().join("files.json");
        let before = std::fs::read(&path).unwrap();

        store.shared.writer.fail_next_rename();
        let err = store
            .insert("files", fields(json!({"name": "lost"})))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "STORAGE_WRITE_FAILURE");
        assert!(err.is_retryable());
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(temp_files(temp.path()).is_empty());
        assert_eq!(store.find_all("files").await.unwrap().len(), 1);

        // The lock was released despite the failure
        let next = store.insert("files", Fields::new()).await.unwrap();
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_read_failure() {
        let temp = TempDir::new().unwrap();
        let options = StoreOptions {
            read_retries: 2,
            read_backoff: Duration::from_millis(1),
            ..StoreOptions::default()
        };
        let store = DocumentStore::with_options(
            temp.path(),
            Arc::new(QueuedLockManager::default()),
            options,
        );
        let path = temp.path().join("files.json");
        std::fs::write(&path, b"{\"records\": [").unwrap();

        let err = store.find_all("files").await.unwrap_err();
        assert!(matches!(err, StorageError::StorageReadFailure { ref collection, .. } if collection == "files"));

        let err = store.insert("files", Fields::new()).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_READ_FAILURE");
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"records\": [");
    }

    #[tokio::test]
    async fn test_reads_legacy_bare_array() {
        let (store, temp) = setup();
        std::fs::write(
            temp.path().join("files.json"),
            serde_json::to_vec(&json!([
                {"id": 4, "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z", "name": "old"}
            ]))
            .unwrap(),
        )
        .unwrap();

        let found = store.find_by_id("files", 4).await.unwrap();
        assert_eq!(found.fields.get("name"), Some(&json!("old")));

        let next = store.insert("files", Fields::new()).await.unwrap();
        assert_eq!(next.id, 5);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(temp.path().join("files.json")).unwrap())
                .unwrap();
        assert_eq!(raw["lastId"], 5);
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty_and_not_created() {
        let (store, temp) = setup();

        assert!(store.find_all("nothing").await.unwrap().is_empty());
        assert!(store
            .find("nothing", &Filter::new())
            .await
            .unwrap()
            .is_empty());
        assert!(!store.delete("nothing", 1).await.unwrap());
        assert_eq!(
            store.delete_many("nothing", &Filter::new()).await.unwrap(),
            0
        );

        assert!(!temp.path().join("nothing.json").exists());
    }

    #[tokio::test]
    async fn test_operations_work_without_connect() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data").join("collections");
        let store = DocumentStore::new(&root, Arc::new(QueuedLockManager::default()));

        store.insert("files", Fields::new()).await.unwrap();
        assert!(root.join("files.json").exists());
    }

    #[tokio::test]
    async fn test_connect_disconnect_idempotent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("collections");
        let store = DocumentStore::new(&root, Arc::new(QueuedLockManager::default()));

        store.disconnect().await.unwrap();
        store.connect().await.unwrap();
        store.connect().await.unwrap();
        assert!(store.is_connected());
        assert!(root.is_dir());

        store.disconnect().await.unwrap();
        store.disconnect().await.unwrap();
        assert!(!store.is_connected());
    }

    #[tokio::test]
    async fn test_transaction_unsupported() {
        let (store, _temp) = setup();
        assert!(!store.capabilities().transactions);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let err = store
            .transaction(Box::new(move || {
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok::<(), StorageError>(())
                }
                .boxed()
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "UNSUPPORTED");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        let (store, temp) = setup();

        for name in ["", "../escape", "a/b", "files.json", "spaced name"] {
            let err = store.find_all(name).await.unwrap_err();
            assert_eq!(err.code(), "INVALID_ARGUMENT", "name {:?}", name);
            let err = store.insert(name, Fields::new()).await.unwrap_err();
            assert_eq!(err.code(), "INVALID_ARGUMENT", "name {:?}", name);
        }
        assert!(validate_collection_name(&"x".repeat(MAX_COLLECTION_NAME_LEN)).is_ok());
        assert!(validate_collection_name(&"x".repeat(MAX_COLLECTION_NAME_LEN + 1)).is_err());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_typed_view() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Share {
            id: u64,
            token: String,
            downloads: u32,
        }

        let (store, _temp) = setup();
        let record = store
            .insert("shares", fields(json!({"token": "abc", "downloads": 3})))
            .await
            .unwrap();

        let share: Share = record.view().unwrap();
        assert_eq!(
            share,
            Share {
                id: 1,
                token: "abc".to_string(),
                downloads: 3
            }
        );
    }

    #[tokio::test]
    async fn test_mutation_waits_for_collection_lock() {
        let temp = TempDir::new().unwrap();
        let locks = Arc::new(QueuedLockManager::default());
        let options = StoreOptions {
            lock_timeout: Duration::from_millis(50),
            ..StoreOptions::default()
        };
        let store = DocumentStore::with_options(temp.path(), locks.clone(), options);

        let lease = locks
            .acquire("files", Duration::from_secs(1))
            .await
            .unwrap();

        let err = store.insert("files", Fields::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
        assert!(err.is_retryable());

        // Reads do not take the lock
        assert!(store.find_all("files").await.unwrap().is_empty());
        // Other collections are unaffected
        store.insert("users", Fields::new()).await.unwrap();

        locks.release(&lease).await.unwrap();
        assert_eq!(store.insert("files", Fields::new()).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_cancelled_insert_does_not_hold_collection() {
        let temp = TempDir::new().unwrap();
        let locks = Arc::new(QueuedLockManager::default());
        let options = StoreOptions {
            lock_timeout: Duration::from_millis(500),
            ..StoreOptions::default()
        };
        let store = Arc::new(DocumentStore::with_options(
            temp.path(),
            locks.clone(),
            options,
        ));

        let held = locks.acquire("files", Duration::from_secs(1)).await.unwrap();
        let caller = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .insert("files", fields(json!({"name": "first"})))
                    .await
            })
        };
        for _ in 0..1000 {
            let waiting = locks
                .holder("files")
                .await
                .unwrap()
                .map_or(0, |h| h.waiters);
            if waiting == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // Hand the lock over and drop the caller straight away
        locks.release(&held).await.unwrap();
        caller.abort();
        let _ = caller.await;

        let next = store
            .insert("files", fields(json!({"name": "second"})))
            .await
            .unwrap();
        assert_eq!(next.id, 2);

        // The abandoned write still ran to completion
        let names: Vec<serde_json::Value> = store
            .find_all("files")
            .await
            .unwrap()
            .iter()
            .map(|r| r.fields["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("first"), json!("second")]);
        assert_eq!(locks.tracked_resources(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_get_unique_ids() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::new(
            temp.path(),
            Arc::new(QueuedLockManager::default()),
        ));

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert("files", fields(json!({"n": i})))
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<u64>>());
        assert_eq!(store.find_all("files").await.unwrap().len(), 20);
        assert!(temp_files(temp.path()).is_empty());
    }
}
