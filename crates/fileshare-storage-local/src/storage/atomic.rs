use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use fileshare_storage_core::StorageError;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Writes whole files so that readers see either the old or the new content.
///
/// The bytes go to a uniquely named sibling temp file, are flushed to disk,
/// then renamed over the target. Rename within one directory is atomic, so a
/// failure at any step leaves the previously committed file as it was.
#[derive(Debug, Default)]
pub struct AtomicWriter {
    #[cfg(test)]
    fail_before_rename: AtomicBool,
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `path` with `bytes`. `collection` is only used for error context.
    #[instrument(skip(self, bytes), level = "debug", fields(bytes_len = bytes.len()))]
    pub async fn write(&self, collection: &str, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let failure = |reason: String| StorageError::StorageWriteFailure {
            collection: collection.to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                failure(format!("Failed to create dir {}: {}", parent.display(), e))
            })?;
        }

        let temp_path = temp_path_for(path);
        if let Err(e) = write_and_sync(&temp_path, bytes).await {
            discard(&temp_path).await;
            return Err(failure(format!(
                "Failed to write {}: {}",
                temp_path.display(),
                e
            )));
        }

        if self.take_injected_failure() {
            discard(&temp_path).await;
            return Err(failure("Injected failure before rename".to_string()));
        }

        if let Err(e) = fs::rename(&temp_path, path).await {
            discard(&temp_path).await;
            return Err(failure(format!(
                "Failed to rename to {}: {}",
                path.display(),
                e
            )));
        }

        debug!("Committed {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Make the next write fail after the temp file is written.
    #[cfg(test)]
    pub(crate) fn fail_next_rename(&self) {
        self.fail_before_rename.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        self.fail_before_rename.swap(false, Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn take_injected_failure(&self) -> bool {
        false
    }
}

/// `{dir}/.{file_name}.{uuid}.tmp`
fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()))
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn discard(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {}: {}", temp_path.display(), e);
        }
    }
}

/// Whether `path` looks like a temp file left by [`AtomicWriter`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|s| s.to_string_lossy())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"))
}
