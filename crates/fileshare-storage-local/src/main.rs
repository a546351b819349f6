use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use fileshare_storage_core::{LockManager, StorageAdapter};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use fileshare_storage_local::commands;
use fileshare_storage_local::config::Config;
use fileshare_storage_local::{DocumentStore, QueuedLockManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout carries the command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    let dir = config.effective_data_dir();
    debug!("Data dir: {}", dir.display());
    debug!("Lock max hold: {:?}", config.lock_max_hold());

    // The lock manager is per process; concurrent CLI invocations are not serialized
    let locks: Arc<dyn LockManager> = Arc::new(QueuedLockManager::new(config.lock_max_hold()));
    let store = DocumentStore::with_options(&dir, locks, config.store_options());

    store.connect().await?;
    let outcome = commands::execute(&store, &config.command).await;
    store.disconnect().await?;

    match outcome {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            debug!("{} done", config.command.collection());
            Ok(())
        }
        Err(e) => {
            error!(code = e.code(), "{}", e);
            Err(anyhow!("[{}] {}", e.code(), e))
        }
    }
}
