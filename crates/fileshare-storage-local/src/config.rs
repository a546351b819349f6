use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::storage::StoreOptions;

/// Configuration for the fileshare-storage-local admin tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "fileshare-storage-local")]
#[command(about = "Inspect and edit fileshare collections stored as local JSON files")]
pub struct Config {
    /// Directory holding one JSON file per collection
    #[arg(long, env = "FILESHARE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// How long a write waits for its collection lock, in milliseconds
    #[arg(long, default_value = "5000", env = "FILESHARE_LOCK_TIMEOUT_MS", global = true)]
    pub lock_timeout_ms: u64,

    /// Force-release a lock held longer than this, in milliseconds
    #[arg(long, default_value = "30000", env = "FILESHARE_LOCK_MAX_HOLD_MS", global = true)]
    pub lock_max_hold_ms: u64,

    /// Extra attempts when a collection file cannot be decoded
    #[arg(long, default_value = "3", env = "FILESHARE_READ_RETRIES", global = true)]
    pub read_retries: u32,

    /// Base delay between read attempts, in milliseconds
    #[arg(long, default_value = "50", env = "FILESHARE_READ_BACKOFF_MS", global = true)]
    pub read_backoff_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Get the effective data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fileshare")
                .join("collections")
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            read_retries: self.read_retries,
            read_backoff: Duration::from_millis(self.read_backoff_ms),
        }
    }

    pub fn lock_max_hold(&self) -> Duration {
        Duration::from_millis(self.lock_max_hold_ms)
    }
}

/// One storage operation. Record and filter arguments are JSON objects.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print every record of a collection
    List { collection: String },

    /// Print the records matching a filter
    Find {
        collection: String,
        /// e.g. '{"status": {"$ne": "expired"}}'
        #[arg(long, default_value = "{}")]
        filter: String,
    },

    /// Print one record by id
    Get { collection: String, id: u64 },

    /// Print the first record matching a filter
    FindOne {
        collection: String,
        #[arg(long)]
        filter: String,
    },

    /// Insert a record and print it with its assigned id
    Insert { collection: String, fields: String },

    /// Merge fields into a record and print the result
    Update {
        collection: String,
        id: u64,
        fields: String,
    },

    /// Delete one record by id
    Delete { collection: String, id: u64 },

    /// Delete every record matching a filter
    DeleteMany {
        collection: String,
        #[arg(long)]
        filter: String,
    },
}

impl Command {
    pub fn collection(&self) -> &str {
        match self {
            Command::List { collection }
            | Command::Find { collection, .. }
            | Command::Get { collection, .. }
            | Command::FindOne { collection, .. }
            | Command::Insert { collection, .. }
            | Command::Update { collection, .. }
            | Command::Delete { collection, .. }
            | Command::DeleteMany { collection, .. } => collection,
        }
    }
}
