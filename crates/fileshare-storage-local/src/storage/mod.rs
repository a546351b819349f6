mod atomic;
mod document;
mod snapshot;

pub use atomic::{is_temp_file, AtomicWriter};
pub use document::{validate_collection_name, DocumentStore, StoreOptions, MAX_COLLECTION_NAME_LEN};
pub use snapshot::{CollectionSnapshot, SNAPSHOT_VERSION};
