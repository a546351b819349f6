use fileshare_storage_core::Record;
use serde::{Deserialize, Serialize};

/// Current on-disk format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The persisted content of one collection file.
///
/// ```json
/// { "version": 1, "lastId": 3, "records": [ { "id": 1, ... }, ... ] }
/// ```
///
/// `last_id` is the highest id ever assigned, so deleting the newest record
/// does not make its id available again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Highest id ever assigned in this collection
    #[serde(rename = "lastId", default)]
    pub last_id: u64,
    /// Records in persisted order
    #[serde(default)]
    pub records: Vec<Record>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for CollectionSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            last_id: 0,
            records: Vec::new(),
        }
    }
}

/// Accepted encodings: the envelope, or a bare array of records.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredCollection {
    Envelope(CollectionSnapshot),
    Bare(Vec<Record>),
}

impl CollectionSnapshot {
    /// Decode a collection file.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let snapshot = match serde_json::from_slice(bytes)? {
            StoredCollection::Envelope(snapshot) => snapshot,
            StoredCollection::Bare(records) => Self {
                records,
                ..Self::default()
            },
        };
        Ok(snapshot)
    }

    /// Encode as pretty-printed JSON, always in the envelope form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Id for the next insert: one past the highest id ever seen.
    ///
    /// Scans every record; cost grows linearly with the collection.
    pub fn next_id(&self) -> u64 {
        let max_existing = self.records.iter().map(|r| r.id).max().unwrap_or(0);
        self.last_id.max(max_existing) + 1
    }

    /// Append a record and advance the high-water mark.
    pub fn push(&mut self, record: Record) {
        self.last_id = self.last_id.max(record.id);
        self.records.push(record);
    }

    /// Get a record by ID.
    pub fn get(&self, id: u64) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Get a mutable record by ID.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Remove a record by ID.
    pub fn remove(&mut self, id: u64) -> Option<Record> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    /// Remove every record for which `predicate` holds. Returns how many went.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&Record) -> bool) -> u64 {
        let before = self.records.len();
        self.records.retain(|r| !predicate(r));
        (before - self.records.len()) as u64
    }
}
