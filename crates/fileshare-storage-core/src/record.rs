use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// Open-ended field map carried by every record.
pub type Fields = Map<String, Value>;

/// Field name of the store-assigned identifier.
pub const ID_FIELD: &str = "id";
/// Field name of the creation timestamp.
pub const CREATED_AT_FIELD: &str = "createdAt";
/// Field name of the last-mutation timestamp.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Field names owned by the store; callers cannot set them.
pub const RESERVED_FIELDS: [&str; 3] = [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD];

/// One entity instance in a collection.
///
/// Serializes as a flat JSON object: the three store-managed fields next to
/// whatever the caller supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Positive identifier, unique within the collection.
    pub id: u64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    /// Create a record with both timestamps set to `now`.
    ///
    /// Reserved keys in `fields` are dropped.
    pub fn new(id: u64, now: DateTime<Utc>, fields: Fields) -> Self {
        let mut record = Self {
            id,
            created_at: now,
            updated_at: now,
            fields: Fields::new(),
        };
        record.merge(fields);
        record
    }

    /// Look up a field by name, including the store-managed ones.
    ///
    /// Timestamps are exposed as RFC 3339 strings.
    pub fn get(&self, field: &str) -> Option<Cow<'_, Value>> {
        match field {
            ID_FIELD => Some(Cow::Owned(Value::from(self.id))),
            CREATED_AT_FIELD => Some(Cow::Owned(timestamp_value(&self.created_at))),
            UPDATED_AT_FIELD => Some(Cow::Owned(timestamp_value(&self.updated_at))),
            _ => self.fields.get(field).map(Cow::Borrowed),
        }
    }

    /// Merge `fields` over the existing ones. Returns how many were applied.
    ///
    /// Does not touch `updated_at`; the caller stamps it.
    pub fn merge(&mut self, fields: Fields) -> usize {
        let mut applied = 0;
        for (key, value) in fields {
            if is_reserved(&key) {
                tracing::debug!("Ignoring reserved field {} on record {}", key, self.id);
                continue;
            }
            self.fields.insert(key, value);
            applied += 1;
        }
        applied
    }

    /// Deserialize the whole record into a caller-defined type.
    pub fn view<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        let value = serde_json::to_value(self).map_err(|e| {
            StorageError::Serialization(format!("Failed to encode record {}: {}", self.id, e))
        })?;
        serde_json::from_value(value).map_err(|e| {
            StorageError::Serialization(format!("Failed to view record {}: {}", self.id, e))
        })
    }
}

/// Whether `field` is owned by the store.
pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

fn timestamp_value(ts: &DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}
