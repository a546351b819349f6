use fileshare_storage_core::{Fields, Filter, StorageAdapter, StorageError};
use serde_json::{json, Value};
use tracing::instrument;

use crate::config::Command;

/// Run one admin command against `store` and return its JSON output.
#[instrument(skip(store), level = "debug", fields(backend = store.backend_name()))]
pub async fn execute(store: &dyn StorageAdapter, command: &Command) -> Result<Value, StorageError> {
    let output = match command {
        Command::List { collection } => to_json(store.find_all(collection).await?)?,
        Command::Find { collection, filter } => {
            to_json(store.find(collection, &parse_filter(filter)?).await?)?
        }
        Command::Get { collection, id } => to_json(store.find_by_id(collection, *id).await?)?,
        Command::FindOne { collection, filter } => {
            to_json(store.find_one(collection, &parse_filter(filter)?).await?)?
        }
        Command::Insert { collection, fields } => {
            to_json(store.insert(collection, parse_fields(fields)?).await?)?
        }
        Command::Update {
            collection,
            id,
            fields,
        } => to_json(store.update(collection, *id, parse_fields(fields)?).await?)?,
        Command::Delete { collection, id } => {
            let deleted = store.delete(collection, *id).await?;
            json!({ "deleted": deleted })
        }
        Command::DeleteMany { collection, filter } => {
            let deleted = store.delete_many(collection, &parse_filter(filter)?).await?;
            json!({ "deleted": deleted })
        }
    };
    Ok(output)
}

/// Parse a JSON filter argument.
pub fn parse_filter(raw: &str) -> Result<Filter, StorageError> {
    Filter::from_value(parse_json(raw)?)
}

/// Parse a JSON object of record fields.
pub fn parse_fields(raw: &str) -> Result<Fields, StorageError> {
    match parse_json(raw)? {
        Value::Object(fields) => Ok(fields),
        other => Err(StorageError::InvalidArgument(format!(
            "Record fields must be a JSON object, got {}",
            other
        ))),
    }
}

fn parse_json(raw: &str) -> Result<Value, StorageError> {
    serde_json::from_str(raw)
        .map_err(|e| StorageError::InvalidArgument(format!("Invalid JSON {:?}: {}", raw, e)))
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value, StorageError> {
    serde_json::to_value(value)
        .map_err(|e| StorageError::Serialization(format!("Failed to encode output: {}", e)))
}
