//! Key-value record store for analytics records.
//!
//! Records live in named tables under string keys of the form
//! `{partition}#{sort}`, so a prefix scan over `{partition}#` lists one
//! user's records in sort-key order.

mod file;
mod memory;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::config::{StorageBackend, StorageConfig};

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid table name: {0:?}")]
    InvalidTable(String),
    #[error("Storage not configured: {0}")]
    Config(String),
}

pub trait RecordStore: Send + Sync {
    /// Insert or replace the item stored under `key`.
    fn put<'a>(
        &'a self,
        table: &'a str,
        key: &'a str,
        item: Value,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get<'a>(
        &'a self,
        table: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, StoreError>>;

    /// Every `(key, item)` whose key starts with `prefix`, in key order.
    fn scan<'a>(
        &'a self,
        table: &'a str,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, Value)>, StoreError>>;
}

/// Compose a record key from its partition and sort parts.
#[must_use]
pub fn record_key(partition: &str, sort: &str) -> String {
    let mut key = String::with_capacity(partition.len() + sort.len() + 1);
    key.push_str(partition);
    key.push('#');
    key.push_str(sort);
    key
}

/// Build the store selected by the storage config.
///
/// # Errors
///
/// Returns [`StoreError::Config`] when the file backend has no `data_dir`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn RecordStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::File => {
            let dir = config
                .data_dir
                .clone()
                .ok_or_else(|| StoreError::Config("storage.data_dir is required".into()))?;
            Ok(Arc::new(FileStore::new(dir)))
        }
    }
}

pub(crate) fn check_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.'))
        && !table.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}
