use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::{check_table_name, RecordStore, StoreError};

type Table = BTreeMap<String, Value>;

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<FxHashMap<String, Table>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

impl RecordStore for MemoryStore {
    fn put<'a>(
        &'a self,
        table: &'a str,
        key: &'a str,
        item: Value,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            check_table_name(table)?;
            self.tables
                .write()
                .entry(table.to_string())
                .or_default()
                .insert(key.to_string(), item);
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        table: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(async move {
            check_table_name(table)?;
            Ok(self
                .tables
                .read()
                .get(table)
                .and_then(|rows| rows.get(key))
                .cloned())
        })
    }

    fn scan<'a>(
        &'a self,
        table: &'a str,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, Value)>, StoreError>> {
        Box::pin(async move {
            check_table_name(table)?;
            let tables = self.tables.read();
            let Some(rows) = tables.get(table) else {
                return Ok(Vec::new());
            };
            Ok(scan_prefix(rows, prefix))
        })
    }
}

pub(super) fn scan_prefix(rows: &Table, prefix: &str) -> Vec<(String, Value)> {
    rows.range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, item)| (key.clone(), item.clone()))
        .collect()
}
