use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::memory::scan_prefix;
use super::{check_table_name, RecordStore, StoreError};

#[derive(Serialize, Deserialize)]
struct StoredLine {
    key: String,
    item: Value,
}

/// One append-only JSON-lines file per table under `dir`.
///
/// Reads replay the file; the last line for a key wins. Lines that fail to
/// parse (a torn final write, say) are skipped.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self, table: &str) -> Result<PathBuf, StoreError> {
        check_table_name(table)?;
        Ok(self.dir.join(format!("{table}.jsonl")))
    }

    async fn load(&self, table: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        let path = self.table_path(table)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };

        let mut rows = BTreeMap::new();
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<StoredLine>(line) {
                Ok(stored) => {
                    rows.insert(stored.key, stored.item);
                }
                Err(err) => {
                    tracing::warn!(table, error = %err, "skipping unreadable record line");
                }
            }
        }
        Ok(rows)
    }
}

impl RecordStore for FileStore {
    fn put<'a>(
        &'a self,
        table: &'a str,
        key: &'a str,
        item: Value,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let path = self.table_path(table)?;
            let mut line = serde_json::to_vec(&StoredLine {
                key: key.to_string(),
                item,
            })?;
            line.push(b'\n');

            let _guard = self.write_lock.lock().await;
            tokio::fs::create_dir_all(&self.dir).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        table: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(async move {
            let mut rows = self.load(table).await?;
            Ok(rows.remove(key))
        })
    }

    fn scan<'a>(
        &'a self,
        table: &'a str,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, Value)>, StoreError>> {
        Box::pin(async move {
            let rows = self.load(table).await?;
            Ok(scan_prefix(&rows, prefix))
        })
    }
}
