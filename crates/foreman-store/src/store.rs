use crate::filter::RecordFilter;
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Table names written by the coordinator.
pub mod tables {
    /// One record per task.
    pub const TASKS: &str = "tasks";
    /// One record per resource reservation.
    pub const RESERVATIONS: &str = "reservations";
    /// Resource conflict log.
    pub const CONFLICTS: &str = "conflicts";
    /// One record per submitted workflow.
    pub const WORKFLOWS: &str = "workflows";
}

/// Durable record storage keyed by table name.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Insert `record`, replacing any earlier record in `table` with the same `id`.
    async fn put(&self, table: &str, record: Value) -> ForemanResult<()>;
    /// Records in `table` matching `filter`, in first-insertion order.
    async fn query(&self, table: &str, filter: &RecordFilter) -> ForemanResult<Vec<Value>>;
}

fn ensure_object(table: &str, record: &Value) -> ForemanResult<()> {
    if record.is_object() {
        Ok(())
    } else {
        Err(ForemanError::Store(format!(
            "records in '{table}' must be JSON objects"
        )))
    }
}

/// Upsert into an ordered record list. Records without an `id` are appended.
fn upsert(rows: &mut Vec<Value>, record: Value) {
    let existing = record
        .get("id")
        .and_then(|id| rows.iter().position(|row| row.get("id") == Some(id)));
    match existing {
        Some(pos) => rows[pos] = record,
        None => rows.push(record),
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn put(&self, table: &str, record: Value) -> ForemanResult<()> {
        ensure_object(table, &record)?;
        let mut tables = self.tables.write().await;
        upsert(tables.entry(table.to_string()).or_default(), record);
        Ok(())
    }

    async fn query(&self, table: &str, filter: &RecordFilter) -> ForemanResult<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// JSONL files
// ---------------------------------------------------------------------------

/// One append-only `<table>.jsonl` file per table under a directory.
///
/// `put` appends a line; `query` replays the file and keeps the last version
/// of each id.
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn new(dir: PathBuf) -> ForemanResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn table_path(&self, table: &str) -> ForemanResult<PathBuf> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ForemanError::Store(format!("invalid table name '{table}'")));
        }
        Ok(self.dir.join(format!("{table}.jsonl")))
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn put(&self, table: &str, record: Value) -> ForemanResult<()> {
        ensure_object(table, &record)?;
        let path = self.table_path(table)?;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(table, path = %path.display(), "Record appended");
        Ok(())
    }

    async fn query(&self, table: &str, filter: &RecordFilter) -> ForemanResult<Vec<Value>> {
        let path = self.table_path(table)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut rows = Vec::new();
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(line).map_err(|e| {
                ForemanError::Store(format!("{}:{}: {e}", path.display(), n + 1))
            })?;
            upsert(&mut rows, record);
        }
        Ok(rows.into_iter().filter(|r| filter.matches(r)).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn exercise(store: &dyn PersistentStore) {
        store
            .put(tables::TASKS, json!({"id": "a", "status": "pending"}))
            .await
            .unwrap();
        store
            .put(tables::TASKS, json!({"id": "b", "status": "pending"}))
            .await
            .unwrap();
        store
            .put(tables::TASKS, json!({"id": "a", "status": "completed"}))
            .await
            .unwrap();

        let all = store.query(tables::TASKS, &RecordFilter::all()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["id"], "a");
        assert_eq!(all[0]["status"], "completed");

        let pending = store
            .query(tables::TASKS, &RecordFilter::all().eq("status", "pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["id"], "b");

        let none = store.query(tables::CONFLICTS, &RecordFilter::all()).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_upserts_by_id() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_upserts_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("data")).await.unwrap();
        exercise(&store).await;

        // Three lines on disk, two live records.
        let raw = std::fs::read_to_string(tmp.path().join("data/tasks.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(tmp.path().to_path_buf()).await.unwrap();
            store
                .put(tables::CONFLICTS, json!({"id": "c1", "status": "pending"}))
                .await
                .unwrap();
        }
        let store = FileStore::new(tmp.path().to_path_buf()).await.unwrap();
        let rows = store.query(tables::CONFLICTS, &RecordFilter::all()).await.unwrap();
        assert_eq!(rows, vec![json!({"id": "c1", "status": "pending"})]);
    }

    #[tokio::test]
    async fn test_records_without_id_are_appended() {
        let store = MemoryStore::new();
        store.put("log", json!({"msg": "x"})).await.unwrap();
        store.put("log", json!({"msg": "x"})).await.unwrap();
        assert_eq!(store.query("log", &RecordFilter::all()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_object_rejected() {
        let store = MemoryStore::new();
        let err = store.put(tables::TASKS, json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, ForemanError::Store(_)));
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_table() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().to_path_buf()).await.unwrap();
        let err = store.put("../escape", json!({"id": 1})).await.unwrap_err();
        assert!(matches!(err, ForemanError::Store(_)));
    }

    #[tokio::test]
    async fn test_file_store_concurrent_puts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(tmp.path().to_path_buf()).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.put(tables::RESERVATIONS, json!({"id": i, "quantity": i})).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let rows = store.query(tables::RESERVATIONS, &RecordFilter::all()).await.unwrap();
        assert_eq!(rows.len(), 20);
    }
}
