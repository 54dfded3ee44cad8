use async_trait::async_trait;
use dashmap::DashMap;

use crate::operation::{now_millis, Record};
use super::traits::{merge_fields, RecordStore, StorageError, StoredRecord};

/// In-process store, used for development and tests.
pub struct InMemoryStore {
    data: DashMap<(String, String), StoredRecord>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current row count across all tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all rows
    pub fn clear(&self) {
        self.data.clear();
    }

    fn slot(table: &str, key: &str) -> (String, String) {
        (table.to_string(), key.to_string())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self.data.get(&Self::slot(table, key)).map(|r| r.value().clone()))
    }

    async fn upsert(&self, table: &str, key: &str, record: &Record) -> Result<(), StorageError> {
        self.data.insert(
            Self::slot(table, key),
            StoredRecord {
                table: table.to_string(),
                key: key.to_string(),
                data: record.clone(),
                updated_at: now_millis(),
            },
        );
        Ok(())
    }

    async fn merge(&self, table: &str, key: &str, patch: &Record) -> Result<bool, StorageError> {
        match self.data.get_mut(&Self::slot(table, key)) {
            Some(mut existing) => {
                merge_fields(&mut existing.data, patch);
                existing.updated_at = now_millis();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(&Self::slot(table, key)).is_some())
    }

    async fn scan(
        &self,
        table: &str,
        since: Option<i64>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let mut rows: Vec<StoredRecord> = self
            .data
            .iter()
            .filter(|entry| entry.key().0 == table)
            .filter(|entry| since.map_or(true, |s| entry.updated_at >= s))
            .filter(|entry| after_key.map_or(true, |after| entry.key().1.as_str() > after))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count(&self, table: &str) -> Result<u64, StorageError> {
        Ok(self.data.iter().filter(|entry| entry.key().0 == table).count() as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::RecordWrite;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = InMemoryStore::new();
        store.upsert("pages", "1", &record(json!({"id": 1, "title": "a"}))).await.unwrap();

        let row = store.get("pages", "1").await.unwrap().unwrap();
        assert_eq!(row.key, "1");
        assert_eq!(row.data["title"], "a");
        assert!(store.get("pages", "2").await.unwrap().is_none());
        assert!(store.get("other", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = InMemoryStore::new();
        store.upsert("pages", "1", &record(json!({"v": 1}))).await.unwrap();
        store.upsert("pages", "1", &record(json!({"v": 2}))).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("pages", "1").await.unwrap().unwrap().data["v"], 2);
    }

    #[tokio::test]
    async fn test_merge_existing_and_missing() {
        let store = InMemoryStore::new();
        store.upsert("pages", "1", &record(json!({"id": 1, "title": "a"}))).await.unwrap();

        assert!(store.merge("pages", "1", &record(json!({"title": "b"}))).await.unwrap());
        let row = store.get("pages", "1").await.unwrap().unwrap();
        assert_eq!(row.data["title"], "b");
        assert_eq!(row.data["id"], 1);

        assert!(!store.merge("pages", "9", &record(json!({"title": "c"}))).await.unwrap());
        assert!(store.get("pages", "9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let store = InMemoryStore::new();
        store.upsert("pages", "1", &record(json!({}))).await.unwrap();

        assert!(store.delete("pages", "1").await.unwrap());
        assert!(!store.delete("pages", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_pages_in_key_order() {
        let store = InMemoryStore::new();
        for key in ["c", "a", "d", "b"] {
            store.upsert("pages", key, &record(json!({"k": key}))).await.unwrap();
        }
        store.upsert("other", "a", &record(json!({}))).await.unwrap();

        let first = store.scan("pages", None, None, 2).await.unwrap();
        let keys: Vec<_> = first.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let second = store.scan("pages", None, Some("b"), 2).await.unwrap();
        let keys: Vec<_> = second.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "d"]);

        assert!(store.scan("pages", None, Some("d"), 2).await.unwrap().is_empty());
        assert_eq!(store.count("pages").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_scan_since_filters_old_rows() {
        let store = InMemoryStore::new();
        store.upsert("pages", "a", &record(json!({}))).await.unwrap();
        let future = now_millis() + 60_000;

        assert!(store.scan("pages", Some(future), None, 10).await.unwrap().is_empty());
        assert_eq!(store.scan("pages", Some(0), None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_default_batch_stops_on_missing_merge() {
        let store = InMemoryStore::new();
        let writes = vec![
            RecordWrite::Upsert { key: "1".into(), record: record(json!({"id": 1})) },
            RecordWrite::Merge { key: "2".into(), patch: record(json!({"x": 1})), insert_missing: false },
        ];

        let err = store.apply_batch("pages", &writes).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_default_batch_inserts_missing_when_asked() {
        let store = InMemoryStore::new();
        let writes = vec![
            RecordWrite::Merge { key: "2".into(), patch: record(json!({"x": 1})), insert_missing: true },
            RecordWrite::Delete { key: "absent".into() },
        ];

        let result = store.apply_batch("pages", &writes).await.unwrap();
        assert_eq!(result.written, 2);
        assert!(!result.atomic);
        assert_eq!(store.get("pages", "2").await.unwrap().unwrap().data["x"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let key = format!("{batch}-{i}");
                    store_clone.upsert("pages", &key, &Record::new()).await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
