use async_trait::async_trait;
use thiserror::Error;

use crate::operation::Record;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Record not found: {table}/{key}")]
    NotFound { table: String, key: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A row as persisted by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub table: String,
    pub key: String,
    pub data: Record,
    /// Epoch millis of the last write
    pub updated_at: i64,
}

/// One write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    /// Insert or replace the whole row
    Upsert { key: String, record: Record },
    /// Merge fields into an existing row; `insert_missing` decides what happens when it is absent
    Merge { key: String, patch: Record, insert_missing: bool },
    /// Remove the row (absent rows are fine)
    Delete { key: String },
}

impl RecordWrite {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Upsert { key, .. } | Self::Merge { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Result of a batch write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWriteResult {
    /// Number of writes applied
    pub written: usize,
    /// Whether the whole batch was applied atomically
    pub atomic: bool,
}

/// Overlay `patch` onto `existing`, field by field.
pub fn merge_fields(existing: &mut Record, patch: &Record) {
    for (field, value) in patch {
        existing.insert(field.clone(), value.clone());
    }
}

/// Row-level storage contract shared by the transactional and analytical backends.
///
/// Records live in a generic `(table, key) -> record` space, so callers never
/// interpolate table names into SQL.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs and health ("sql", "duckdb", "memory")
    fn backend(&self) -> &'static str;

    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError>;

    /// Insert or replace. Writing the same row twice is not an error.
    async fn upsert(&self, table: &str, key: &str, record: &Record) -> Result<(), StorageError>;

    /// Merge fields into an existing row. Returns `false` when the row does not exist.
    async fn merge(&self, table: &str, key: &str, patch: &Record) -> Result<bool, StorageError>;

    /// Returns whether a row was removed.
    async fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError>;

    /// Apply several writes. Backends with transactions override this to
    /// make the batch atomic; the default applies writes in order and stops
    /// at the first error.
    async fn apply_batch(
        &self,
        table: &str,
        writes: &[RecordWrite],
    ) -> Result<BatchWriteResult, StorageError> {
        for write in writes {
            match write {
                RecordWrite::Upsert { key, record } => self.upsert(table, key, record).await?,
                RecordWrite::Merge { key, patch, insert_missing } => {
                    if !self.merge(table, key, patch).await? {
                        if *insert_missing {
                            self.upsert(table, key, patch).await?;
                        } else {
                            return Err(StorageError::NotFound {
                                table: table.to_string(),
                                key: key.clone(),
                            });
                        }
                    }
                }
                RecordWrite::Delete { key } => {
                    self.delete(table, key).await?;
                }
            }
        }
        Ok(BatchWriteResult { written: writes.len(), atomic: false })
    }

    /// Page through a table ordered by key, starting after `after_key`.
    /// `since` keeps only rows written at or after that epoch-millis instant.
    /// Returns an empty vec past the end.
    async fn scan(
        &self,
        table: &str,
        since: Option<i64>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError>;

    /// Count rows in a table.
    async fn count(&self, table: &str) -> Result<u64, StorageError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), StorageError>;
}
