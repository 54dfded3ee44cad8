// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend for the transactional (system of record) store.
//!
//! Rows from every logical table share one physical table keyed by
//! `(table_name, record_key)`, so table names are bound as values and never
//! interpolated into SQL:
//!
//! ```sql
//! CREATE TABLE sync_records (
//!   table_name TEXT NOT NULL,
//!   record_key TEXT NOT NULL,
//!   payload TEXT NOT NULL,       -- JSON object as text
//!   payload_hash TEXT NOT NULL,  -- SHA-256 of the canonical form
//!   updated_at BIGINT NOT NULL,  -- epoch millis
//!   PRIMARY KEY (table_name, record_key)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The same statements run on PostgreSQL and SQLite: `$N` placeholders are
//! understood by both, and upserts use `ON CONFLICT ... DO UPDATE` with
//! `excluded.*`. Some drivers hand TEXT back as bytes, so reads fall back to
//! `Vec<u8>`.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};
use std::sync::Once;
use std::time::Duration;

use crate::canonical::record_hash;
use crate::operation::{now_millis, Record};
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{merge_fields, BatchWriteResult, RecordStore, RecordWrite, StorageError, StoredRecord};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const UPSERT_SQL: &str = r#"
    INSERT INTO sync_records (table_name, record_key, payload, payload_hash, updated_at)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (table_name, record_key) DO UPDATE SET
        payload = excluded.payload,
        payload_hash = excluded.payload_hash,
        updated_at = excluded.updated_at
"#;

const SELECT_SQL: &str = r#"
    SELECT table_name, record_key, payload, updated_at
    FROM sync_records WHERE table_name = $1 AND record_key = $2
"#;

const DELETE_SQL: &str = "DELETE FROM sync_records WHERE table_name = $1 AND record_key = $2";

fn backend_err(context: &str) -> impl Fn(sqlx::Error) -> StorageError + '_ {
    move |e| StorageError::Backend(format!("{context}: {e}"))
}

fn text_column(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .or_else(|_| {
            row.try_get::<Vec<u8>, _>(column)
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        })
        .map_err(|e| StorageError::Backend(format!("column {column}: {e}")))
}

fn decode_row(row: &AnyRow) -> Result<StoredRecord, StorageError> {
    let payload = text_column(row, "payload")?;
    let data: Record = serde_json::from_str(&payload)
        .map_err(|e| StorageError::Serialization(format!("payload is not a JSON object: {e}")))?;
    Ok(StoredRecord {
        table: text_column(row, "table_name")?,
        key: text_column(row, "record_key")?,
        data,
        updated_at: row.try_get("updated_at").unwrap_or(0),
    })
}

fn encode_record(record: &Record) -> Result<String, StorageError> {
    serde_json::to_string(record).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Row limit as a bind parameter, saturating instead of wrapping negative.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL journaling lets readers proceed during writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(backend_err("Failed to enable WAL mode"))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(backend_err("Failed to set synchronous mode"))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let create = r#"
            CREATE TABLE IF NOT EXISTS sync_records (
                table_name TEXT NOT NULL,
                record_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (table_name, record_key)
            )
        "#;
        let index = "CREATE INDEX IF NOT EXISTS idx_sync_records_updated \
                     ON sync_records (table_name, updated_at)";

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(create)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            sqlx::query(index)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    async fn upsert_in(
        tx: &mut Transaction<'_, Any>,
        table: &str,
        key: &str,
        record: &Record,
    ) -> Result<(), StorageError> {
        sqlx::query(UPSERT_SQL)
            .bind(table)
            .bind(key)
            .bind(encode_record(record)?)
            .bind(record_hash(record))
            .bind(now_millis())
            .execute(&mut **tx)
            .await
            .map_err(backend_err("upsert"))?;
        Ok(())
    }

    async fn merge_in(
        tx: &mut Transaction<'_, Any>,
        table: &str,
        key: &str,
        patch: &Record,
    ) -> Result<bool, StorageError> {
        let existing = sqlx::query(SELECT_SQL)
            .bind(table)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend_err("merge select"))?;

        let Some(row) = existing else { return Ok(false) };
        let mut current = decode_row(&row)?;
        merge_fields(&mut current.data, patch);
        Self::upsert_in(tx, table, key, &current.data).await?;
        Ok(true)
    }

    async fn delete_in(
        tx: &mut Transaction<'_, Any>,
        table: &str,
        key: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(DELETE_SQL)
            .bind(table)
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(backend_err("delete"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin(&self) -> Result<Transaction<'static, Any>, StorageError> {
        self.pool.begin().await.map_err(backend_err("begin"))
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }
}

#[async_trait]
impl RecordStore for SqlStore {
    fn backend(&self) -> &'static str {
        if self.is_sqlite { "sqlite" } else { "sql" }
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        let row = sqlx::query(SELECT_SQL)
            .bind(table)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err("get"))?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn upsert(&self, table: &str, key: &str, record: &Record) -> Result<(), StorageError> {
        sqlx::query(UPSERT_SQL)
            .bind(table)
            .bind(key)
            .bind(encode_record(record)?)
            .bind(record_hash(record))
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(backend_err("upsert"))?;
        Ok(())
    }

    async fn merge(&self, table: &str, key: &str, patch: &Record) -> Result<bool, StorageError> {
        let mut tx = self.begin().await?;
        let merged = Self::merge_in(&mut tx, table, key, patch).await?;
        tx.commit().await.map_err(backend_err("commit"))?;
        Ok(merged)
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(DELETE_SQL)
            .bind(table)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend_err("delete"))?;
        Ok(result.rows_affected() > 0)
    }

    /// All writes commit together or not at all.
    async fn apply_batch(
        &self,
        table: &str,
        writes: &[RecordWrite],
    ) -> Result<BatchWriteResult, StorageError> {
        let mut tx = self.begin().await?;

        for write in writes {
            match write {
                RecordWrite::Upsert { key, record } => {
                    Self::upsert_in(&mut tx, table, key, record).await?;
                }
                RecordWrite::Merge { key, patch, insert_missing } => {
                    if !Self::merge_in(&mut tx, table, key, patch).await? {
                        if *insert_missing {
                            Self::upsert_in(&mut tx, table, key, patch).await?;
                        } else {
                            // Dropping the transaction rolls it back
                            return Err(StorageError::NotFound {
                                table: table.to_string(),
                                key: key.clone(),
                            });
                        }
                    }
                }
                RecordWrite::Delete { key } => {
                    Self::delete_in(&mut tx, table, key).await?;
                }
            }
        }

        tx.commit().await.map_err(backend_err("commit"))?;
        Ok(BatchWriteResult { written: writes.len(), atomic: true })
    }

    async fn scan(
        &self,
        table: &str,
        since: Option<i64>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let mut sql = String::from(
            "SELECT table_name, record_key, payload, updated_at FROM sync_records WHERE table_name = $1",
        );
        let mut next_param = 2;
        if since.is_some() {
            sql.push_str(&format!(" AND updated_at >= ${next_param}"));
            next_param += 1;
        }
        if after_key.is_some() {
            sql.push_str(&format!(" AND record_key > ${next_param}"));
            next_param += 1;
        }
        sql.push_str(&format!(" ORDER BY record_key LIMIT ${next_param}"));

        let mut query = sqlx::query(&sql).bind(table);
        if let Some(since) = since {
            query = query.bind(since);
        }
        if let Some(after) = after_key {
            query = query.bind(after);
        }
        let rows = query
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err("scan"))?;

        rows.iter().map(decode_row).collect()
    }

    async fn count(&self, table: &str) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM sync_records WHERE table_name = $1")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err("count"))?;
        let count: i64 = row.try_get("cnt").map_err(backend_err("count column"))?;
        Ok(count as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend_err("ping"))?;
        Ok(())
    }
}
