// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! DuckDB storage backend for the analytical store.
//!
//! Single-writer layout: one thread owns the write connection and applies
//! commands from a bounded channel, replying on a oneshot per command.
//! Reads (`get`, `scan`, `count`, `ping`) take a connection from an r2d2
//! pool over the same database instance, so they never queue behind writes.
//! Rows use the same `(table_name, record_key)` layout as the transactional
//! store.

use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use duckdb::{params, Connection, DuckdbConnectionManager, ToSql};
use r2d2::Pool;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::canonical::record_hash;
use crate::operation::{now_millis, Record};
use super::traits::{merge_fields, BatchWriteResult, RecordStore, RecordWrite, StorageError, StoredRecord};

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS analytic_records (
    table_name   VARCHAR NOT NULL,
    record_key   VARCHAR NOT NULL,
    payload      VARCHAR NOT NULL,
    payload_hash VARCHAR NOT NULL,
    updated_at   BIGINT NOT NULL,
    PRIMARY KEY (table_name, record_key)
);
"#;

const UPSERT_SQL: &str = "INSERT INTO analytic_records (table_name, record_key, payload, payload_hash, updated_at)
     VALUES (?, ?, ?, ?, ?)
     ON CONFLICT (table_name, record_key) DO UPDATE SET
         payload = EXCLUDED.payload,
         payload_hash = EXCLUDED.payload_hash,
         updated_at = EXCLUDED.updated_at";

/// Pending write commands before callers wait for room.
const WRITER_QUEUE: usize = 1024;

/// Reader connections.
const READ_POOL_SIZE: u32 = 4;

fn db_err(e: duckdb::Error) -> StorageError {
    StorageError::Backend(format!("duckdb: {e}"))
}

fn pool_err(e: r2d2::Error) -> StorageError {
    StorageError::Backend(format!("duckdb read pool: {e}"))
}

fn writer_gone() -> StorageError {
    StorageError::Backend("duckdb writer has stopped".into())
}

fn decode(table: String, key: String, payload: String, updated_at: i64) -> Result<StoredRecord, StorageError> {
    let data: Record = serde_json::from_str(&payload)
        .map_err(|e| StorageError::Serialization(format!("payload is not a JSON object: {e}")))?;
    Ok(StoredRecord { table, key, data, updated_at })
}

fn upsert_on(conn: &Connection, table: &str, key: &str, record: &Record) -> Result<(), StorageError> {
    let payload = serde_json::to_string(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut stmt = conn.prepare_cached(UPSERT_SQL).map_err(db_err)?;
    stmt.execute(params![table, key, payload, record_hash(record), now_millis()])
        .map_err(db_err)?;
    Ok(())
}

fn get_on(conn: &Connection, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
    let result = conn.query_row(
        "SELECT payload, updated_at FROM analytic_records WHERE table_name = ? AND record_key = ?",
        params![table, key],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
    );
    match result {
        Ok((payload, updated_at)) => {
            decode(table.to_string(), key.to_string(), payload, updated_at).map(Some)
        }
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

fn merge_on(conn: &Connection, table: &str, key: &str, patch: &Record) -> Result<bool, StorageError> {
    let Some(mut current) = get_on(conn, table, key)? else { return Ok(false) };
    merge_fields(&mut current.data, patch);
    upsert_on(conn, table, key, &current.data)?;
    Ok(true)
}

fn delete_on(conn: &Connection, table: &str, key: &str) -> Result<bool, StorageError> {
    let removed = conn
        .execute(
            "DELETE FROM analytic_records WHERE table_name = ? AND record_key = ?",
            params![table, key],
        )
        .map_err(db_err)?;
    Ok(removed > 0)
}

fn apply_writes(conn: &mut Connection, table: &str, writes: &[RecordWrite]) -> Result<BatchWriteResult, StorageError> {
    let tx = conn.transaction().map_err(db_err)?;
    for write in writes {
        match write {
            RecordWrite::Upsert { key, record } => upsert_on(&tx, table, key, record)?,
            RecordWrite::Merge { key, patch, insert_missing } => {
                if !merge_on(&tx, table, key, patch)? {
                    if *insert_missing {
                        upsert_on(&tx, table, key, patch)?;
                    } else {
                        return Err(StorageError::NotFound {
                            table: table.to_string(),
                            key: key.clone(),
                        });
                    }
                }
            }
            RecordWrite::Delete { key } => {
                delete_on(&tx, table, key)?;
            }
        }
    }
    tx.commit().map_err(db_err)?;
    Ok(BatchWriteResult { written: writes.len(), atomic: true })
}

type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

/// Commands sent to the writer thread.
enum Command {
    Upsert { table: String, key: String, record: Record, reply: Reply<()> },
    Merge { table: String, key: String, patch: Record, reply: Reply<bool> },
    Delete { table: String, key: String, reply: Reply<bool> },
    Batch { table: String, writes: Vec<RecordWrite>, reply: Reply<BatchWriteResult> },
}

/// Writer loop. Ends when every command sender is gone.
fn run_writer(mut conn: Connection, mut rx: mpsc::Receiver<Command>) {
    debug!("DuckDB writer started");
    while let Some(command) = rx.blocking_recv() {
        // A caller that gave up waiting has dropped its receiver
        match command {
            Command::Upsert { table, key, record, reply } => {
                let _ = reply.send(upsert_on(&conn, &table, &key, &record));
            }
            Command::Merge { table, key, patch, reply } => {
                let merged = conn.transaction().map_err(db_err).and_then(|tx| {
                    let merged = merge_on(&tx, &table, &key, &patch)?;
                    tx.commit().map_err(db_err)?;
                    Ok(merged)
                });
                let _ = reply.send(merged);
            }
            Command::Delete { table, key, reply } => {
                let _ = reply.send(delete_on(&conn, &table, &key));
            }
            Command::Batch { table, writes, reply } => {
                let _ = reply.send(apply_writes(&mut conn, &table, &writes));
            }
        }
    }
    debug!("DuckDB writer stopped");
}

pub struct DuckDbStore {
    commands: mpsc::Sender<Command>,
    writer: Option<JoinHandle<()>>,
    readers: Pool<DuckdbConnectionManager>,
}

impl DuckDbStore {
    /// Open a file-backed store, or an in-memory one when `path` is `None`.
    ///
    /// The writer and the readers are clones of one connection, so readers
    /// see committed writes immediately.
    pub fn open(path: Option<&str>) -> Result<Self, StorageError> {
        let manager = match path {
            Some(path) => DuckdbConnectionManager::file(path),
            None => DuckdbConnectionManager::memory(),
        }
        .map_err(db_err)?;
        let readers = Pool::builder()
            .max_size(READ_POOL_SIZE)
            .build(manager)
            .map_err(pool_err)?;

        let conn = readers.get().map_err(pool_err)?.try_clone().map_err(db_err)?;
        conn.execute_batch(SCHEMA_DDL).map_err(db_err)?;

        let (commands, rx) = mpsc::channel(WRITER_QUEUE);
        let writer = thread::Builder::new()
            .name("duckdb-writer".into())
            .spawn(move || run_writer(conn, rx))
            .map_err(|e| StorageError::Backend(format!("cannot start duckdb writer: {e}")))?;

        Ok(Self {
            commands,
            writer: Some(writer),
            readers,
        })
    }

    /// Send a command to the writer and wait for its reply.
    async fn write<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, StorageError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| writer_gone())?;
        response.await.map_err(|_| writer_gone())?
    }

    /// Run a read on a pooled connection off the async runtime.
    async fn read<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let readers = self.readers.clone();
        tokio::task::spawn_blocking(move || {
            let conn = readers.get().map_err(pool_err)?;
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("duckdb read task failed: {e}")))?
    }
}

impl Drop for DuckDbStore {
    fn drop(&mut self) {
        // Close the channel so the writer drains what is queued and exits
        let (closed, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.commands, closed));
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("DuckDB writer thread panicked");
            }
        }
    }
}

#[async_trait]
impl RecordStore for DuckDbStore {
    fn backend(&self) -> &'static str {
        "duckdb"
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        let (table, key) = (table.to_string(), key.to_string());
        self.read(move |conn| get_on(conn, &table, &key)).await
    }

    async fn upsert(&self, table: &str, key: &str, record: &Record) -> Result<(), StorageError> {
        self.write(|reply| Command::Upsert {
            table: table.to_string(),
            key: key.to_string(),
            record: record.clone(),
            reply,
        })
        .await
    }

    async fn merge(&self, table: &str, key: &str, patch: &Record) -> Result<bool, StorageError> {
        self.write(|reply| Command::Merge {
            table: table.to_string(),
            key: key.to_string(),
            patch: patch.clone(),
            reply,
        })
        .await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        self.write(|reply| Command::Delete {
            table: table.to_string(),
            key: key.to_string(),
            reply,
        })
        .await
    }

    async fn apply_batch(
        &self,
        table: &str,
        writes: &[RecordWrite],
    ) -> Result<BatchWriteResult, StorageError> {
        self.write(|reply| Command::Batch {
            table: table.to_string(),
            writes: writes.to_vec(),
            reply,
        })
        .await
    }

    async fn scan(
        &self,
        table: &str,
        since: Option<i64>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let table = table.to_string();
        let after_key = after_key.map(str::to_string);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(move |conn| {
            let mut sql = String::from(
                "SELECT record_key, payload, updated_at FROM analytic_records WHERE table_name = ?",
            );
            let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(table.clone())];
            if let Some(since) = since {
                sql.push_str(" AND updated_at >= ?");
                params.push(Box::new(since));
            }
            if let Some(after) = after_key {
                sql.push_str(" AND record_key > ?");
                params.push(Box::new(after));
            }
            sql.push_str(&format!(" ORDER BY record_key LIMIT {limit}"));

            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(param_refs.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(db_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (key, payload, updated_at) = row.map_err(db_err)?;
                records.push(decode(table.clone(), key, payload, updated_at)?);
            }
            Ok(records)
        })
        .await
    }

    async fn count(&self, table: &str) -> Result<u64, StorageError> {
        let table = table.to_string();
        self.read(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM analytic_records WHERE table_name = ?",
                    params![table],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count as u64)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.read(|conn| {
            conn.execute_batch("SELECT 1").map_err(db_err)?;
            Ok(())
        })
        .await
    }
}
