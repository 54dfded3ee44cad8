// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store adapters.
//!
//! An adapter owns one [`RecordStore`] and the [`CircuitBreaker`] guarding it,
//! and translates a [`SyncOperation`] into row writes. Every store call goes
//! through the breaker: an open breaker fails fast with
//! [`AdapterError::CircuitOpen`] without touching the store, and any store
//! error is counted as a breaker failure and surfaced as
//! [`AdapterError::Storage`].
//!
//! The two implementations differ in how they treat missing rows:
//!
//! | operation | [`TransactionalAdapter`] | [`AnalyticalAdapter`] |
//! |---|---|---|
//! | CREATE / BULK_INSERT | upsert | upsert |
//! | UPDATE / BULK_UPDATE of a missing row | error | insert the patch |
//! | DELETE of a missing row | ok | ok |

mod analytical;
mod transactional;

pub use analytical::AnalyticalAdapter;
pub use transactional::TransactionalAdapter;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::canonical::record_hash;
use crate::operation::{record_key, OperationType, SyncOperation};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError, CircuitState};
use crate::storage::traits::{RecordStore, RecordWrite, StorageError, StoredRecord};

#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// The store's breaker is open; the call was not attempted
    #[error("{store} store circuit breaker is open")]
    CircuitOpen { store: String },

    #[error("{store} store error: {source}")]
    Storage {
        store: String,
        #[source]
        source: StorageError,
    },

    /// The operation cannot be expressed as row writes (missing key or row data)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl AdapterError {
    /// Whether the store was never called.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Store reachable but the breaker is not closed
    Degraded,
    /// Store did not answer a ping
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealth {
    pub name: String,
    pub backend: &'static str,
    pub status: HealthStatus,
    pub circuit_breaker_state: CircuitState,
    pub failure_count: u32,
    pub calls_total: u64,
    pub rejections: u64,
    pub error: Option<String>,
}

/// Capability interface over one target store.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Apply `op` to this store.
    async fn execute_operation(&self, op: &SyncOperation) -> Result<(), AdapterError>;

    /// Read one row through the breaker.
    async fn fetch_record(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, AdapterError>;

    /// Whether the row's canonical hash equals `expected_hash`. A missing row is `false`.
    async fn validate_consistency(
        &self,
        table: &str,
        key: &str,
        expected_hash: &str,
    ) -> Result<bool, AdapterError>;

    /// Page through a table ordered by key.
    async fn scan(
        &self,
        table: &str,
        since: Option<i64>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, AdapterError>;

    async fn health_status(&self) -> AdapterHealth;

    fn circuit_state(&self) -> CircuitState;
}

/// Breaker + store pair shared by both adapter kinds.
pub(crate) struct GuardedStore {
    name: String,
    store: Arc<dyn RecordStore>,
    breaker: CircuitBreaker,
    key_field: String,
}

impl GuardedStore {
    pub(crate) fn new(
        name: &str,
        store: Arc<dyn RecordStore>,
        breaker: CircuitBreaker,
        key_field: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            store,
            breaker,
            key_field: key_field.to_string(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T, F, Fut>(&self, f: F) -> Result<T, AdapterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        match self.breaker.call(f).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Rejected) => Err(AdapterError::CircuitOpen {
                store: self.name.clone(),
            }),
            Err(CircuitError::Inner(source)) => {
                warn!(store = %self.name, error = %source, "Store call failed");
                Err(AdapterError::Storage {
                    store: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Key for single-row operations: explicit key, else the row's key field.
    fn single_key(&self, op: &SyncOperation) -> Result<String, AdapterError> {
        op.primary_key
            .clone()
            .or_else(|| op.data.as_row().and_then(|row| record_key(row, &self.key_field)))
            .ok_or_else(|| {
                AdapterError::InvalidOperation(format!(
                    "{} on {} has no primary key",
                    op.operation_type, op.table_name
                ))
            })
    }

    fn bulk_writes(
        &self,
        op: &SyncOperation,
        update_inserts_missing: bool,
    ) -> Result<Vec<RecordWrite>, AdapterError> {
        op.data
            .records()
            .into_iter()
            .map(|row| {
                let key = record_key(row, &self.key_field).ok_or_else(|| {
                    AdapterError::InvalidOperation(format!(
                        "bulk row in {} is missing key field '{}'",
                        op.table_name, self.key_field
                    ))
                })?;
                Ok(match op.operation_type {
                    OperationType::BulkUpdate => RecordWrite::Merge {
                        key,
                        patch: row.clone(),
                        insert_missing: update_inserts_missing,
                    },
                    OperationType::BulkDelete => RecordWrite::Delete { key },
                    _ => RecordWrite::Upsert { key, record: row.clone() },
                })
            })
            .collect()
    }

    /// Dispatch `op` by type. `update_inserts_missing` decides whether an
    /// update of an absent row writes the patch or fails.
    pub(crate) async fn execute(
        &self,
        op: &SyncOperation,
        update_inserts_missing: bool,
    ) -> Result<(), AdapterError> {
        let table = op.table_name.as_str();

        match op.operation_type {
            OperationType::Create => {
                let key = self.single_key(op)?;
                let row = op.data.as_row().ok_or_else(|| {
                    AdapterError::InvalidOperation(format!("create on {table} carries no row"))
                })?;
                self.guarded(|| self.store.upsert(table, &key, row)).await?;
            }
            OperationType::Update => {
                let key = self.single_key(op)?;
                let patch = op.data.as_row().ok_or_else(|| {
                    AdapterError::InvalidOperation(format!("update on {table} carries no row"))
                })?;
                self.guarded(|| async {
                    if self.store.merge(table, &key, patch).await? {
                        return Ok(());
                    }
                    if update_inserts_missing {
                        return self.store.upsert(table, &key, patch).await;
                    }
                    Err(StorageError::NotFound {
                        table: table.to_string(),
                        key: key.clone(),
                    })
                })
                .await?;
            }
            OperationType::Delete => {
                let key = self.single_key(op)?;
                let removed = self.guarded(|| self.store.delete(table, &key)).await?;
                if !removed {
                    debug!(store = %self.name, table, key = %key, "Delete of absent row");
                }
            }
            OperationType::BulkInsert | OperationType::BulkUpdate | OperationType::BulkDelete => {
                let writes = self.bulk_writes(op, update_inserts_missing)?;
                let result = self.guarded(|| self.store.apply_batch(table, &writes)).await?;
                debug!(
                    store = %self.name,
                    table,
                    written = result.written,
                    atomic = result.atomic,
                    "Bulk write applied"
                );
            }
        }
        Ok(())
    }

    pub(crate) async fn fetch(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, AdapterError> {
        self.guarded(|| self.store.get(table, key)).await
    }

    pub(crate) async fn hash_matches(
        &self,
        table: &str,
        key: &str,
        expected_hash: &str,
    ) -> Result<bool, AdapterError> {
        Ok(self
            .fetch(table, key)
            .await?
            .is_some_and(|row| record_hash(&row.data) == expected_hash))
    }

    pub(crate) async fn scan(
        &self,
        table: &str,
        since: Option<i64>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, AdapterError> {
        self.guarded(|| self.store.scan(table, since, after_key, limit)).await
    }

    /// Ping outside the breaker and combine with breaker state.
    pub(crate) async fn health(&self) -> AdapterHealth {
        let ping = self.store.ping().await;
        let state = self.breaker.state();
        let status = match (&ping, state) {
            (Err(_), _) => HealthStatus::Unhealthy,
            (Ok(()), CircuitState::Closed) => HealthStatus::Healthy,
            (Ok(()), _) => HealthStatus::Degraded,
        };
        crate::metrics::set_backend_healthy(&self.name, status != HealthStatus::Unhealthy);

        AdapterHealth {
            name: self.name.clone(),
            backend: self.store.backend(),
            status,
            circuit_breaker_state: state,
            failure_count: self.breaker.failure_count(),
            calls_total: self.breaker.calls_total(),
            rejections: self.breaker.rejections(),
            error: ping.err().map(|e| e.to_string()),
        }
    }
}
