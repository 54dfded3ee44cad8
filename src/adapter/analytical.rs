use std::sync::Arc;

use async_trait::async_trait;

use super::{AdapterError, AdapterHealth, GuardedStore, StoreAdapter};
use crate::operation::SyncOperation;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
use crate::storage::traits::{RecordStore, StoredRecord};

/// Adapter over the analytical replica.
///
/// Converges rather than rejects: an update of a row the replica never saw
/// inserts the patch, so replays after a partial failure heal the replica.
pub struct AnalyticalAdapter {
    inner: GuardedStore,
}

impl AnalyticalAdapter {
    pub const NAME: &'static str = "analytical";

    pub fn new(store: Arc<dyn RecordStore>, circuit: CircuitConfig, key_field: &str) -> Self {
        Self {
            inner: GuardedStore::new(
                Self::NAME,
                store,
                CircuitBreaker::new(Self::NAME, circuit),
                key_field,
            ),
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        self.inner.breaker()
    }
}

#[async_trait]
impl StoreAdapter for AnalyticalAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute_operation(&self, op: &SyncOperation) -> Result<(), AdapterError> {
        self.inner.execute(op, true).await
    }

    async fn fetch_record(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, AdapterError> {
        self.inner.fetch(table, key).await
    }

    async fn validate_consistency(
        &self,
        table: &str,
        key: &str,
        expected_hash: &str,
    ) -> Result<bool, AdapterError> {
        self.inner.hash_matches(table, key, expected_hash).await
    }

    async fn scan(
        &self,
        table: &str,
        since: Option<i64>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, AdapterError> {
        self.inner.scan(table, since, after_key, limit).await
    }

    async fn health_status(&self) -> AdapterHealth {
        self.inner.health().await
    }

    fn circuit_state(&self) -> CircuitState {
        self.inner.breaker().state()
    }
}
