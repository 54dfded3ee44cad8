//! Public write, status, repair and backfill API.

use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::canonical::record_hash;
use crate::error::SyncError;
use crate::metrics::LatencyTimer;
use crate::operation::{
    now_millis, record_key, ConsistencyLevel, OperationStatus, OperationType, Payload, Record,
    SyncOperation, SyncStrategy,
};
use crate::resilience::retry::{retry, RetryConfig};

use super::failure::Settled;
use super::types::{
    BackfillReport, BackfillStatus, ConfigEcho, ConsistencyReport, ConsistencyStatus,
    DeadLetterSummary, EngineState, SyncStatus, WriteReceipt,
};
use super::SyncService;

impl SyncService {
    /// Create a row in both stores.
    ///
    /// The key is `key` if given, else the row's key field, else a fresh UUID
    /// (which is also written into the row's key field).
    pub async fn dual_write_create(
        &self,
        table: &str,
        key: Option<String>,
        mut data: Record,
        consistency: ConsistencyLevel,
        strategy: SyncStrategy,
    ) -> Result<WriteReceipt, SyncError> {
        self.core.ensure_accepting()?;
        let key_field = self.core.config.read().key_field.clone();
        let key = match key.or_else(|| record_key(&data, &key_field)) {
            Some(key) => key,
            None => {
                let generated = Uuid::new_v4().to_string();
                data.insert(key_field, generated.clone().into());
                generated
            }
        };
        let op = self.build(OperationType::Create, table, Some(key), Payload::row(data), consistency, strategy);
        Ok(self.dispatch(op).await)
    }

    /// Merge `data` into an existing row.
    pub async fn dual_write_update(
        &self,
        table: &str,
        key: &str,
        data: Record,
        consistency: ConsistencyLevel,
        strategy: SyncStrategy,
    ) -> Result<WriteReceipt, SyncError> {
        self.core.ensure_accepting()?;
        if key.is_empty() {
            return Err(SyncError::MissingKey);
        }
        let op = self.build(
            OperationType::Update,
            table,
            Some(key.to_string()),
            Payload::row(data),
            consistency,
            strategy,
        );
        Ok(self.dispatch(op).await)
    }

    /// Delete a row from both stores.
    ///
    /// `data`, when given, is the row being deleted; it lets the service
    /// restore the analytical copy if the transactional delete fails.
    pub async fn dual_write_delete(
        &self,
        table: &str,
        key: &str,
        data: Option<Record>,
        consistency: ConsistencyLevel,
        strategy: SyncStrategy,
    ) -> Result<WriteReceipt, SyncError> {
        self.core.ensure_accepting()?;
        if key.is_empty() {
            return Err(SyncError::MissingKey);
        }
        let payload = data.map_or_else(Payload::empty, Payload::row);
        let op = self.build(
            OperationType::Delete,
            table,
            Some(key.to_string()),
            payload,
            consistency,
            strategy,
        );
        Ok(self.dispatch(op).await)
    }

    /// Write many rows as one operation. Rows are keyed by the key field.
    pub async fn dual_write_bulk(
        &self,
        table: &str,
        operation_type: OperationType,
        rows: Vec<Record>,
        consistency: ConsistencyLevel,
        strategy: SyncStrategy,
    ) -> Result<WriteReceipt, SyncError> {
        self.core.ensure_accepting()?;
        if !operation_type.is_bulk() {
            return Err(SyncError::Decode(format!("{operation_type} is not a bulk operation")));
        }
        let key_field = self.core.config.read().key_field.clone();
        if rows.iter().any(|row| record_key(row, &key_field).is_none()) {
            return Err(SyncError::MissingKey);
        }
        let op = self.build(operation_type, table, None, Payload::rows(rows), consistency, strategy);
        Ok(self.dispatch(op).await)
    }

    /// Submit a pre-built operation (e.g. decoded with [`SyncOperation::from_json_bytes`]).
    ///
    /// The operation must be PENDING. Single-row operations without a key
    /// take it from the row's key field.
    pub async fn submit(&self, mut op: SyncOperation) -> Result<WriteReceipt, SyncError> {
        self.core.ensure_accepting()?;
        if op.status != OperationStatus::Pending {
            return Err(SyncError::InvalidTransition {
                from: op.status,
                to: OperationStatus::InProgress,
            });
        }
        if !op.operation_type.is_bulk() && op.primary_key.is_none() {
            let key_field = self.core.config.read().key_field.clone();
            op.primary_key = op.data.as_row().and_then(|row| record_key(row, &key_field));
            if op.primary_key.is_none() {
                return Err(SyncError::MissingKey);
            }
        }
        Ok(self.dispatch(op).await)
    }

    fn build(
        &self,
        operation_type: OperationType,
        table: &str,
        key: Option<String>,
        data: Payload,
        consistency: ConsistencyLevel,
        strategy: SyncStrategy,
    ) -> SyncOperation {
        let max_retries = self.core.config.read().max_retries;
        SyncOperation::new(operation_type, table, key, data, consistency, strategy, max_retries)
    }

    async fn dispatch(&self, op: SyncOperation) -> WriteReceipt {
        if op.consistency_level == ConsistencyLevel::Strong {
            return self.execute_strong(op).await;
        }

        let operation_id = op.operation_id.clone();
        let lane = op.strategy;
        self.core.history.record(&op);
        match self.core.lanes.try_send(lane, op) {
            Ok(()) => {
                debug!(operation_id = %operation_id, lane = lane.as_str(), "Operation queued");
                WriteReceipt { accepted: true, operation_id }
            }
            Err(_) => {
                warn!(operation_id = %operation_id, lane = lane.as_str(), "Lane full, operation rejected");
                crate::metrics::record_queue_rejection(lane.as_str());
                self.core.history.remove(&operation_id);
                WriteReceipt { accepted: false, operation_id }
            }
        }
    }

    /// Synchronous dual-write: primary first, then analytical.
    ///
    /// A primary failure is reported to the caller. An analytical failure
    /// after a primary success is accepted and repaired on the recovery lane.
    async fn execute_strong(&self, mut op: SyncOperation) -> WriteReceipt {
        let core = &self.core;
        let timer = LatencyTimer::new("strong", op.operation_type.as_str());
        let operation_id = op.operation_id.clone();

        if let Err(e) = op.transition(OperationStatus::InProgress) {
            error!(operation_id = %operation_id, error = %e, "Operation cannot be attempted");
            return WriteReceipt { accepted: false, operation_id };
        }
        core.history.record(&op);

        if let Err(e) = core.primary.execute_operation(&op).await {
            warn!(operation_id = %operation_id, error = %e, "Strong write rejected by primary");
            op.record_error(e.to_string());
            if let Err(e) = op.transition(OperationStatus::Failed) {
                error!(operation_id = %operation_id, error = %e, "Status transition refused");
            }
            core.history.record(&op);
            core.metrics.lock().record_failure(timer.elapsed());
            crate::metrics::record_operation("strong", op.operation_type.as_str(), "failed");
            return WriteReceipt { accepted: false, operation_id };
        }
        op.primary_success = true;

        match core.analytical.execute_operation(&op).await {
            Ok(()) => {
                op.secondary_success = true;
                if let Err(e) = op.transition(OperationStatus::Completed) {
                    error!(operation_id = %operation_id, error = %e, "Status transition refused");
                }
                core.history.record(&op);
                core.metrics.lock().record_success(timer.elapsed(), now_millis());
                crate::metrics::record_operation("strong", op.operation_type.as_str(), "completed");
            }
            Err(e) => {
                warn!(
                    operation_id = %operation_id,
                    error = %e,
                    "Strong write reached primary only, scheduling analytical repair"
                );
                op.record_error(e.to_string());
                if let Settled::Retry(op) = core.settle(op, "strong", timer.elapsed()).await {
                    core.try_hand_to_recovery(op);
                }
            }
        }
        WriteReceipt { accepted: true, operation_id }
    }

    /// Latest snapshot of an operation, if still in history.
    #[must_use]
    pub fn get_operation(&self, operation_id: &str) -> Option<SyncOperation> {
        self.core.history.get(operation_id)
    }

    /// Status document: lane depths, dead letters, metrics, adapter health, config.
    pub async fn get_sync_status(&self) -> SyncStatus {
        let core = &self.core;
        let (primary, analytical) = tokio::join!(
            core.primary.health_status(),
            core.analytical.health_status(),
        );
        let queue_depths = core.lanes.depths();
        let metrics = {
            let mut metrics = core.metrics.lock();
            metrics.queue_depth = queue_depths.total();
            metrics.clone()
        };
        let config = core.config();

        SyncStatus {
            state: core.state(),
            queue_depths,
            dead_letter_count: core.dead_letters.len(),
            history_size: core.history.len(),
            average_latency_ms: metrics.average_latency_ms,
            consistency_score: metrics.consistency_score(),
            metrics,
            primary,
            analytical,
            config: ConfigEcho {
                batch_size: config.batch_size,
                batch_interval_ms: config.batch_interval_ms,
                near_real_time_flush_ms: config.near_real_time_flush_ms,
                max_retries: config.max_retries,
                retry_base_delay_ms: config.retry_base_delay_ms,
                queue_capacity: config.queue_capacity,
            },
        }
    }

    /// Compare a row's canonical hash across both stores.
    ///
    /// The transactional row is the reference; each adapter then confirms
    /// the same hash is observable in its own store.
    #[tracing::instrument(skip(self))]
    pub async fn validate_consistency(&self, table: &str, key: &str) -> Result<ConsistencyReport, SyncError> {
        let core = &self.core;
        let checked_at = now_millis();

        let Some(reference) = core.primary.fetch_record(table, key).await? else {
            crate::metrics::record_consistency_check(ConsistencyStatus::NotFound.as_str());
            return Ok(ConsistencyReport {
                status: ConsistencyStatus::NotFound,
                primary_valid: false,
                analytical_valid: false,
                data_hash: None,
                checked_at,
            });
        };
        let hash = record_hash(&reference.data);

        let (primary_valid, analytical_valid) = tokio::join!(
            core.primary.validate_consistency(table, key, &hash),
            core.analytical.validate_consistency(table, key, &hash),
        );
        let (primary_valid, analytical_valid) = (primary_valid?, analytical_valid?);
        let status = if primary_valid && analytical_valid {
            ConsistencyStatus::Consistent
        } else {
            ConsistencyStatus::Inconsistent
        };
        crate::metrics::record_consistency_check(status.as_str());
        debug!(table, key, status = status.as_str(), "Consistency checked");

        Ok(ConsistencyReport {
            status,
            primary_valid,
            analytical_valid,
            data_hash: Some(hash),
            checked_at,
        })
    }

    /// Re-route a failed operation to the recovery lane.
    ///
    /// Dead-lettered operations go through [`retry_dead_letter_operation`](Self::retry_dead_letter_operation).
    /// Other operations qualify only while FAILED; anything still moving or
    /// already settled returns `false`. The retry budget is doubled when the
    /// operation was not already on the recovery strategy.
    pub async fn handle_sync_failure(&self, operation_id: &str) -> Result<bool, SyncError> {
        self.core.ensure_accepting()?;
        if self.core.dead_letters.contains(operation_id) {
            return self.retry_dead_letter_operation(operation_id).await;
        }

        let Some(mut op) = self.core.history.get(operation_id) else {
            return Ok(false);
        };
        if op.status != OperationStatus::Failed {
            debug!(operation_id, status = %op.status, "Operation not eligible for recovery");
            return Ok(false);
        }
        if op.strategy != SyncStrategy::Recovery {
            op.strategy = SyncStrategy::Recovery;
            op.max_retries = op.max_retries.saturating_mul(2);
        }
        info!(operation_id, "Re-routing failed operation to recovery lane");
        Ok(self.core.try_hand_to_recovery(op))
    }

    #[must_use]
    pub fn get_dead_letter_operations(&self) -> Vec<DeadLetterSummary> {
        self.core.dead_letters.summaries()
    }

    /// Take an operation out of the dead-letter store and queue it for recovery
    /// with a fresh retry budget. Per-store success is kept, so only the store
    /// that never applied it is written.
    pub async fn retry_dead_letter_operation(&self, operation_id: &str) -> Result<bool, SyncError> {
        self.core.ensure_accepting()?;
        let Some(original) = self.core.dead_letters.take(operation_id) else {
            return Ok(false);
        };

        let mut op = original.clone();
        op.retry_count = 0;
        op.error_message = None;
        op.strategy = SyncStrategy::Recovery;
        op.max_retries = self.core.config.read().max_retries.saturating_mul(2);

        if self.core.try_hand_to_recovery(op) {
            info!(operation_id, "Dead-lettered operation queued for recovery");
            Ok(true)
        } else {
            self.core.history.record(&original);
            self.core.dead_letters.restore(original);
            Ok(false)
        }
    }

    /// Same as [`sync_from_primary`](Self::sync_from_primary), under the name
    /// audit tooling calls it by.
    pub async fn sync_from_postgresql(
        &self,
        table: &str,
        since_millis: Option<i64>,
        batch_size: Option<usize>,
    ) -> Result<BackfillReport, SyncError> {
        self.sync_from_primary(table, since_millis, batch_size).await
    }

    /// Replay rows from the transactional store into the analytical store.
    ///
    /// Pages through `table` in key order (optionally only rows written at or
    /// after `since_millis`) and queues one BATCH create per row with the
    /// primary side already satisfied. Creates are upserts, so running it
    /// twice over the same rows is harmless.
    #[tracing::instrument(skip(self))]
    pub async fn sync_from_primary(
        &self,
        table: &str,
        since_millis: Option<i64>,
        batch_size: Option<usize>,
    ) -> Result<BackfillReport, SyncError> {
        let core = &self.core;
        if core.state() != EngineState::Running {
            return Err(SyncError::NotAccepting(core.state()));
        }
        let (page_size, max_retries) = {
            let config = core.config.read();
            (batch_size.unwrap_or(config.backfill_batch_size).max(1), config.max_retries)
        };

        let started = Instant::now();
        let mut after: Option<String> = None;
        let mut records_synced = 0;
        let mut errors = 0;
        let mut failure = None;

        info!(table, page_size, "Backfill from primary started");
        loop {
            let page = retry("backfill_scan", &RetryConfig::query(), || {
                core.primary.scan(table, since_millis, after.as_deref(), page_size)
            })
            .await;
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    error!(table, error = %e, "Backfill aborted, primary scan failed");
                    failure = Some(e.to_string());
                    break;
                }
            };
            let Some(last) = page.last() else { break };
            after = Some(last.key.clone());
            let full_page = page.len() == page_size;

            for row in page {
                let mut op = SyncOperation::new(
                    OperationType::Create,
                    table,
                    Some(row.key),
                    Payload::row(row.data),
                    ConsistencyLevel::Eventual,
                    SyncStrategy::Batch,
                    max_retries,
                );
                op.primary_success = true;
                core.history.record(&op);
                let operation_id = op.operation_id.clone();
                match core.lanes.send(SyncStrategy::Batch, op).await {
                    Ok(()) => records_synced += 1,
                    Err(_) => {
                        core.history.remove(&operation_id);
                        errors += 1;
                    }
                }
            }

            if !full_page {
                break;
            }
        }

        let status = match (&failure, errors) {
            (Some(_), _) => BackfillStatus::Failed,
            (None, 0) => BackfillStatus::Completed,
            (None, _) => BackfillStatus::Partial,
        };
        crate::metrics::record_backfill(table, records_synced, errors);
        let report = BackfillReport {
            status,
            records_synced,
            errors,
            duration_seconds: started.elapsed().as_secs_f64(),
            error: failure,
        };
        info!(
            table,
            records_synced,
            errors,
            duration_seconds = report.duration_seconds,
            "Backfill from primary finished"
        );
        Ok(report)
    }
}
