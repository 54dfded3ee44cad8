//! One attempt of an operation, and what happens after it.
//!
//! After both stores have been tried the outcome pair decides the next step:
//!
//! | primary | analytical | next step |
//! |---|---|---|
//! | ok | ok | COMPLETED |
//! | ok | failed | retry on the recovery lane, or dead-letter once the budget is spent |
//! | failed | ok | compensate the analytical write (inverse operation) |
//! | failed | failed | FAILED, then retry or dead-letter as above |
//!
//! Per-store success is sticky: a retry only writes to the store that has
//! not yet applied the operation.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterError;
use crate::metrics::LatencyTimer;
use crate::operation::{now_millis, OperationStatus, SyncOperation, SyncStrategy};

use super::{EngineState, SyncCore};

/// Next step after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Complete,
    Compensate,
    Retry,
    DeadLetter,
}

/// Decide the next step from per-store outcomes and the retry count
/// *before* this failure is counted.
pub(crate) fn resolve(
    primary_ok: bool,
    analytical_ok: bool,
    retry_count: u32,
    max_retries: u32,
) -> Resolution {
    match (primary_ok, analytical_ok) {
        (true, true) => Resolution::Complete,
        (false, true) => Resolution::Compensate,
        _ if retry_count.saturating_add(1) > max_retries => Resolution::DeadLetter,
        _ => Resolution::Retry,
    }
}

/// Where an operation stands after [`SyncCore::attempt`].
#[derive(Debug)]
pub(super) enum Settled {
    /// Completed, compensated, or dead-lettered
    Done,
    /// Retry budget left. FAILED when the primary still needs the write;
    /// otherwise still IN_PROGRESS so it moves straight to RETRYING on hand-off.
    Retry(SyncOperation),
}

impl SyncCore {
    /// Run one attempt against whichever stores still need the operation,
    /// then settle it.
    pub(super) async fn attempt(&self, mut op: SyncOperation, lane: SyncStrategy) -> Settled {
        let timer = LatencyTimer::new(lane.as_str(), op.operation_type.as_str());

        if let Err(e) = op.transition(OperationStatus::InProgress) {
            error!(operation_id = %op.operation_id, error = %e, "Operation cannot be attempted");
            return Settled::Done;
        }
        self.history.record(&op);
        debug!(
            operation_id = %op.operation_id,
            lane = lane.as_str(),
            attempt = op.retry_count + 1,
            "Attempting dual-write"
        );

        let (primary, analytical) = tokio::join!(
            async {
                if op.primary_success {
                    None
                } else {
                    Some(self.primary.execute_operation(&op).await)
                }
            },
            async {
                if op.secondary_success {
                    None
                } else {
                    Some(self.analytical.execute_operation(&op).await)
                }
            },
        );
        if let Some(ok) = record_outcome(&mut op, primary) {
            op.primary_success = ok;
        }
        if let Some(ok) = record_outcome(&mut op, analytical) {
            op.secondary_success = ok;
        }

        self.settle(op, lane.as_str(), timer.elapsed()).await
    }

    /// Apply the decision table to an attempted operation. `label` tags the
    /// outcome metrics with the lane (or "strong") that made the attempt.
    pub(super) async fn settle(
        &self,
        mut op: SyncOperation,
        label: &str,
        elapsed: Duration,
    ) -> Settled {
        let op_name = op.operation_type.as_str();

        match resolve(op.primary_success, op.secondary_success, op.retry_count, op.max_retries) {
            Resolution::Complete => {
                self.finish(&mut op, OperationStatus::Completed);
                self.metrics.lock().record_success(elapsed, now_millis());
                crate::metrics::record_operation(label, op_name, "completed");
                debug!(operation_id = %op.operation_id, "Dual-write completed");
                Settled::Done
            }
            Resolution::Compensate => {
                self.compensate(op, label, elapsed).await;
                Settled::Done
            }
            Resolution::DeadLetter => {
                op.retry_count += 1;
                self.finish(&mut op, OperationStatus::Failed);
                self.dead_letter(op, label, elapsed);
                Settled::Done
            }
            Resolution::Retry => {
                op.retry_count += 1;
                if !op.primary_success {
                    self.finish(&mut op, OperationStatus::Failed);
                }

                warn!(
                    operation_id = %op.operation_id,
                    retry_count = op.retry_count,
                    max_retries = op.max_retries,
                    error = op.error_message.as_deref().unwrap_or(""),
                    "Dual-write failed, will retry"
                );
                crate::metrics::record_operation(label, op_name, "retrying");
                crate::metrics::record_retry(label);
                self.history.record(&op);
                Settled::Retry(op)
            }
        }
    }

    /// Undo the analytical write of an operation the primary rejected.
    async fn compensate(&self, mut op: SyncOperation, label: &str, elapsed: Duration) {
        let op_name = op.operation_type.as_str();

        let Some(inverse) = op.inverse() else {
            warn!(
                operation_id = %op.operation_id,
                operation = op_name,
                table = %op.table_name,
                "Primary failed after analytical write; no inverse without the prior value, manual repair needed"
            );
            crate::metrics::record_compensation(op_name, "skipped");
            op.record_error("analytical write left in place: no compensating operation");
            self.finish(&mut op, OperationStatus::Compensated);
            self.metrics.lock().record_failure(elapsed);
            crate::metrics::record_operation(label, op_name, "compensated");
            return;
        };

        match self.analytical.execute_operation(&inverse).await {
            Ok(()) => {
                info!(
                    operation_id = %op.operation_id,
                    compensation = inverse.operation_type.as_str(),
                    "Analytical write compensated"
                );
                crate::metrics::record_compensation(op_name, "applied");
                op.secondary_success = false;
                self.finish(&mut op, OperationStatus::Compensated);
                self.metrics.lock().record_failure(elapsed);
                crate::metrics::record_operation(label, op_name, "compensated");
            }
            Err(e) => {
                error!(
                    operation_id = %op.operation_id,
                    error = %e,
                    "Compensation failed, analytical store diverges from primary"
                );
                crate::metrics::record_compensation(op_name, "failed");
                op.record_error(format!("compensation failed: {e}"));
                self.finish(&mut op, OperationStatus::Failed);
                self.dead_letter(op, label, elapsed);
            }
        }
    }

    /// Move a FAILED operation to the dead-letter store.
    fn dead_letter(&self, op: SyncOperation, label: &str, elapsed: Duration) {
        info!(
            operation_id = %op.operation_id,
            retry_count = op.retry_count,
            max_retries = op.max_retries,
            error = op.error_message.as_deref().unwrap_or(""),
            "Operation moved to dead-letter store"
        );
        self.history.record(&op);
        self.metrics.lock().record_failure(elapsed);
        crate::metrics::record_operation(label, op.operation_type.as_str(), "failed");
        crate::metrics::record_dead_letter();

        if let Some(evicted) = self.dead_letters.push(op) {
            warn!(operation_id = %evicted.operation_id, "Dead-letter store full, oldest entry dropped");
            crate::metrics::record_eviction("dead_letter", 1);
        }
    }

    /// Transition and record in history. Illegal transitions are logged, never fatal.
    fn finish(&self, op: &mut SyncOperation, status: OperationStatus) {
        if let Err(e) = op.transition(status) {
            error!(operation_id = %op.operation_id, error = %e, "Status transition refused");
        }
        self.history.record(op);
    }

    /// Queue a retry on the recovery lane, waiting for room.
    ///
    /// Stops waiting once shutdown begins. If the operation cannot be queued
    /// it stays FAILED in history for `handle_sync_failure`.
    pub(super) async fn hand_to_recovery(&self, op: SyncOperation) -> bool {
        let mut state = self.state.subscribe();
        let slot = tokio::select! {
            slot = self.lanes.reserve(SyncStrategy::Recovery) => slot,
            _ = shutting_down(&mut state) => None,
        };
        let Some(slot) = slot else {
            return self.try_hand_to_recovery(op);
        };
        let Some(queued) = self.as_retrying(&op) else { return false };
        slot.send(queued);
        true
    }

    /// Non-blocking variant of [`hand_to_recovery`](Self::hand_to_recovery).
    pub(super) fn try_hand_to_recovery(&self, op: SyncOperation) -> bool {
        let Some(queued) = self.as_retrying(&op) else { return false };
        match self.lanes.try_send(SyncStrategy::Recovery, queued) {
            Ok(()) => true,
            Err(_) => {
                error!(operation_id = %op.operation_id, "Recovery lane full or closed, operation left FAILED");
                crate::metrics::record_queue_rejection(SyncStrategy::Recovery.as_str());
                self.leave_failed(op);
                false
            }
        }
    }

    /// Park a retry that could not be queued as FAILED.
    fn leave_failed(&self, mut op: SyncOperation) {
        if op.status == OperationStatus::InProgress {
            self.finish(&mut op, OperationStatus::Failed);
        } else {
            self.history.record(&op);
        }
    }

    pub(super) fn as_retrying(&self, op: &SyncOperation) -> Option<SyncOperation> {
        let mut queued = op.clone();
        if let Err(e) = queued.transition(OperationStatus::Retrying) {
            error!(operation_id = %op.operation_id, error = %e, "Operation cannot be retried");
            return None;
        }
        self.history.record(&queued);
        Some(queued)
    }
}

async fn shutting_down(state: &mut watch::Receiver<EngineState>) {
    let _ = state.wait_for(|state| !state.accepts_writes()).await;
}

/// New success flag for one store, or `None` when the store was skipped.
/// Errors are appended to the operation's message.
fn record_outcome(op: &mut SyncOperation, outcome: Option<Result<(), AdapterError>>) -> Option<bool> {
    match outcome? {
        Ok(()) => Some(true),
        Err(e) => {
            op.record_error(e.to_string());
            Some(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::coordinator::SyncService;
    use crate::operation::{ConsistencyLevel, OperationType, Payload};
    use crate::storage::memory::InMemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_both_ok_completes() {
        assert_eq!(resolve(true, true, 0, 3), Resolution::Complete);
        assert_eq!(resolve(true, true, 3, 3), Resolution::Complete);
    }

    #[test]
    fn test_primary_failed_analytical_ok_compensates() {
        assert_eq!(resolve(false, true, 0, 3), Resolution::Compensate);
        assert_eq!(resolve(false, true, 9, 3), Resolution::Compensate);
    }

    #[test]
    fn test_partial_failure_retries_within_budget() {
        assert_eq!(resolve(true, false, 0, 3), Resolution::Retry);
        assert_eq!(resolve(true, false, 2, 3), Resolution::Retry);
        assert_eq!(resolve(false, false, 2, 3), Resolution::Retry);
    }

    #[test]
    fn test_dead_letter_exactly_when_count_exceeds_budget() {
        // retry_count becomes 4 > 3 on this failure
        assert_eq!(resolve(true, false, 3, 3), Resolution::DeadLetter);
        assert_eq!(resolve(false, false, 3, 3), Resolution::DeadLetter);
        assert_eq!(resolve(false, false, 0, 0), Resolution::DeadLetter);
    }

    fn delete_op() -> SyncOperation {
        SyncOperation::new(
            OperationType::Delete,
            "pages",
            Some("1".into()),
            Payload::empty(),
            ConsistencyLevel::Eventual,
            SyncStrategy::RealTime,
            3,
        )
    }

    fn service() -> SyncService {
        let config = SyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        SyncService::with_stores(config, rx, Arc::new(InMemoryStore::new()), Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_analytical_only_failure_skips_failed_status() {
        let service = service();
        let core = &service.core;

        let mut op = delete_op();
        op.transition(OperationStatus::InProgress).unwrap();
        op.primary_success = true;
        op.record_error("analytical unavailable");

        let Settled::Retry(op) = core.settle(op, "real_time", Duration::ZERO).await else {
            panic!("expected a retry");
        };
        assert_eq!(op.status, OperationStatus::InProgress);
        assert_eq!(op.retry_count, 1);
        let seen = core.history.get(&op.operation_id).unwrap();
        assert_eq!(seen.status, OperationStatus::InProgress);

        assert!(core.try_hand_to_recovery(op.clone()));
        assert_eq!(core.history.get(&op.operation_id).unwrap().status, OperationStatus::Retrying);
    }

    #[tokio::test]
    async fn test_double_failure_is_marked_failed_before_retry() {
        let service = service();
        let core = &service.core;

        let mut op = delete_op();
        op.transition(OperationStatus::InProgress).unwrap();

        let Settled::Retry(op) = core.settle(op, "real_time", Duration::ZERO).await else {
            panic!("expected a retry");
        };
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(core.history.get(&op.operation_id).unwrap().status, OperationStatus::Failed);
    }

    #[test]
    fn test_failed_outcome_records_error() {
        let mut op = delete_op();
        assert_eq!(record_outcome(&mut op, Some(Ok(()))), Some(true));
        assert_eq!(record_outcome(&mut op, None), None);
        assert!(op.error_message.is_none());

        let rejected = Err(AdapterError::CircuitOpen { store: "analytical".into() });
        assert_eq!(record_outcome(&mut op, Some(rejected)), Some(false));
        assert!(op.error_message.unwrap().contains("circuit breaker is open"));
    }
}
