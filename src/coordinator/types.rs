//! Public types for the sync service coordinator.

use serde::Serialize;

use crate::adapter::AdapterHealth;
use crate::metrics::SyncMetrics;
use crate::operation::{OperationType, SyncOperation};

/// Service lifecycle state.
///
/// Use [`super::SyncService::state()`] to check current state or
/// [`super::SyncService::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Built, workers not yet spawned. Writes are accepted and queue up.
    Created,
    /// Workers running
    Running,
    /// Graceful shutdown in progress; new writes are rejected
    ShuttingDown,
    /// All workers have exited
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn accepts_writes(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What a write call returns: whether the service took the operation, and its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub accepted: bool,
    pub operation_id: String,
}

/// Depth of each lane at the time of the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneDepths {
    pub real_time: usize,
    pub near_real_time: usize,
    pub batch: usize,
    pub recovery: usize,
}

impl LaneDepths {
    #[must_use]
    pub fn total(&self) -> usize {
        self.real_time + self.near_real_time + self.batch + self.recovery
    }
}

/// Configuration values echoed in the status document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEcho {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub near_real_time_flush_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub queue_capacity: usize,
}

/// Status document returned by `get_sync_status()`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: EngineState,
    pub queue_depths: LaneDepths,
    pub dead_letter_count: usize,
    pub history_size: usize,
    pub average_latency_ms: f64,
    pub consistency_score: f64,
    pub metrics: SyncMetrics,
    pub primary: AdapterHealth,
    pub analytical: AdapterHealth,
    pub config: ConfigEcho,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Consistent,
    Inconsistent,
    /// The transactional store has no such row
    NotFound,
}

impl ConsistencyStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consistent => "consistent",
            Self::Inconsistent => "inconsistent",
            Self::NotFound => "not_found",
        }
    }
}

/// Result of `validate_consistency()`.
///
/// Serialized with the audit field names `postgresql_valid` and `duckdb_valid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub status: ConsistencyStatus,
    #[serde(rename = "postgresql_valid")]
    pub primary_valid: bool,
    #[serde(rename = "duckdb_valid")]
    pub analytical_valid: bool,
    /// Hash of the transactional row; `None` when it does not exist
    pub data_hash: Option<String>,
    /// Epoch millis
    pub checked_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Completed,
    /// Some rows could not be queued
    Partial,
    /// Reading the transactional store failed
    Failed,
}

/// Result of `sync_from_primary()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillReport {
    pub status: BackfillStatus,
    /// Rows queued for the analytical store
    pub records_synced: usize,
    pub errors: usize,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

/// Dead-letter entry as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterSummary {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub table_name: String,
    pub primary_key: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub primary_success: bool,
    pub secondary_success: bool,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub dead_lettered_at: i64,
}

impl DeadLetterSummary {
    pub(super) fn new(op: &SyncOperation, dead_lettered_at: i64) -> Self {
        Self {
            operation_id: op.operation_id.clone(),
            operation_type: op.operation_type,
            table_name: op.table_name.clone(),
            primary_key: op.primary_key.clone(),
            retry_count: op.retry_count,
            max_retries: op.max_retries,
            primary_success: op.primary_success,
            secondary_success: op.secondary_success,
            error_message: op.error_message.clone(),
            created_at: op.created_at,
            dead_lettered_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }

    #[test]
    fn test_only_created_and_running_accept_writes() {
        assert!(EngineState::Created.accepts_writes());
        assert!(EngineState::Running.accepts_writes());
        assert!(!EngineState::ShuttingDown.accepts_writes());
        assert!(!EngineState::Stopped.accepts_writes());
    }

    #[test]
    fn test_lane_depth_total() {
        let depths = LaneDepths { real_time: 1, near_real_time: 2, batch: 3, recovery: 4 };
        assert_eq!(depths.total(), 10);
    }

    #[test]
    fn test_consistency_report_uses_audit_field_names() {
        let report = ConsistencyReport {
            status: ConsistencyStatus::Inconsistent,
            primary_valid: true,
            analytical_valid: false,
            data_hash: Some("ab".into()),
            checked_at: 1,
        };
        let doc = serde_json::to_value(&report).unwrap();
        assert_eq!(doc["postgresql_valid"], true);
        assert_eq!(doc["duckdb_valid"], false);
        assert!(doc.get("primary_valid").is_none());
    }

    #[test]
    fn test_consistency_status_serializes_lowercase() {
        let json = serde_json::to_string(&ConsistencyStatus::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        assert_eq!(ConsistencyStatus::Consistent.as_str(), "consistent");
    }
}
