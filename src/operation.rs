//! Sync operation data structure.
//!
//! The [`SyncOperation`] is the unit of work that flows through the service.
//! It names a table and key, carries a schema-versioned [`Payload`], and
//! tracks its own status, retry budget and per-store outcome.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// A single row: field name to JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Current payload envelope version.
pub const PAYLOAD_SCHEMA_VERSION: u16 = 1;

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Extract a record key from a field, normalizing numbers to their decimal text.
#[must_use]
pub fn record_key(record: &Record, key_field: &str) -> Option<String> {
    match record.get(key_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    BulkInsert,
    BulkUpdate,
    BulkDelete,
}

impl OperationType {
    #[must_use]
    pub fn is_bulk(&self) -> bool {
        matches!(self, Self::BulkInsert | Self::BulkUpdate | Self::BulkDelete)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::BulkInsert => "bulk_insert",
            Self::BulkUpdate => "bulk_update",
            Self::BulkDelete => "bulk_delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-chosen guarantee strength. Immutable once the operation exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    /// Synchronous write to both stores
    Strong,
    Eventual,
    Weak,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strong => write!(f, "strong"),
            Self::Eventual => write!(f, "eventual"),
            Self::Weak => write!(f, "weak"),
        }
    }
}

/// Queue lane that receives an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    RealTime,
    NearRealTime,
    Batch,
    Recovery,
}

impl SyncStrategy {
    pub const ALL: [SyncStrategy; 4] = [
        Self::RealTime,
        Self::NearRealTime,
        Self::Batch,
        Self::Recovery,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RealTime => "real_time",
            Self::NearRealTime => "near_real_time",
            Self::Batch => "batch",
            Self::Recovery => "recovery",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation status.
///
/// ```text
/// Pending ──► InProgress ──► Completed
///                 │ ▲  ├───► Compensated
///                 │ │  └───► Failed ──► Retrying
///                 ▼ │                      │
///              Retrying ◄──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
    Compensated,
}

impl OperationStatus {
    /// Whether `self -> next` is a legal transition.
    ///
    /// Failed only leaves via Retrying, when the failure handler or an operator
    /// re-routes the operation; a dead-lettered Failed stays put until
    /// explicitly retried.
    #[must_use]
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Retrying)
                | (InProgress, Compensated)
                | (Retrying, InProgress)
                | (Failed, Retrying)
        )
    }

    /// Completed and Compensated never change again.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Retrying => write!(f, "RETRYING"),
            Self::Compensated => write!(f, "COMPENSATED"),
        }
    }
}

/// Operation body, tagged by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PayloadBody {
    /// Deletes carry no data
    Empty,
    Row(Record),
    Rows(Vec<Record>),
}

/// Schema-versioned payload envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub schema_version: u16,
    pub body: PayloadBody,
}

impl Payload {
    #[must_use]
    pub fn empty() -> Self {
        Self { schema_version: PAYLOAD_SCHEMA_VERSION, body: PayloadBody::Empty }
    }

    #[must_use]
    pub fn row(record: Record) -> Self {
        Self { schema_version: PAYLOAD_SCHEMA_VERSION, body: PayloadBody::Row(record) }
    }

    #[must_use]
    pub fn rows(records: Vec<Record>) -> Self {
        Self { schema_version: PAYLOAD_SCHEMA_VERSION, body: PayloadBody::Rows(records) }
    }

    /// The single row, if this is a single-row payload.
    #[must_use]
    pub fn as_row(&self) -> Option<&Record> {
        match &self.body {
            PayloadBody::Row(r) => Some(r),
            _ => None,
        }
    }

    /// All rows carried, regardless of shape.
    #[must_use]
    pub fn records(&self) -> Vec<&Record> {
        match &self.body {
            PayloadBody::Empty => Vec::new(),
            PayloadBody::Row(r) => vec![r],
            PayloadBody::Rows(rs) => rs.iter().collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.body {
            PayloadBody::Empty => true,
            PayloadBody::Row(r) => r.is_empty(),
            PayloadBody::Rows(rs) => rs.is_empty(),
        }
    }

    /// Approximate serialized size, used for batch accounting in metrics.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.records()
            .iter()
            .map(|r| Value::Object((*r).clone()).to_string().len())
            .sum()
    }
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub table_name: String,
    /// Absent for bulk operations (rows carry their own keys)
    pub primary_key: Option<String>,
    pub data: Payload,
    pub consistency_level: ConsistencyLevel,
    pub strategy: SyncStrategy,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Sticky across attempts: a store that succeeded is not written again
    pub primary_success: bool,
    pub secondary_success: bool,
    pub error_message: Option<String>,
    /// Epoch millis
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncOperation {
    /// Create a pending operation with a fresh id.
    ///
    /// `base_max_retries` is doubled for the recovery strategy.
    pub fn new(
        operation_type: OperationType,
        table_name: impl Into<String>,
        primary_key: Option<String>,
        data: Payload,
        consistency_level: ConsistencyLevel,
        strategy: SyncStrategy,
        base_max_retries: u32,
    ) -> Self {
        let now = now_millis();
        let max_retries = if strategy == SyncStrategy::Recovery {
            base_max_retries.saturating_mul(2)
        } else {
            base_max_retries
        };
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            operation_type,
            table_name: table_name.into(),
            primary_key,
            data,
            consistency_level,
            strategy,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries,
            primary_success: false,
            secondary_success: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Decode an operation from JSON, rejecting payloads newer than this build understands.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let op: SyncOperation =
            serde_json::from_slice(bytes).map_err(|e| SyncError::Decode(e.to_string()))?;
        if op.data.schema_version > PAYLOAD_SCHEMA_VERSION {
            return Err(SyncError::UnsupportedSchema(op.data.schema_version));
        }
        Ok(op)
    }

    /// Move to `next`, refusing transitions outside the status machine.
    pub fn transition(&mut self, next: OperationStatus) -> Result<(), SyncError> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = now_millis();
        Ok(())
    }

    /// Append an error to the operation's message.
    pub fn record_error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.error_message = Some(match self.error_message.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}; {message}"),
            _ => message.to_string(),
        });
        self.updated_at = now_millis();
    }

    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    /// Both stores reflect this operation.
    #[must_use]
    pub fn fully_applied(&self) -> bool {
        self.primary_success && self.secondary_success
    }

    /// Inverse operation used to undo an analytical write when the primary failed.
    ///
    /// Creates and deletes swap. Updates have no inverse without the prior
    /// value, so they return `None`; so does a delete that carried no data.
    #[must_use]
    pub fn inverse(&self) -> Option<SyncOperation> {
        let (operation_type, data) = match self.operation_type {
            OperationType::Create => (OperationType::Delete, Payload::empty()),
            OperationType::BulkInsert => (OperationType::BulkDelete, self.data.clone()),
            OperationType::Delete if !self.data.is_empty() => {
                (OperationType::Create, self.data.clone())
            }
            OperationType::BulkDelete if !self.data.is_empty() => {
                (OperationType::BulkInsert, self.data.clone())
            }
            _ => return None,
        };

        let mut inverse = SyncOperation::new(
            operation_type,
            self.table_name.clone(),
            self.primary_key.clone(),
            data,
            self.consistency_level,
            self.strategy,
            0,
        );
        inverse.operation_id = format!("{}-compensation", self.operation_id);
        Some(inverse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn create_op(strategy: SyncStrategy) -> SyncOperation {
        SyncOperation::new(
            OperationType::Create,
            "pages",
            Some("42".into()),
            Payload::row(row(json!({"id": 42, "title": "x"}))),
            ConsistencyLevel::Eventual,
            strategy,
            3,
        )
    }

    #[test]
    fn test_new_operation_defaults() {
        let op = create_op(SyncStrategy::RealTime);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.max_retries, 3);
        assert!(!op.primary_success && !op.secondary_success);
        assert_eq!(op.operation_id.len(), 36);
    }

    #[test]
    fn test_recovery_strategy_doubles_budget() {
        let op = create_op(SyncStrategy::Recovery);
        assert_eq!(op.max_retries, 6);
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let a = create_op(SyncStrategy::Batch);
        let b = create_op(SyncStrategy::Batch);
        assert_ne!(a.operation_id, b.operation_id);
    }

    #[test]
    fn test_legal_transitions() {
        let mut op = create_op(SyncStrategy::RealTime);
        op.transition(OperationStatus::InProgress).unwrap();
        op.transition(OperationStatus::Failed).unwrap();
        op.transition(OperationStatus::Retrying).unwrap();
        op.transition(OperationStatus::InProgress).unwrap();
        op.transition(OperationStatus::Completed).unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
    }

    #[test]
    fn test_no_transition_skips_in_progress() {
        use OperationStatus::*;
        for target in [Completed, Failed, Compensated, Retrying] {
            assert!(!Pending.can_transition_to(target), "Pending -> {target}");
            assert!(!Retrying.can_transition_to(target), "Retrying -> {target}");
        }
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(InProgress));
    }

    #[test]
    fn test_final_states_are_sticky() {
        use OperationStatus::*;
        let all = [Pending, InProgress, Completed, Failed, Retrying, Compensated];
        for from in [Completed, Compensated] {
            for to in all {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_illegal_transition_is_an_error() {
        let mut op = create_op(SyncStrategy::RealTime);
        let err = op.transition(OperationStatus::Completed).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[test]
    fn test_retries_exhausted_boundary() {
        let mut op = create_op(SyncStrategy::RealTime);
        op.retry_count = 3;
        assert!(!op.retries_exhausted());
        op.retry_count = 4;
        assert!(op.retries_exhausted());
    }

    #[test]
    fn test_inverse_of_create_is_delete_same_key() {
        let op = create_op(SyncStrategy::RealTime);
        let inverse = op.inverse().unwrap();
        assert_eq!(inverse.operation_type, OperationType::Delete);
        assert_eq!(inverse.primary_key.as_deref(), Some("42"));
        assert_eq!(inverse.table_name, "pages");
        assert!(inverse.data.is_empty());
    }

    #[test]
    fn test_inverse_of_update_is_none() {
        let mut op = create_op(SyncStrategy::RealTime);
        op.operation_type = OperationType::Update;
        assert!(op.inverse().is_none());
    }

    #[test]
    fn test_inverse_of_delete_needs_data() {
        let mut op = create_op(SyncStrategy::RealTime);
        op.operation_type = OperationType::Delete;
        assert_eq!(op.inverse().unwrap().operation_type, OperationType::Create);

        op.data = Payload::empty();
        assert!(op.inverse().is_none());
    }

    #[test]
    fn test_record_error_appends() {
        let mut op = create_op(SyncStrategy::RealTime);
        op.record_error("primary: boom");
        op.record_error("analytical: down");
        assert_eq!(op.error_message.as_deref(), Some("primary: boom; analytical: down"));
    }

    #[test]
    fn test_record_key_normalization() {
        let r = row(json!({"id": 42, "slug": "abc", "empty": "", "flag": true}));
        assert_eq!(record_key(&r, "id").as_deref(), Some("42"));
        assert_eq!(record_key(&r, "slug").as_deref(), Some("abc"));
        assert_eq!(record_key(&r, "empty"), None);
        assert_eq!(record_key(&r, "flag"), None);
        assert_eq!(record_key(&r, "missing"), None);
    }

    #[test]
    fn test_json_roundtrip_and_schema_guard() {
        let op = create_op(SyncStrategy::Batch);
        let bytes = serde_json::to_vec(&op).unwrap();
        let decoded = SyncOperation::from_json_bytes(&bytes).unwrap();
        assert_eq!(decoded, op);

        let mut future = op.clone();
        future.data.schema_version = PAYLOAD_SCHEMA_VERSION + 1;
        let bytes = serde_json::to_vec(&future).unwrap();
        assert!(matches!(
            SyncOperation::from_json_bytes(&bytes),
            Err(SyncError::UnsupportedSchema(v)) if v == PAYLOAD_SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn test_wire_names() {
        let op = create_op(SyncStrategy::NearRealTime);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["operation_type"], "CREATE");
        assert_eq!(value["strategy"], "NEAR_REAL_TIME");
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["data"]["body"]["kind"], "row");
    }
}
