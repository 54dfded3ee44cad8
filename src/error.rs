// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service-level error type.

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::coordinator::EngineState;
use crate::operation::OperationStatus;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The service is shutting down or stopped
    #[error("sync service is not accepting operations (state: {0})")]
    NotAccepting(EngineState),

    #[error("sync service already initialized")]
    AlreadyInitialized,

    /// Update/delete without a key, or a create whose key cannot be derived
    #[error("operation requires a primary key")]
    MissingKey,

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("unsupported payload schema version {0}")]
    UnsupportedSchema(u16),

    #[error("failed to decode operation: {0}")]
    Decode(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
