// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync service coordinator.
//!
//! The [`SyncService`] is the orchestrator that ties together all components:
//! - Two store adapters (transactional system of record, analytical replica),
//!   each behind its own circuit breaker
//! - Four bounded lanes (real-time, near-real-time, batch, recovery), each
//!   drained by one long-lived worker
//! - The operation history index and the dead-letter store
//! - A metrics loop that samples queue depths and applies config updates
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use dual_sync::{ConsistencyLevel, EngineState, SyncConfig, SyncService, SyncStrategy};
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), dual_sync::SyncError> {
//! let config = SyncConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let service = SyncService::connect(config, rx).await?;
//! assert_eq!(service.state(), EngineState::Created);
//!
//! service.initialize().await?;
//! let receipt = service
//!     .dual_write_create(
//!         "pages",
//!         None,
//!         json!({"id": 42, "title": "x"}).as_object().cloned().unwrap_or_default(),
//!         ConsistencyLevel::Strong,
//!         SyncStrategy::RealTime,
//!     )
//!     .await?;
//! assert!(receipt.accepted);
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod types;
mod queues;
mod api;
mod lifecycle;
mod failure;
mod workers;

pub use types::{
    BackfillReport, BackfillStatus, ConfigEcho, ConsistencyReport, ConsistencyStatus,
    DeadLetterSummary, EngineState, LaneDepths, SyncStatus, WriteReceipt,
};

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::{AnalyticalAdapter, StoreAdapter, TransactionalAdapter};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::storage::memory::InMemoryStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::RecordStore;

use queues::{DeadLetterStore, LaneReceivers, Lanes, OperationHistory};

/// State shared between the public handle and the worker tasks.
pub(crate) struct SyncCore {
    /// Updated at runtime by the metrics loop
    config: RwLock<SyncConfig>,
    state: watch::Sender<EngineState>,
    primary: Arc<dyn StoreAdapter>,
    analytical: Arc<dyn StoreAdapter>,
    lanes: Lanes,
    history: OperationHistory,
    dead_letters: DeadLetterStore,
    metrics: Mutex<SyncMetrics>,
    /// Caps in-flight dual-writes during batch and recovery processing
    batch_limiter: Semaphore,
}

impl SyncCore {
    fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    fn ensure_accepting(&self) -> Result<(), SyncError> {
        let state = self.state();
        if state.accepts_writes() {
            Ok(())
        } else {
            Err(SyncError::NotAccepting(state))
        }
    }
}

/// Dual-write orchestrator.
///
/// Owns the lanes, the history, and the dead-letter store; adapters own
/// their stores and breakers. The service is `Send + Sync` and every method
/// takes `&self`, so it can be shared behind an `Arc`.
pub struct SyncService {
    core: Arc<SyncCore>,
    /// Taken by `initialize()`
    receivers: Mutex<Option<LaneReceivers>>,
    config_rx: Mutex<Option<watch::Receiver<SyncConfig>>>,
    /// Stops the real-time, near-real-time, batch and metrics loops
    lane_stop: watch::Sender<bool>,
    /// Stops the recovery loop, after the other lanes have handed off their retries
    recovery_stop: watch::Sender<bool>,
    lane_workers: Mutex<Vec<JoinHandle<()>>>,
    recovery_worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
    /// Create a service over two ready-made adapters.
    ///
    /// The service starts in `Created` state. Call [`initialize()`](Self::initialize)
    /// to spawn the workers.
    pub fn new(
        config: SyncConfig,
        config_rx: watch::Receiver<SyncConfig>,
        primary: Arc<dyn StoreAdapter>,
        analytical: Arc<dyn StoreAdapter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Created);
        let (lanes, receivers) = Lanes::bounded(config.queue_capacity);
        let (lane_stop, _) = watch::channel(false);
        let (recovery_stop, _) = watch::channel(false);

        let core = SyncCore {
            history: OperationHistory::new(config.history_capacity),
            dead_letters: DeadLetterStore::new(config.dead_letter_capacity),
            batch_limiter: Semaphore::new(config.batch_concurrency.max(1)),
            config: RwLock::new(config),
            state: state_tx,
            primary,
            analytical,
            lanes,
            metrics: Mutex::new(SyncMetrics::default()),
        };

        Self {
            core: Arc::new(core),
            receivers: Mutex::new(Some(receivers)),
            config_rx: Mutex::new(Some(config_rx)),
            lane_stop,
            recovery_stop,
            lane_workers: Mutex::new(Vec::new()),
            recovery_worker: Mutex::new(None),
        }
    }

    /// Create a service over two record stores, wrapping each in its adapter
    /// with the breaker settings from `config`.
    pub fn with_stores(
        config: SyncConfig,
        config_rx: watch::Receiver<SyncConfig>,
        primary: Arc<dyn RecordStore>,
        analytical: Arc<dyn RecordStore>,
    ) -> Self {
        let primary = Arc::new(TransactionalAdapter::new(
            primary,
            config.primary_circuit(),
            &config.key_field,
        ));
        let analytical = Arc::new(AnalyticalAdapter::new(
            analytical,
            config.analytical_circuit(),
            &config.key_field,
        ));
        Self::new(config, config_rx, primary, analytical)
    }

    /// Open the stores named in `config` and build the service.
    ///
    /// Without `primary_url` the transactional side runs in memory.
    #[tracing::instrument(skip(config, config_rx))]
    pub async fn connect(
        config: SyncConfig,
        config_rx: watch::Receiver<SyncConfig>,
    ) -> Result<Self, SyncError> {
        let primary: Arc<dyn RecordStore> = match config.primary_url.as_deref() {
            Some(url) => {
                info!(url = %url, "Connecting to transactional store...");
                Arc::new(SqlStore::new(url).await?)
            }
            None => {
                warn!("No primary URL configured - transactional store is in memory only!");
                Arc::new(InMemoryStore::new())
            }
        };
        let analytical = open_analytical(&config)?;
        info!(
            primary = primary.backend(),
            analytical = analytical.backend(),
            "Stores opened"
        );

        Ok(Self::with_stores(config, config_rx, primary, analytical))
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.core.state.subscribe()
    }

    /// Current configuration, including runtime updates.
    #[must_use]
    pub fn config(&self) -> SyncConfig {
        self.core.config()
    }
}

#[cfg(feature = "duckdb")]
fn open_analytical(config: &SyncConfig) -> Result<Arc<dyn RecordStore>, SyncError> {
    let store = crate::storage::duckdb::DuckDbStore::open(config.analytical_path.as_deref())?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "duckdb"))]
fn open_analytical(config: &SyncConfig) -> Result<Arc<dyn RecordStore>, SyncError> {
    if let Some(path) = &config.analytical_path {
        warn!(path = %path, "Built without the duckdb feature - analytical store is in memory");
    }
    Ok(Arc::new(InMemoryStore::new()))
}
