//! Service lifecycle: initialize and shutdown.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SyncError;

use super::{EngineState, SyncService};

async fn join_worker(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(error = %e, "Worker task ended abnormally");
    }
}

impl SyncService {
    /// Spawn one worker per lane plus the metrics loop and start accepting work.
    ///
    /// Operations queued while the service was `Created` are processed once
    /// their lane worker starts. Calling this twice is an error.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), SyncError> {
        if !matches!(self.state(), EngineState::Created) {
            return Err(SyncError::AlreadyInitialized);
        }
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or(SyncError::AlreadyInitialized)?;
        let config_rx = self.config_rx.lock().take();

        let core = &self.core;
        let mut lane_workers = vec![
            tokio::spawn(core.clone().run_real_time(receivers.real_time, self.lane_stop.subscribe())),
            tokio::spawn(core.clone().run_near_real_time(receivers.near_real_time, self.lane_stop.subscribe())),
            tokio::spawn(core.clone().run_batch(receivers.batch, self.lane_stop.subscribe())),
        ];
        if let Some(config_rx) = config_rx {
            lane_workers.push(tokio::spawn(core.clone().run_metrics(config_rx, self.lane_stop.subscribe())));
        }
        let recovery = tokio::spawn(core.clone().run_recovery(receivers.recovery, self.recovery_stop.subscribe()));

        *self.lane_workers.lock() = lane_workers;
        *self.recovery_worker.lock() = Some(recovery);

        self.core.set_state(EngineState::Running);
        info!("Sync service running");
        Ok(())
    }

    /// Stop accepting work, flush the lanes, and wait for every worker to exit.
    ///
    /// Lane workers stop first so their retries can still reach the recovery
    /// lane; the recovery worker stops last. Operations waiting out a backoff
    /// at that point stay RETRYING. Ends in `Stopped`; calling it again is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        match self.state() {
            EngineState::ShuttingDown | EngineState::Stopped => return,
            EngineState::Created => {
                self.core.set_state(EngineState::Stopped);
                info!("Sync service stopped before initialize");
                return;
            }
            EngineState::Running => {}
        }

        info!("Sync service shutting down...");
        self.core.set_state(EngineState::ShuttingDown);

        self.lane_stop.send_replace(true);
        let lane_workers = std::mem::take(&mut *self.lane_workers.lock());
        for handle in lane_workers {
            join_worker(handle).await;
        }

        self.recovery_stop.send_replace(true);
        let recovery = self.recovery_worker.lock().take();
        if let Some(handle) = recovery {
            join_worker(handle).await;
        }

        self.core.sample_metrics();
        self.core.set_state(EngineState::Stopped);
        info!(
            dead_letters = self.core.dead_letters.len(),
            "Sync service stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::storage::memory::InMemoryStore;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn service() -> SyncService {
        let config = SyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        SyncService::with_stores(
            config,
            rx,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let service = service();
        service.initialize().await.unwrap();
        assert!(matches!(service.initialize().await, Err(SyncError::AlreadyInitialized)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let service = service();
        service.initialize().await.unwrap();
        service.shutdown().await;
        service.shutdown().await;
        assert_eq!(service.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize() {
        let service = service();
        service.shutdown().await;
        assert_eq!(service.state(), EngineState::Stopped);
        assert!(matches!(service.initialize().await, Err(SyncError::AlreadyInitialized)));
    }
}
