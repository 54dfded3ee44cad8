//! Lane workers and the metrics loop.
//!
//! Each lane has exactly one consumer task. Workers never share mutable
//! state except through the lanes, the history index and the dead-letter
//! store held by [`SyncCore`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::batching::{BatchConfig, FlushReason, HybridBatcher};
use crate::config::SyncConfig;
use crate::operation::{OperationStatus, SyncOperation, SyncStrategy};

use super::failure::Settled;
use super::SyncCore;

/// Resolves once the stop flag is set (or its sender is gone).
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn is_stopping(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

fn drain_now(rx: &mut mpsc::Receiver<SyncOperation>, limit: usize) -> Vec<SyncOperation> {
    let mut ops = Vec::new();
    while ops.len() < limit {
        match rx.try_recv() {
            Ok(op) => ops.push(op),
            Err(_) => break,
        }
    }
    ops
}

fn near_real_time_batching(config: &SyncConfig) -> BatchConfig {
    BatchConfig {
        flush_interval: Duration::from_millis(config.near_real_time_flush_ms),
        flush_count: config.near_real_time_flush_threshold(),
    }
}

impl SyncCore {
    /// Attempt one operation and hand a retry to the recovery lane.
    async fn process_one(&self, op: SyncOperation, lane: SyncStrategy) {
        if let Settled::Retry(op) = self.attempt(op, lane).await {
            self.hand_to_recovery(op).await;
        }
    }

    /// Attempt a batch concurrently, at most `batch_concurrency` in flight.
    pub(super) async fn process_batch(&self, ops: Vec<SyncOperation>, lane: SyncStrategy) {
        if ops.is_empty() {
            return;
        }
        crate::metrics::record_batch_size(lane.as_str(), ops.len());
        debug!(lane = lane.as_str(), count = ops.len(), "Processing batch");

        let settled = join_all(ops.into_iter().map(|op| async move {
            let _permit = self.batch_limiter.acquire().await.ok();
            self.attempt(op, lane).await
        }))
        .await;

        for outcome in settled {
            if let Settled::Retry(op) = outcome {
                self.hand_to_recovery(op).await;
            }
        }
    }

    pub(super) async fn run_real_time(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SyncOperation>,
        stop: watch::Receiver<bool>,
    ) {
        info!(lane = "real_time", "Lane worker started");
        while !is_stopping(&stop) {
            let poll = self.config.read().poll_interval();
            match timeout(poll, rx.recv()).await {
                Ok(Some(op)) => self.process_one(op, SyncStrategy::RealTime).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        // Accepted operations still get their attempt
        let remaining = drain_now(&mut rx, usize::MAX);
        for op in remaining {
            self.process_one(op, SyncStrategy::RealTime).await;
        }
        info!(lane = "real_time", "Lane worker stopped");
    }

    pub(super) async fn run_near_real_time(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SyncOperation>,
        stop: watch::Receiver<bool>,
    ) {
        info!(lane = "near_real_time", "Lane worker started");
        let mut batcher = HybridBatcher::new(near_real_time_batching(&self.config.read()));

        while !is_stopping(&stop) {
            let (poll, batching) = {
                let config = self.config.read();
                (config.poll_interval(), near_real_time_batching(&config))
            };
            batcher.reconfigure(batching);

            let wait = if batcher.is_empty() {
                poll
            } else {
                poll.min(batcher.time_until_flush())
            };
            match timeout(wait, rx.recv()).await {
                Ok(Some(op)) => {
                    batcher.push(op);
                }
                Ok(None) => break,
                Err(_) => {}
            }

            if let Some(batch) = batcher.take_if_ready() {
                debug!(reason = batch.reason.as_str(), count = batch.items.len(), "Near-real-time flush");
                self.process_batch(batch.items, SyncStrategy::NearRealTime).await;
            }
        }

        for op in drain_now(&mut rx, usize::MAX) {
            batcher.push(op);
        }
        if let Some(batch) = batcher.force_flush_with_reason(FlushReason::Shutdown) {
            info!(count = batch.items.len(), "Flushing near-real-time batch on shutdown");
            self.process_batch(batch.items, SyncStrategy::NearRealTime).await;
        }
        info!(lane = "near_real_time", "Lane worker stopped");
    }

    pub(super) async fn run_batch(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SyncOperation>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!(lane = "batch", "Lane worker started");
        loop {
            let (interval, batch_size) = {
                let config = self.config.read();
                (config.batch_interval(), config.batch_size.max(1))
            };

            let stopping = tokio::select! {
                _ = sleep(interval) => false,
                _ = stopped(&mut stop) => true,
            };

            let ops = drain_now(&mut rx, batch_size);
            self.process_batch(ops, SyncStrategy::Batch).await;

            if stopping {
                loop {
                    let ops = drain_now(&mut rx, batch_size);
                    if ops.is_empty() {
                        break;
                    }
                    self.process_batch(ops, SyncStrategy::Batch).await;
                }
                break;
            }
        }
        info!(lane = "batch", "Lane worker stopped");
    }

    /// Drive one operation through recovery attempts until it settles.
    ///
    /// Waits `delay_for_attempt(retry_count)` before every attempt after the
    /// first failure. A stop during the wait abandons the operation in
    /// RETRYING state.
    async fn recover(self: Arc<Self>, mut op: SyncOperation, mut stop: watch::Receiver<bool>) {
        loop {
            if op.status != OperationStatus::Retrying {
                match self.as_retrying(&op) {
                    Some(retrying) => op = retrying,
                    None => {
                        warn!(operation_id = %op.operation_id, "Recovery skipped");
                        return;
                    }
                }
            }

            if op.retry_count > 0 {
                let delay = self.config.read().recovery_retry().delay_for_attempt(op.retry_count);
                debug!(operation_id = %op.operation_id, delay_ms = delay.as_millis() as u64, "Backing off");
                let interrupted = tokio::select! {
                    _ = sleep(delay) => false,
                    _ = stopped(&mut stop) => true,
                };
                if interrupted {
                    debug!(operation_id = %op.operation_id, "Recovery abandoned at shutdown");
                    return;
                }
            }

            let settled = {
                let _permit = self.batch_limiter.acquire().await.ok();
                self.attempt(op, SyncStrategy::Recovery).await
            };
            match settled {
                Settled::Done => return,
                Settled::Retry(next) => op = next,
            }
        }
    }

    /// Run recovery attempts, at most `queue_capacity` at a time.
    ///
    /// Operations past that limit wait in the bounded lane, so a sustained
    /// outage pushes back on the lanes feeding it.
    pub(super) async fn run_recovery(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SyncOperation>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!(lane = "recovery", "Lane worker started");
        let mut in_flight = JoinSet::new();

        loop {
            let limit = self.config.read().queue_capacity.max(1);
            tokio::select! {
                received = rx.recv(), if in_flight.len() < limit => match received {
                    Some(op) => {
                        in_flight.spawn(self.clone().recover(op, stop.clone()));
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Recovery task ended abnormally");
                    }
                }
                _ = stopped(&mut stop) => break,
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Recovery task ended abnormally");
            }
        }

        let abandoned = drain_now(&mut rx, usize::MAX).len();
        if abandoned > 0 {
            warn!(abandoned, "Recovery lane stopped with queued operations left RETRYING");
        }
        info!(lane = "recovery", "Lane worker stopped");
    }

    /// Sample queue depths into metrics and apply config updates.
    pub(super) async fn run_metrics(
        self: Arc<Self>,
        mut config_rx: watch::Receiver<SyncConfig>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut period = self.config.read().metrics_interval();
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample_metrics(),

                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    info!(
                        batch_size = new_config.batch_size,
                        batch_interval_ms = new_config.batch_interval_ms,
                        max_retries = new_config.max_retries,
                        "Config updated"
                    );
                    if new_config.metrics_interval() != period {
                        period = new_config.metrics_interval();
                        ticker = tokio::time::interval(period);
                    }
                    *self.config.write() = new_config;
                }

                _ = stopped(&mut stop) => break,
            }
        }
        self.sample_metrics();
    }

    pub(super) fn sample_metrics(&self) {
        let depths = self.lanes.depths();
        for lane in SyncStrategy::ALL {
            crate::metrics::set_queue_depth(lane.as_str(), self.lanes.depth(lane));
        }
        crate::metrics::set_dead_letter_depth(self.dead_letters.len());
        self.metrics.lock().queue_depth = depths.total();
    }
}
