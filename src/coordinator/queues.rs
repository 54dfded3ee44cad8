//! Lane channels, the operation history index and the dead-letter store.
//!
//! Both the history and the dead-letter store are capacity-bounded. The
//! dead-letter store drops its oldest entry when full; the history drops its
//! oldest settled entries (completed, compensated or failed) first and only
//! falls back to snapshots of operations still moving when that is not enough.

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::operation::{now_millis, OperationStatus, SyncOperation, SyncStrategy};

use super::types::{DeadLetterSummary, LaneDepths};

/// Sending halves of the four lanes.
pub(super) struct Lanes {
    real_time: mpsc::Sender<SyncOperation>,
    near_real_time: mpsc::Sender<SyncOperation>,
    batch: mpsc::Sender<SyncOperation>,
    recovery: mpsc::Sender<SyncOperation>,
}

/// Receiving halves, handed to the workers at initialize.
pub(super) struct LaneReceivers {
    pub real_time: mpsc::Receiver<SyncOperation>,
    pub near_real_time: mpsc::Receiver<SyncOperation>,
    pub batch: mpsc::Receiver<SyncOperation>,
    pub recovery: mpsc::Receiver<SyncOperation>,
}

impl Lanes {
    pub(super) fn bounded(capacity: usize) -> (Self, LaneReceivers) {
        let capacity = capacity.max(1);
        let (rt_tx, rt_rx) = mpsc::channel(capacity);
        let (nrt_tx, nrt_rx) = mpsc::channel(capacity);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let (rec_tx, rec_rx) = mpsc::channel(capacity);
        (
            Self {
                real_time: rt_tx,
                near_real_time: nrt_tx,
                batch: batch_tx,
                recovery: rec_tx,
            },
            LaneReceivers {
                real_time: rt_rx,
                near_real_time: nrt_rx,
                batch: batch_rx,
                recovery: rec_rx,
            },
        )
    }

    fn sender(&self, lane: SyncStrategy) -> &mpsc::Sender<SyncOperation> {
        match lane {
            SyncStrategy::RealTime => &self.real_time,
            SyncStrategy::NearRealTime => &self.near_real_time,
            SyncStrategy::Batch => &self.batch,
            SyncStrategy::Recovery => &self.recovery,
        }
    }

    /// Enqueue without waiting. Hands the operation back when the lane is full or closed.
    pub(super) fn try_send(&self, lane: SyncStrategy, op: SyncOperation) -> Result<(), SyncOperation> {
        self.sender(lane).try_send(op).map_err(|e| match e {
            TrySendError::Full(op) | TrySendError::Closed(op) => op,
        })
    }

    /// Enqueue, waiting for room. Hands the operation back when the lane is closed.
    pub(super) async fn send(&self, lane: SyncStrategy, op: SyncOperation) -> Result<(), SyncOperation> {
        self.sender(lane).send(op).await.map_err(|e| e.0)
    }

    /// Wait for room on a lane. `None` when the lane is closed.
    pub(super) async fn reserve(&self, lane: SyncStrategy) -> Option<mpsc::Permit<'_, SyncOperation>> {
        self.sender(lane).reserve().await.ok()
    }

    pub(super) fn depth(&self, lane: SyncStrategy) -> usize {
        let sender = self.sender(lane);
        sender.max_capacity() - sender.capacity()
    }

    pub(super) fn depths(&self) -> LaneDepths {
        LaneDepths {
            real_time: self.depth(SyncStrategy::RealTime),
            near_real_time: self.depth(SyncStrategy::NearRealTime),
            batch: self.depth(SyncStrategy::Batch),
            recovery: self.depth(SyncStrategy::Recovery),
        }
    }
}

/// Latest known snapshot of every operation, by id.
pub(super) struct OperationHistory {
    entries: DashMap<String, SyncOperation>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

fn is_settled(status: OperationStatus) -> bool {
    status.is_final() || status == OperationStatus::Failed
}

impl OperationHistory {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub(super) fn record(&self, op: &SyncOperation) {
        let is_new = self
            .entries
            .insert(op.operation_id.clone(), op.clone())
            .is_none();
        if is_new {
            self.order.lock().push_back(op.operation_id.clone());
            self.evict();
        }
    }

    pub(super) fn get(&self, operation_id: &str) -> Option<SyncOperation> {
        self.entries.get(operation_id).map(|entry| entry.value().clone())
    }

    pub(super) fn remove(&self, operation_id: &str) {
        if self.entries.remove(operation_id).is_some() {
            self.order.lock().retain(|id| id != operation_id);
        }
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop entries until the index fits its capacity.
    ///
    /// Oldest settled entries go first, then the oldest RETRYING snapshots,
    /// then whatever is oldest. An operation still moving is recorded again
    /// on its next transition.
    fn evict(&self) {
        if self.entries.len() <= self.capacity {
            return;
        }
        let mut order = self.order.lock();

        let settled = self.evict_matching(&mut order, is_settled);
        if settled > 0 {
            crate::metrics::record_eviction("history", settled);
        }

        let live = self.evict_matching(&mut order, |status| status == OperationStatus::Retrying)
            + self.evict_matching(&mut order, |_| true);
        if live > 0 {
            warn!(evicted = live, capacity = self.capacity, "Operation history full, dropped snapshots of unsettled operations");
            crate::metrics::record_eviction("history_live", live);
        }
    }

    /// Remove the oldest entries whose status matches, until under capacity.
    fn evict_matching(&self, order: &mut VecDeque<String>, matches: impl Fn(OperationStatus) -> bool) -> usize {
        let mut evicted = 0;
        let mut index = 0;
        while self.entries.len() > self.capacity && index < order.len() {
            let status = self.entries.get(&order[index]).map(|entry| entry.status);
            match status {
                Some(status) if matches(status) => {
                    if let Some(id) = order.remove(index) {
                        self.entries.remove(&id);
                        evicted += 1;
                    }
                }
                Some(_) => index += 1,
                None => {
                    order.remove(index);
                }
            }
        }
        evicted
    }
}

#[derive(Debug, Clone)]
struct DeadLetter {
    op: SyncOperation,
    dead_lettered_at: i64,
}

/// Operations that exhausted their retries, oldest first.
pub(super) struct DeadLetterStore {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterStore {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append, evicting the oldest entry when full. Returns the evicted operation.
    pub(super) fn push(&self, op: SyncOperation) -> Option<SyncOperation> {
        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front().map(|dead| dead.op)
        } else {
            None
        };
        entries.push_back(DeadLetter { op, dead_lettered_at: now_millis() });
        crate::metrics::set_dead_letter_depth(entries.len());
        evicted
    }

    /// Remove an entry for retry.
    pub(super) fn take(&self, operation_id: &str) -> Option<SyncOperation> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|dead| dead.op.operation_id == operation_id)?;
        let taken = entries.remove(index).map(|dead| dead.op);
        crate::metrics::set_dead_letter_depth(entries.len());
        taken
    }

    /// Put back an entry whose retry could not be queued.
    pub(super) fn restore(&self, op: SyncOperation) {
        self.push(op);
    }

    pub(super) fn contains(&self, operation_id: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|dead| dead.op.operation_id == operation_id)
    }

    pub(super) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(super) fn summaries(&self) -> Vec<DeadLetterSummary> {
        self.entries
            .lock()
            .iter()
            .map(|dead| DeadLetterSummary::new(&dead.op, dead.dead_lettered_at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ConsistencyLevel, OperationType, Payload};

    fn op(id: &str) -> SyncOperation {
        let mut op = SyncOperation::new(
            OperationType::Delete,
            "pages",
            Some("1".into()),
            Payload::empty(),
            ConsistencyLevel::Eventual,
            SyncStrategy::RealTime,
            3,
        );
        op.operation_id = id.to_string();
        op
    }

    fn settled(id: &str) -> SyncOperation {
        let mut op = op(id);
        op.transition(OperationStatus::InProgress).unwrap();
        op.transition(OperationStatus::Completed).unwrap();
        op
    }

    #[tokio::test]
    async fn test_lane_depth_tracks_queued_items() {
        let (lanes, mut receivers) = Lanes::bounded(2);
        lanes.try_send(SyncStrategy::Batch, op("a")).unwrap();
        lanes.try_send(SyncStrategy::Batch, op("b")).unwrap();

        assert_eq!(lanes.depth(SyncStrategy::Batch), 2);
        assert_eq!(lanes.depths().total(), 2);

        let rejected = lanes.try_send(SyncStrategy::Batch, op("c")).unwrap_err();
        assert_eq!(rejected.operation_id, "c");

        receivers.batch.recv().await.unwrap();
        assert_eq!(lanes.depth(SyncStrategy::Batch), 1);
    }

    #[tokio::test]
    async fn test_send_to_closed_lane_returns_operation() {
        let (lanes, receivers) = Lanes::bounded(4);
        drop(receivers);

        let returned = lanes.send(SyncStrategy::Recovery, op("x")).await.unwrap_err();
        assert_eq!(returned.operation_id, "x");
    }

    #[tokio::test]
    async fn test_reserve_holds_room_until_sent() {
        let (lanes, mut receivers) = Lanes::bounded(1);
        let slot = lanes.reserve(SyncStrategy::Recovery).await.unwrap();
        assert!(lanes.try_send(SyncStrategy::Recovery, op("b")).is_err());

        slot.send(op("a"));
        assert_eq!(receivers.recovery.recv().await.unwrap().operation_id, "a");
    }

    #[test]
    fn test_history_keeps_latest_snapshot() {
        let history = OperationHistory::new(10);
        let mut pending = op("a");
        history.record(&pending);
        pending.transition(OperationStatus::InProgress).unwrap();
        history.record(&pending);

        assert_eq!(history.len(), 1);
        assert_eq!(history.get("a").unwrap().status, OperationStatus::InProgress);
    }

    #[test]
    fn test_history_evicts_oldest_settled_first() {
        let history = OperationHistory::new(2);
        history.record(&op("live"));
        history.record(&settled("done-1"));
        history.record(&settled("done-2"));

        assert_eq!(history.len(), 2);
        assert!(history.get("live").is_some());
        assert!(history.get("done-1").is_none());
        assert!(history.get("done-2").is_some());
    }

    #[test]
    fn test_history_stays_bounded_when_nothing_settled() {
        let history = OperationHistory::new(2);
        let mut retrying = op("retrying");
        retrying.transition(OperationStatus::InProgress).unwrap();
        retrying.transition(OperationStatus::Failed).unwrap();
        retrying.transition(OperationStatus::Retrying).unwrap();
        history.record(&op("pending-1"));
        history.record(&retrying);
        history.record(&op("pending-2"));

        // RETRYING snapshots go before queued ones
        assert_eq!(history.len(), 2);
        assert!(history.get("retrying").is_none());
        assert!(history.get("pending-1").is_some());

        history.record(&op("pending-3"));
        assert_eq!(history.len(), 2);
        assert!(history.get("pending-1").is_none());
        assert!(history.get("pending-3").is_some());
    }

    #[test]
    fn test_dead_letter_evicts_oldest() {
        let store = DeadLetterStore::new(2);
        assert!(store.push(op("a")).is_none());
        assert!(store.push(op("b")).is_none());
        let evicted = store.push(op("c")).unwrap();

        assert_eq!(evicted.operation_id, "a");
        assert_eq!(store.len(), 2);
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_dead_letter_take_and_restore() {
        let store = DeadLetterStore::new(5);
        store.push(op("a"));
        store.push(op("b"));

        let taken = store.take("a").unwrap();
        assert!(store.take("a").is_none());
        assert_eq!(store.len(), 1);

        store.restore(taken);
        let ids: Vec<_> = store.summaries().into_iter().map(|s| s.operation_id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
