// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hybrid batching for the near-real-time lane.
//!
//! The [`HybridBatcher`] collects operations and releases them when either
//! the item count reaches `flush_count` or `flush_interval` has passed since
//! the previous flush, whichever comes first.
//!
//! # Example
//!
//! ```
//! use dual_sync::batching::{BatchConfig, FlushReason, HybridBatcher};
//! use std::time::Duration;
//!
//! let config = BatchConfig {
//!     flush_interval: Duration::from_secs(300),
//!     flush_count: 2,
//! };
//!
//! let mut batcher: HybridBatcher<&str> = HybridBatcher::new(config);
//! assert_eq!(batcher.push("a"), None);
//! assert_eq!(batcher.push("b"), Some(FlushReason::Count));
//!
//! let batch = batcher.take_if_ready().unwrap();
//! assert_eq!(batch.items, vec!["a", "b"]);
//! assert!(batcher.is_empty());
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Flush interval elapsed since the last flush
    Time,
    /// Item count threshold reached
    Count,
    /// Manual flush requested
    Manual,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Configuration for hybrid batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush once this long has passed since the last flush
    pub flush_interval: Duration,
    /// Flush after this many items
    pub flush_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(300),
            flush_count: 100,
        }
    }
}

/// A batch of items ready for processing
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub reason: FlushReason,
}

pub struct HybridBatcher<T> {
    config: BatchConfig,
    items: Vec<T>,
    last_flush: Instant,
}

impl<T> HybridBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Replace thresholds; pending items and the flush clock are kept.
    pub fn reconfigure(&mut self, config: BatchConfig) {
        self.config = config;
    }

    /// Add an item, returns flush reason if the count threshold is hit
    pub fn push(&mut self, item: T) -> Option<FlushReason> {
        self.items.push(item);
        (self.items.len() >= self.config.flush_count.max(1)).then_some(FlushReason::Count)
    }

    #[must_use]
    pub fn should_flush_time(&self) -> bool {
        !self.items.is_empty() && self.last_flush.elapsed() >= self.config.flush_interval
    }

    /// How long a caller may wait for more items before the time threshold is due.
    #[must_use]
    pub fn time_until_flush(&self) -> Duration {
        self.config.flush_interval.saturating_sub(self.last_flush.elapsed())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Take the batch if any threshold is ready
    pub fn take_if_ready(&mut self) -> Option<FlushBatch<T>> {
        let reason = if self.items.len() >= self.config.flush_count.max(1) {
            FlushReason::Count
        } else if self.should_flush_time() {
            FlushReason::Time
        } else {
            return None;
        };
        Some(self.take(reason))
    }

    /// Force flush regardless of thresholds (for manual flush or shutdown)
    pub fn force_flush_with_reason(&mut self, reason: FlushReason) -> Option<FlushBatch<T>> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.take(reason))
    }

    fn take(&mut self, reason: FlushReason) -> FlushBatch<T> {
        self.last_flush = Instant::now();
        let items = std::mem::take(&mut self.items);
        debug!(count = items.len(), reason = reason.as_str(), "Batch taken for flush");
        FlushBatch { items, reason }
    }
}
