pub mod hybrid_batcher;

pub use hybrid_batcher::{BatchConfig, FlushBatch, FlushReason, HybridBatcher};
