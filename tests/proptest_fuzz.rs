//! Property-based tests (fuzzing) for the sync service's building blocks.
//!
//! Uses proptest to generate random/malformed inputs and verify the core
//! never panics, only returns clean errors, and keeps its invariants.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use dual_sync::batching::{BatchConfig, FlushReason, HybridBatcher};
use dual_sync::canonical::record_hash;
use dual_sync::{
    CircuitBreaker, CircuitConfig, CircuitState, ConsistencyLevel, OperationStatus,
    OperationType, Payload, Record, RetryConfig, SyncOperation, SyncStrategy,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including odd structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Field/value pairs with unique field names
fn fields_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map("[a-z_]{1,12}", arbitrary_json_strategy(), 0..12)
        .prop_map(|m| m.into_iter().collect())
}

fn status_strategy() -> impl Strategy<Value = OperationStatus> {
    prop_oneof![
        Just(OperationStatus::Pending),
        Just(OperationStatus::InProgress),
        Just(OperationStatus::Completed),
        Just(OperationStatus::Failed),
        Just(OperationStatus::Retrying),
        Just(OperationStatus::Compensated),
    ]
}

fn record_from(pairs: impl IntoIterator<Item = (String, Value)>) -> Record {
    let mut record = Record::new();
    for (field, value) in pairs {
        record.insert(field, value);
    }
    record
}

// =============================================================================
// Canonical hashing
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Field insertion order never changes the hash
    #[test]
    fn hash_ignores_field_order(pairs in fields_strategy()) {
        let forward = record_from(pairs.clone());
        let reversed = record_from(pairs.into_iter().rev());
        prop_assert_eq!(record_hash(&forward), record_hash(&reversed));
    }

    /// Changing any single value changes the hash
    #[test]
    fn hash_detects_changed_value(pairs in fields_strategy(), extra in "[a-z]{1,8}") {
        let original = record_from(pairs);
        let mut changed = original.clone();
        changed.insert("Extra".into(), json!(extra));
        prop_assert_ne!(record_hash(&original), record_hash(&changed));
    }

    /// Hash is always lowercase hex SHA-256
    #[test]
    fn hash_is_hex_digest(pairs in fields_strategy()) {
        let hash = record_hash(&record_from(pairs));
        prop_assert_eq!(hash.len(), 64);
        prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

// =============================================================================
// Operation decoding
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Arbitrary bytes never panic the decoder
    #[test]
    fn decode_random_bytes_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = SyncOperation::from_json_bytes(&bytes);
    }

    /// Arbitrary JSON never panics the decoder
    #[test]
    fn decode_random_json_never_panics(value in arbitrary_json_strategy()) {
        let bytes = serde_json::to_vec(&value).unwrap();
        let _ = SyncOperation::from_json_bytes(&bytes);
    }

    /// An encoded operation with a random row decodes to the same operation
    #[test]
    fn encoded_operation_decodes(pairs in fields_strategy(), retries in 0u32..10) {
        let op = SyncOperation::new(
            OperationType::Update,
            "pages",
            Some("k".into()),
            Payload::row(record_from(pairs)),
            ConsistencyLevel::Eventual,
            SyncStrategy::Batch,
            retries,
        );
        let bytes = serde_json::to_vec(&op).unwrap();
        let decoded = SyncOperation::from_json_bytes(&bytes).unwrap();
        prop_assert_eq!(decoded, op);
    }
}

// =============================================================================
// Status machine
// =============================================================================

proptest! {
    /// Completed and Compensated never change again
    #[test]
    fn final_statuses_are_terminal(next in status_strategy()) {
        prop_assert!(!OperationStatus::Completed.can_transition_to(next));
        prop_assert!(!OperationStatus::Compensated.can_transition_to(next));
    }

    /// No status loops back to itself or to Pending
    #[test]
    fn no_self_or_pending_transitions(from in status_strategy()) {
        prop_assert!(!from.can_transition_to(from));
        prop_assert!(!from.can_transition_to(OperationStatus::Pending));
    }
}

// =============================================================================
// Backoff
// =============================================================================

proptest! {
    /// Delay never decreases with the attempt number and never exceeds the cap
    #[test]
    fn backoff_monotone_and_capped(
        base_ms in 1u64..10_000,
        max_ms in 1u64..600_000,
        attempt in 0u32..200,
    ) {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            factor: 2.0,
            max_retries: Some(3),
        };
        let this = config.delay_for_attempt(attempt);
        let next = config.delay_for_attempt(attempt + 1);
        prop_assert!(this <= next);
        prop_assert!(next <= config.max_delay);
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

proptest! {
    /// The breaker opens on exactly the threshold-th consecutive failure
    #[test]
    fn breaker_opens_at_threshold(threshold in 1u32..20) {
        let breaker = CircuitBreaker::new(
            "prop",
            CircuitConfig { failure_threshold: threshold, recovery_timeout: Duration::from_secs(60) },
        );
        for _ in 1..threshold {
            breaker.record_failure();
            prop_assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        prop_assert_eq!(breaker.state(), CircuitState::Open);
        prop_assert!(!breaker.should_allow_request());
    }

    /// A success between failures resets the count
    #[test]
    fn breaker_success_resets_count(threshold in 2u32..20) {
        let breaker = CircuitBreaker::new(
            "prop",
            CircuitConfig { failure_threshold: threshold, recovery_timeout: Duration::from_secs(60) },
        );
        for _ in 1..threshold {
            breaker.record_failure();
        }
        breaker.record_success();
        prop_assert_eq!(breaker.failure_count(), 0);
        for _ in 1..threshold {
            breaker.record_failure();
        }
        prop_assert_eq!(breaker.state(), CircuitState::Closed);
    }
}

// =============================================================================
// Batcher
// =============================================================================

proptest! {
    /// Count trigger fires on exactly the threshold-th push
    #[test]
    fn batcher_count_trigger(threshold in 1usize..50, pushes in 1usize..100) {
        let mut batcher = HybridBatcher::new(BatchConfig {
            flush_interval: Duration::from_secs(3600),
            flush_count: threshold,
        });
        for i in 1..=pushes.min(threshold) {
            let reason = batcher.push(i);
            if i == threshold {
                prop_assert_eq!(reason, Some(FlushReason::Count));
            } else {
                prop_assert_eq!(reason, None);
            }
        }
        let batch = batcher.take_if_ready();
        prop_assert_eq!(batch.is_some(), pushes >= threshold);
        if let Some(batch) = batch {
            prop_assert_eq!(batch.items.len(), threshold);
            prop_assert!(batcher.is_empty());
        }
    }
}
