// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic dual-sync usage example.
//!
//! Demonstrates:
//! 1. Opening a transactional store (SQLite file, or `DUAL_SYNC_PRIMARY_URL`)
//!    and an embedded analytical store
//! 2. A STRONG write and a handful of queued writes on different lanes
//! 3. Consistency validation for a row
//! 4. Backfilling the analytical store from the primary
//! 5. Displaying the status document and captured metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! RUST_LOG=dual_sync=debug cargo run --example basic_usage
//! ```

use std::time::Duration;

use dual_sync::{ConsistencyLevel, EngineState, OperationType, Record, SyncConfig, SyncService, SyncStrategy};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn row(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             dual-sync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the service
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let primary_url = std::env::var("DUAL_SYNC_PRIMARY_URL").unwrap_or_else(|_| {
        format!("sqlite://{}?mode=rwc", dir.path().join("primary.db").display())
    });

    let config = SyncConfig {
        primary_url: Some(primary_url),
        analytical_path: Some(dir.path().join("analytics.duckdb").display().to_string()),
        // Turn lanes over quickly for the demo
        batch_interval_ms: 200,
        near_real_time_flush_ms: 500,
        batch_size: 50,
        ..Default::default()
    };

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let service = SyncService::connect(config, config_rx).await?;
    println!("📦 State: {:?}", service.state());

    service.initialize().await?;
    assert_eq!(service.state(), EngineState::Running);
    println!("🚀 Running\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 STRONG create (both stores before returning)...");
    let start = std::time::Instant::now();
    let receipt = service
        .dual_write_create(
            "customers",
            None,
            row(json!({"id": "alice", "name": "Alice", "tier": "gold"})),
            ConsistencyLevel::Strong,
            SyncStrategy::RealTime,
        )
        .await?;
    println!("   └─ accepted={} id={} ({:?})", receipt.accepted, receipt.operation_id, start.elapsed());

    println!("\n📝 Queued writes on each lane...");
    let queued = [
        ("bob", SyncStrategy::RealTime),
        ("carol", SyncStrategy::NearRealTime),
        ("dave", SyncStrategy::Batch),
    ];
    for (name, lane) in queued {
        let receipt = service
            .dual_write_create("customers", None, row(json!({"id": name, "tier": "basic"})), ConsistencyLevel::Eventual, lane)
            .await?;
        println!("   └─ {name} → {lane} (accepted={})", receipt.accepted);
    }

    let orders: Vec<Record> = (1..=5).map(|i| row(json!({"id": format!("o-{i}"), "total": i * 25}))).collect();
    service
        .dual_write_bulk("orders", OperationType::BulkInsert, orders, ConsistencyLevel::Eventual, SyncStrategy::Batch)
        .await?;
    println!("   └─ 5 orders → batch (bulk insert)");

    service
        .dual_write_update("customers", "alice", row(json!({"tier": "platinum"})), ConsistencyLevel::Eventual, SyncStrategy::RealTime)
        .await?;
    println!("   └─ alice tier update → real_time");

    tokio::time::sleep(Duration::from_millis(800)).await;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Consistency
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Validating consistency...");
    for key in ["alice", "bob", "carol", "dave", "nobody"] {
        let report = service.validate_consistency("customers", key).await?;
        println!("   └─ customers/{key}: {:?}", report.status);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Backfill
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Backfilling orders from the primary...");
    let report = service.sync_from_primary("orders", None, Some(2)).await?;
    println!(
        "   └─ {:?}: {} records, {} errors in {:.3}s",
        report.status, report.records_synced, report.errors, report.duration_seconds
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Status and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Status document:");
    let status = service.get_sync_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    println!("\n📈 Captured metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    service.shutdown().await;
    assert_eq!(service.state(), EngineState::Stopped);
    println!("   ✅ Stopped");

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, sorted by name
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg) in &histograms {
            println!("   │  └─ {}{} count={} avg={:.6}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
