// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic query-cache usage example.
//!
//! Demonstrates:
//! 1. Connecting to SQL (source of truth) and, optionally, Redis
//! 2. Reading rows by primary key through the tiers
//! 3. A query-backed key with filter parameters and a limit
//! 4. Writing with a generated id and reading the backfilled key
//! 5. Expire overrides and TTL-proxy eviction
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! # SQLite only, remote tier in-process
//! cargo run --example basic_usage
//!
//! # With Redis
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::time::{Duration, Instant};

use kv_query_cache::{EngineConfig, KeyRequest, QueryCacheEngine, SqlStore};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kv_query_cache=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           kv-query-cache: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Seed a SQLite database and connect the engine
    // ─────────────────────────────────────────────────────────────────────────
    let db_path = std::env::temp_dir().join("kv_query_cache_demo.db");
    let sql_url = format!("sqlite://{}?mode=rwc", db_path.display());

    println!("🗄️  Seeding {}...", db_path.display());
    let seed = SqlStore::new(&sql_url, 1).await?;
    seed.execute("DROP TABLE IF EXISTS user_table").await?;
    seed.execute(
        "CREATE TABLE user_table (id INTEGER PRIMARY KEY AUTOINCREMENT, email TEXT, name TEXT, age INTEGER)",
    )
    .await?;
    seed.execute(
        "INSERT INTO user_table (email, name, age) VALUES \
         ('ada@example.com', 'Ada', 36), \
         ('alan@example.com', 'Alan', 41), \
         ('grace@example.com', 'Grace', 85)",
    )
    .await?;

    let config = EngineConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        redis_prefix: Some("demo:".into()),
        sql_url: Some(sql_url),
        default_table: Some("user_table".into()),
        default_expire: "30".into(),
        ..Default::default()
    };

    println!("\n🚀 Connecting...");
    let engine = QueryCacheEngine::connect(config).await?;
    engine.start();
    println!("   ✅ Engine running! State: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Primary-key reads: first from SQL, then from the local cache
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading user 1 twice...");
    for attempt in ["cold", "warm"] {
        let start = Instant::now();
        let user = engine.get(&KeyRequest::new("1")).await?;
        println!("   └─ {} read → {} ({:?})", attempt, user, start.elapsed());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Query-backed key: rows matching the filter, cached under one id
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔎 Query-backed key 'veterans' (age >= 40, at most 5 rows)...");
    let veterans = KeyRequest::new("veterans")
        .with_param("age>", ["40"])
        .with_param("limit", ["5"]);
    let rows = engine.get(&veterans).await?;
    println!("   └─ {}", rows);

    let rejected = engine.put(&veterans, json!({"name": "nobody"})).await;
    println!("   └─ write to a query-backed key: {:?}", rejected.err().map(|e| e.status_code()));

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Write with a generated id
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing a new user with a generated id...");
    let id = engine
        .put(
            &KeyRequest::generated(),
            json!({"email": "edsger@example.com", "name": "Edsger", "age": 72}),
        )
        .await?;
    engine.drain().await;
    let stored = engine.get(&KeyRequest::new(&id)).await?;
    println!("   └─ {} → {}", id, stored);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Expire override: a short forced TTL evicts the cached copy
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏳ Forcing a 500ms TTL on user 2...");
    engine.get(&KeyRequest::new("2")).await?;
    engine.drain().await;
    engine.get(&KeyRequest::new("2").with_expire("-500ms")).await?;
    engine.drain().await;
    println!("   └─ local entries before expiry: {}", engine.local_len());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    println!("   └─ local entries after expiry:  {}", engine.local_len());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(format!("{}-wal", db_path.display()));
    let _ = std::fs::remove_file(format!("{}-shm", db_path.display()));

    Ok(())
}

/// Print every captured metric, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={:.4}", samples.len(), sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
