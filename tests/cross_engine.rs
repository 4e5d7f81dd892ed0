//! Scenarios spanning more than one engine, per the project's convention
//! of keeping single-engine tests inside their owning module and
//! reserving `tests/` for combinations (job engine + rate limiter,
//! query orchestrator + optimizer, gateway + metrics).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge_engines::db::{DbPool, EagerLoadSpec, OptimizerConfig, PoolConfig, PostgresDialect, QueryOptimizer, QueryOrchestrator, RelationKind};
use forge_engines::jobs::{Job, JobEngine, JobEngineConfig, JobHandler, JobOptions, RateLimitGate};
use forge_engines::observability::MetricRegistry;
use forge_engines::ws::{Gateway, GatewayEvent, NoopHandlers};
use serde_json::json;
use tokio::sync::mpsc;

struct AlwaysOk;
#[async_trait]
impl JobHandler for AlwaysOk {
    async fn handle(&self, _job: &Job) -> Result<serde_json::Value, String> {
        Ok(json!({"ok": true}))
    }
}

/// A rate-limit gate on the job engine bounds how many jobs a worker pool
/// dispatches per window, even when far more are eligible and workers are
/// otherwise idle.
#[tokio::test]
async fn job_engine_rate_limit_gate_bounds_dispatch_throughput() {
    let engine = Arc::new(
        JobEngine::new(JobEngineConfig {
            concurrency: 2,
            poll_interval_ms: 10,
            rate_limit: Some(RateLimitGate {
                max_per_window: 2,
                window_ms: 60_000,
            }),
            ..JobEngineConfig::default()
        })
        .unwrap(),
    );
    engine.register("ok", Arc::new(AlwaysOk));

    let ids = engine.add_bulk(
        (0..5)
            .map(|_| ("ok".to_string(), json!({}), JobOptions::default()))
            .collect(),
    );

    engine.run();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.shutdown().await;

    let completed = ids
        .iter()
        .filter(|id| {
            engine
                .get(id)
                .map(|j| matches!(j.state, forge_engines::jobs::JobState::Completed))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(completed, 2, "the rate limit gate should admit exactly 2 dispatches in the window");
}

/// Eager-loading a relation issues exactly one additional query no matter
/// how many base rows share the key, and that execution is fed into the
/// same optimizer instance the base select feeds.
#[tokio::test]
async fn eager_load_issues_one_query_regardless_of_base_row_count() {
    let pool = Arc::new(DbPool::new(PoolConfig::default(), 0, Arc::new(PostgresDialect)).unwrap());
    let optimizer = Arc::new(QueryOptimizer::new(OptimizerConfig::default()));
    let orchestrator = QueryOrchestrator::new(pool, optimizer.clone());

    orchestrator.select("posts", &["id"]).await.unwrap();

    let base_rows: Vec<serde_json::Value> = (0..50)
        .map(|i| json!({ "id": i, "post_id": i % 5 }))
        .collect();
    let spec = EagerLoadSpec {
        name: "comments".to_string(),
        kind: RelationKind::HasMany,
        related_table: "comments".to_string(),
        foreign_key: "post_id".to_string(),
        local_key: "post_id".to_string(),
        through: None,
    };

    orchestrator.eager_load(&base_rows, &spec).await.unwrap();

    // One fingerprint for the base select, one for the batched IN query,
    // regardless of the 50 base rows collapsing to 5 distinct keys.
    assert_eq!(optimizer.all_stats().len(), 2);
}

/// Gateway lifecycle events are independent of any one route's hooks, so
/// a metrics registry can subscribe and count connection activity
/// without the route itself knowing metrics exist.
#[tokio::test]
async fn gateway_events_feed_a_metric_counter() {
    let gateway = Arc::new(Gateway::new());
    gateway.register("/chat", Arc::new(NoopHandlers));

    let metrics = Arc::new(MetricRegistry::new());
    let mut events = gateway.subscribe();
    let closed_count = Arc::new(AtomicUsize::new(0));

    let metrics_task = {
        let metrics = metrics.clone();
        let closed_count = closed_count.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let mut labels = BTreeMap::new();
                match event {
                    GatewayEvent::Message { route, .. } => {
                        labels.insert("route".to_string(), route);
                        metrics.increment("ws_messages_total", 1.0, labels).unwrap();
                    }
                    GatewayEvent::Closed { route, .. } => {
                        labels.insert("route".to_string(), route);
                        metrics.increment("ws_closed_total", 1.0, labels).unwrap();
                        closed_count.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    GatewayEvent::Error { .. } => {}
                }
            }
        })
    };

    let (tx, _rx) = mpsc::unbounded_channel();
    gateway
        .upgrade("/chat", HashMap::new(), HashMap::new(), tx, "c1")
        .await
        .unwrap();
    gateway.handle_text_message("c1", "hello").await.unwrap();
    gateway.close("c1").await.unwrap();

    metrics_task.await.unwrap();
    assert_eq!(closed_count.load(Ordering::SeqCst), 1);

    let export = metrics.prometheus_export();
    assert!(export.contains("ws_messages_total"));
    assert!(export.contains("ws_closed_total"));
}

