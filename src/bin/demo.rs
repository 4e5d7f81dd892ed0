//! Forge Engines walkthrough demo.
//!
//! Exercises each engine end to end against real (in-process) state
//! rather than printing pseudo-code: a job is dispatched by a running
//! worker pool, a cache value is read through a loader, a rate limiter
//! gate trips, and a metric/span pair is recorded and exported.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge_engines::cache::{CacheStore, InMemoryStore, InMemoryStoreConfig, MultiTierCache, TierConfig};
use forge_engines::jobs::{Job, JobEngine, JobEngineConfig, JobHandler, JobOptions, JobState};
use forge_engines::observability::{AlwaysSampler, MetricRegistry, SpanStatus, Tracer, TracerConfig};
use forge_engines::ratelimit::RateLimiterStore;

struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({ "echoed": job.data }))
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("forge-engines demo starting ({})", forge_engines::VERSION);

    run_job_engine_demo().await;
    run_cache_demo().await;
    run_rate_limiter_demo();
    run_observability_demo();

    log::info!("demo complete");
}

async fn run_job_engine_demo() {
    let engine = Arc::new(JobEngine::new(JobEngineConfig::default()).unwrap());
    engine.register("echo", Arc::new(EchoHandler));

    let job_id = engine.add(
        "echo",
        serde_json::json!({ "message": "hello" }),
        JobOptions::default(),
    );
    log::info!("enqueued job {job_id}");

    engine.run();
    for _ in 0..20 {
        if let Some(job) = engine.get(&job_id) {
            if matches!(job.state, JobState::Completed | JobState::Failed) {
                log::info!("job {job_id} finished as {:?}", job.state);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.shutdown().await;
}

async fn run_cache_demo() {
    let store: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
    let tier = MultiTierCache::new(vec![store], TierConfig::default()).unwrap();

    let value = tier
        .wrap("expensive:1", None, vec![], false, || async {
            log::debug!("computing expensive:1");
            Ok(serde_json::json!({ "computed": true }))
        })
        .await
        .unwrap();
    log::info!("cache produced {value}");
}

fn run_rate_limiter_demo() {
    let limiter = RateLimiterStore::new();
    for attempt in 0..3 {
        match limiter.check("demo-client", 1_000, 2) {
            Ok(count) => log::info!("attempt {attempt}: allowed, count={count}"),
            Err(e) => log::warn!("attempt {attempt}: {e}"),
        }
    }
}

fn run_observability_demo() {
    let metrics = MetricRegistry::new();
    let mut labels = BTreeMap::new();
    labels.insert("route".to_string(), "/demo".to_string());
    metrics.increment("http_requests_total", 1.0, labels.clone()).unwrap();
    metrics.observe("http_request_duration_seconds", 0.042, labels).unwrap();
    log::info!("metrics export:\n{}", metrics.prometheus_export());

    let tracer = Tracer::new(TracerConfig::default(), Arc::new(AlwaysSampler)).unwrap();
    let span_id = tracer.start_root("demo-span");
    log::info!("trace started: span {span_id}");
    std::thread::sleep(Duration::from_millis(5));
    tracer.end(span_id, SpanStatus::Ok, None).unwrap();
}
