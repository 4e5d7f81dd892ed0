//! # Forge Engines
//!
//! Concurrency and resource engines shared across a server-side
//! application framework: a durable job queue, a multi-tier cache, a
//! rate limiter, a relational query orchestrator, a WebSocket gateway,
//! and an observability core (metrics + tracing).
//!
//! ## Modules
//!
//! - `jobs`: priority dispatch, delayed execution, retries with backoff,
//!   cron/interval scheduling, a rolling rate-limit gate on dispatch.
//! - `cache`: read-through/write-through multi-tier cache, tag-based
//!   invalidation, single-flight memoization.
//! - `ratelimit`: fixed-window rate limiting store shared by the job
//!   engine and any HTTP-facing caller.
//! - `db`: dialect-aware SQL composition, pooled connections with
//!   read-replica routing, transactions with savepoints, eager-load
//!   batching, slow-query/N+1 telemetry.
//! - `ws`: connection registry, per-route auth, room fan-out.
//! - `observability`: labeled metric registry with Prometheus
//!   exposition, span tracer with W3C trace-context propagation.
//! - `health`: aggregated health reporting shared by every engine above.

pub mod cache;
pub mod db;
pub mod health;
pub mod jobs;
pub mod observability;
pub mod ratelimit;
pub mod ws;

/// Crate version, as set in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as set in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
