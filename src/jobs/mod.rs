//! # Job Engine
//!
//! A durable work queue (C6) dispatched by a bounded-concurrency worker
//! pool with retries, a rate-limiter gate, and cron/interval scheduling
//! (C7).

pub mod cron;
pub mod engine;
pub mod model;
pub mod store;

pub use cron::{CronError, CronResult, CronSchedule};
pub use engine::{
    BackoffKind, JobEngine, JobEngineConfig, JobEngineError, JobEngineResult, JobHandler,
    JobOptions, RateLimitGate, RetryPolicy,
};
pub use model::{DataSource, Job, JobEvent, JobState, ScheduleKind, ScheduledRegistration};
pub use store::{JobStats, JobStore, JobStoreError, JobStoreResult};
