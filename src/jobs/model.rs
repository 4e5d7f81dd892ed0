//! Job record and state machine.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Paused,
}

/// A unit of work tracked by the job store, from enqueue through its
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub created_at: u64,
    pub updated_at: u64,
    /// Milliseconds since epoch at which the job becomes eligible for
    /// dispatch.
    pub run_at: u64,
    /// Name of the scheduled registration that produced this job, if any.
    /// Used to release the registration's `activeCount` slot on a terminal
    /// state.
    pub schedule_name: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, data: Value, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            data,
            result: None,
            error: None,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: 1,
            priority: 0,
            created_at: now_ms,
            updated_at: now_ms,
            run_at: now_ms,
            schedule_name: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule_name(mut self, schedule_name: impl Into<String>) -> Self {
        self.schedule_name = Some(schedule_name.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_run_at(mut self, run_at: u64) -> Self {
        self.run_at = run_at;
        if run_at > self.created_at {
            self.state = JobState::Delayed;
        }
        self
    }

    pub fn is_eligible(&self, now_ms: u64) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.run_at <= now_ms
    }
}

/// Resolves the payload enqueued on each tick of a scheduled registration:
/// either a fixed value, or a producer closure invoked fresh every time.
#[derive(Clone)]
pub enum DataSource {
    Constant(Value),
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DataSource {
    pub fn resolve(&self) -> Value {
        match self {
            DataSource::Constant(v) => v.clone(),
            DataSource::Producer(producer) => producer(),
        }
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            DataSource::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

impl From<Value> for DataSource {
    fn from(value: Value) -> Self {
        DataSource::Constant(value)
    }
}

/// A named scheduled registration (cron or fixed interval) the engine
/// re-dispatches on its own clock. `active_count` tracks jobs this
/// registration produced that have not yet reached a terminal state;
/// a tick that is already at `max_concurrency` re-arms `next_run_at` but
/// skips the enqueue.
#[derive(Debug, Clone)]
pub struct ScheduledRegistration {
    pub name: String,
    pub job_name: String,
    pub data: DataSource,
    pub schedule: ScheduleKind,
    pub next_run_at: u64,
    pub max_concurrency: usize,
    pub active_count: usize,
    pub meta: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum ScheduleKind {
    /// `utc_offset_minutes` is the fixed offset from UTC the cron fields
    /// are matched against (no IANA tz database is carried by this crate).
    Cron {
        expr: String,
        utc_offset_minutes: i32,
    },
    IntervalMs(u64),
}

/// Typed equivalents of the named scheduler events.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed { job_id: String },
    Failed { job_id: String, error: String },
    Retried { job_id: String, attempt: u32 },
    ScheduleSkipped { name: String },
    ScheduleError { name: String, error: String },
}
