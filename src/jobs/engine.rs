//! Job engine (C7): dispatches eligible jobs to registered handlers with
//! bounded concurrency, exponential or fixed retry backoff, a rate-limiter
//! gate, and cron/interval scheduling.
//!
//! The worker loop's spawn-per-slot, pause/cancel-checking shape is
//! grounded on the teacher's `WorkflowEngine::execute_workflow`
//! (`enterprise::workflow::engine`): each slot loops, checking a paused
//! flag before doing work, and is woken rather than busy-polled once idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;

use crate::jobs::cron::{CronError, CronSchedule};
use crate::jobs::model::{DataSource, Job, JobEvent, JobState, ScheduleKind, ScheduledRegistration};
use crate::jobs::store::JobStore;
use crate::ratelimit::RateLimiterStore;

#[derive(Debug, Error)]
pub enum JobEngineError {
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("schedule {0} not found")]
    ScheduleNotFound(String),
    #[error("schedule {0} already exists")]
    ScheduleExists(String),
    #[error("no handler registered for job {0}")]
    NoHandler(String),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
    #[error(transparent)]
    Cron(#[from] CronError),
}

pub type JobEngineResult<T> = Result<T, JobEngineError>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Executes the work named by a job. Implementors are registered against a
/// job name; a job whose name has no handler is never dequeued
/// successfully.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, String>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub kind: BackoffKind,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// `min(maxDelay, fixed ? delay : delay * 2^attemptsMade)`.
    pub fn backoff_for(&self, attempts_made: u32) -> u64 {
        let raw = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                self.delay_ms.saturating_mul(1u64 << attempts_made.min(32))
            }
        };
        raw.min(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitGate {
    pub max_per_window: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEngineConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// How often the scheduler task re-checks registrations for a due
    /// tick. Collapses what the spec models as one timer per registration
    /// into a single poll loop, the same way the job dispatch workers poll
    /// rather than each job owning its own timer.
    pub scheduler_poll_interval_ms: u64,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimitGate>,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 50,
            scheduler_poll_interval_ms: 200,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

impl JobEngineConfig {
    pub fn validate(&self) -> JobEngineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: i32,
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 1,
            delay_ms: 0,
        }
    }
}

/// Coordinates dispatch of eligible jobs to registered handlers, applying
/// priority/run-at ordering (via the store), retry backoff, an optional
/// rate-limiter gate, and cron/interval re-scheduling.
pub struct JobEngine {
    store: Arc<JobStore>,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    schedules: DashMap<String, ScheduledRegistration>,
    config: JobEngineConfig,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    active_workers: AtomicU64,
    wake: Notify,
    /// Shared (C3) fixed-window counter store; the dispatch rate-limit
    /// gate keys into it under a constant name, since the gate is
    /// per-engine rather than per-caller-identity.
    rate_limiter: Arc<RateLimiterStore>,
    on_event: Option<Arc<dyn Fn(JobEvent) + Send + Sync>>,
}

impl JobEngine {
    pub fn new(config: JobEngineConfig) -> JobEngineResult<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(JobStore::new()),
            handlers: DashMap::new(),
            schedules: DashMap::new(),
            config,
            paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            active_workers: AtomicU64::new(0),
            wake: Notify::new(),
            rate_limiter: Arc::new(RateLimiterStore::new()),
            on_event: None,
        })
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn Fn(JobEvent) + Send + Sync>) -> Self {
        self.on_event = Some(handler);
        self
    }

    fn emit(&self, event: JobEvent) {
        if let Some(handler) = &self.on_event {
            handler(event);
        }
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn add(&self, name: impl Into<String>, data: Value, options: JobOptions) -> String {
        let name = name.into();
        let now = now_ms();
        let job = Job::new(name, data, now)
            .with_priority(options.priority)
            .with_max_attempts(options.max_attempts)
            .with_run_at(now + options.delay_ms);
        let id = self.store.enqueue(job);
        self.wake.notify_one();
        id
    }

    pub fn add_bulk(&self, items: Vec<(String, Value, JobOptions)>) -> Vec<String> {
        let now = now_ms();
        let jobs: Vec<Job> = items
            .into_iter()
            .map(|(name, data, options)| {
                Job::new(name, data, now)
                    .with_priority(options.priority)
                    .with_max_attempts(options.max_attempts)
                    .with_run_at(now + options.delay_ms)
            })
            .collect();
        let ids = self.store.enqueue_bulk(jobs);
        self.wake.notify_waiters();
        ids
    }

    /// Register a recurring source. `max_concurrency` bounds how many jobs
    /// produced by this registration may be outstanding (not yet
    /// completed or failed) at once; a tick at the cap re-arms
    /// `next_run_at` but skips the enqueue.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        job_name: impl Into<String>,
        data: impl Into<DataSource>,
        schedule: ScheduleKind,
        max_concurrency: usize,
    ) -> JobEngineResult<()> {
        let name = name.into();
        if self.schedules.contains_key(&name) {
            return Err(JobEngineError::ScheduleExists(name));
        }

        let next_run_at = Self::compute_next_run(&schedule, now_ms())?;
        self.schedules.insert(
            name.clone(),
            ScheduledRegistration {
                name,
                job_name: job_name.into(),
                data: data.into(),
                schedule,
                next_run_at,
                max_concurrency: max_concurrency.max(1),
                active_count: 0,
                meta: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn unschedule(&self, name: &str) -> JobEngineResult<()> {
        self.schedules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| JobEngineError::ScheduleNotFound(name.to_string()))
    }

    fn compute_next_run(schedule: &ScheduleKind, from_ms: u64) -> JobEngineResult<u64> {
        match schedule {
            ScheduleKind::IntervalMs(interval) => Ok(from_ms + interval),
            ScheduleKind::Cron { expr, utc_offset_minutes } => {
                let parsed = CronSchedule::parse(expr)?;
                let from = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(from_ms as i64)
                    .unwrap_or_else(chrono::Utc::now);
                let next = parsed
                    .next_fire_with_offset(from, *utc_offset_minutes)
                    .ok_or_else(|| CronError::InvalidExpression("no upcoming fire time within one year".to_string()))?;
                Ok(next.timestamp_millis() as u64)
            }
        }
    }

    /// Enqueue a job on behalf of a scheduled registration, tagging it so
    /// its terminal state can release the registration's `activeCount`
    /// slot.
    fn add_scheduled(&self, job_name: String, data: Value, schedule_name: String) -> String {
        let now = now_ms();
        let job = Job::new(job_name, data, now).with_schedule_name(schedule_name);
        let id = self.store.enqueue(job);
        self.wake.notify_one();
        id
    }

    /// Release a finished job's slot against the schedule that produced
    /// it, if any. Called once a job reaches `completed` or `failed`.
    fn release_schedule_slot(&self, job: &Job) {
        let Some(schedule_name) = &job.schedule_name else {
            return;
        };
        if let Some(mut registration) = self.schedules.get_mut(schedule_name) {
            registration.active_count = registration.active_count.saturating_sub(1);
        }
    }

    /// Run every due schedule once, re-arming each for its next fire time.
    /// Intended to run on an interval alongside the worker loop.
    ///
    /// Ticks keep firing while paused and while a registration is at its
    /// concurrency cap — only the enqueue is skipped, each observable as
    /// a `schedule:skipped` event.
    pub fn tick_schedules(&self) {
        let now = now_ms();
        let due: Vec<String> = self
            .schedules
            .iter()
            .filter(|e| e.value().next_run_at <= now)
            .map(|e| e.key().clone())
            .collect();

        for name in due {
            let Some(mut entry) = self.schedules.get_mut(&name) else { continue };

            let skip_reason = if self.paused.load(Ordering::SeqCst) {
                Some("engine paused")
            } else if !self.handlers.contains_key(&entry.job_name) {
                Some("no handler registered")
            } else if entry.active_count >= entry.max_concurrency {
                Some("at max concurrency")
            } else {
                None
            };

            match skip_reason {
                Some(reason) => {
                    self.emit(JobEvent::ScheduleSkipped { name: name.clone() });
                    debug!("schedule {} skipped: {}", name, reason);
                }
                None => {
                    let data = entry.data.resolve();
                    let job_name = entry.job_name.clone();
                    let schedule_name = entry.name.clone();
                    entry.active_count += 1;
                    let job_id = self.add_scheduled(job_name, data, schedule_name);
                    debug!("schedule {} enqueued job {}", name, job_id);
                }
            }

            match Self::compute_next_run(&entry.schedule, now) {
                Ok(next) => entry.next_run_at = next,
                Err(e) => {
                    self.emit(JobEvent::ScheduleError {
                        name: name.clone(),
                        error: e.to_string(),
                    });
                    warn!("schedule {} failed to compute next run: {}", name, e);
                }
            }
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Requeue a failed job for immediate redispatch, resetting its
    /// attempt counter.
    pub fn retry(&self, job_id: &str) -> JobEngineResult<()> {
        let mut job = self
            .store
            .get(job_id)
            .ok_or_else(|| JobEngineError::JobNotFound(job_id.to_string()))?;
        job.state = JobState::Waiting;
        job.attempts_made = 0;
        job.run_at = now_ms();
        job.updated_at = now_ms();
        self.store.update(job).map_err(|_| JobEngineError::JobNotFound(job_id.to_string()))?;
        self.wake.notify_one();
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id)
    }

    pub fn store(&self) -> Arc<JobStore> {
        self.store.clone()
    }

    /// True once the rate limiter gate would admit one more dispatch in
    /// the current window, rolling the window over if it has elapsed.
    fn admit_one(&self) -> bool {
        let Some(gate) = &self.config.rate_limit else {
            return true;
        };
        self.rate_limiter
            .check("__dispatch__", gate.window_ms, gate.max_per_window)
            .is_ok()
    }

    async fn process_one(&self) -> bool {
        if self.paused.load(Ordering::SeqCst) || !self.admit_one() {
            return false;
        }

        let Some(job) = self.store.dequeue(now_ms()) else {
            return false;
        };

        let Some(handler) = self.handlers.get(&job.name).map(|h| h.clone()) else {
            let mut job = job;
            job.state = JobState::Failed;
            job.error = Some(format!("no handler registered for {}", job.name));
            job.updated_at = now_ms();
            let _ = self.store.update(job.clone());
            self.release_schedule_slot(&job);
            self.emit(JobEvent::Failed {
                job_id: job.id,
                error: "no handler".to_string(),
            });
            return true;
        };

        debug!("dispatching job {} ({})", job.id, job.name);
        let mut job = job;
        let attempts_before = job.attempts_made;
        job.attempts_made += 1;

        match handler.handle(&job).await {
            Ok(result) => {
                job.result = Some(result);
                job.state = JobState::Completed;
                job.updated_at = now_ms();
                let _ = self.store.update(job.clone());
                info!("job {} completed", job.id);
                self.release_schedule_slot(&job);
                self.emit(JobEvent::Completed { job_id: job.id });
            }
            Err(error) => {
                if job.attempts_made >= job.max_attempts {
                    job.state = JobState::Failed;
                    job.error = Some(error.clone());
                    job.updated_at = now_ms();
                    let _ = self.store.update(job.clone());
                    warn!("job {} failed permanently: {}", job.id, error);
                    self.release_schedule_slot(&job);
                    self.emit(JobEvent::Failed {
                        job_id: job.id,
                        error,
                    });
                } else {
                    // `backoff_for` takes the 0-indexed count of attempts
                    // made before this one, not the post-increment total.
                    let delay = self.config.retry.backoff_for(attempts_before);
                    job.state = JobState::Delayed;
                    job.run_at = now_ms() + delay;
                    job.error = Some(error);
                    job.updated_at = now_ms();
                    let attempt = job.attempts_made;
                    let job_id = job.id.clone();
                    let _ = self.store.update(job);
                    info!("job {} scheduled for retry {} in {}ms", job_id, attempt, delay);
                    self.emit(JobEvent::Retried { job_id, attempt });
                }
            }
        }
        true
    }

    /// Spawn `concurrency` worker tasks, each looping: try to process one
    /// job, and sleep `poll_interval_ms` (or wait to be woken) when there
    /// was nothing to do. Also spawns one scheduler task that ticks every
    /// registered cron/interval source on `scheduler_poll_interval_ms`,
    /// collapsing what the spec models as a timer per registration into a
    /// single poll loop alongside the dispatch workers.
    pub fn run(self: &Arc<Self>) {
        for _ in 0..self.config.concurrency {
            let engine = self.clone();
            engine.active_workers.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                loop {
                    if engine.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    if engine.process_one().await {
                        continue;
                    }
                    tokio::select! {
                        _ = engine.wake.notified() => {},
                        _ = tokio::time::sleep(std::time::Duration::from_millis(engine.config.poll_interval_ms)) => {},
                    }
                }
                engine.active_workers.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let engine = self.clone();
        engine.active_workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                if engine.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                engine.tick_schedules();
                tokio::time::sleep(std::time::Duration::from_millis(
                    engine.config.scheduler_poll_interval_ms,
                ))
                .await;
            }
            engine.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Signal workers to stop after their current job and wait for them to
    /// drain, up to a bound on poll iterations.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        while self.active_workers.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
