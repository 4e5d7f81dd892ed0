//! Job store abstraction (C6): enqueue/dequeue/update/get/list/stats/clean
//! over a single mutex-guarded table, ordered for dispatch by priority
//! descending then `run_at` ascending.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::model::{Job, JobState};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    JobNotFound(String),
}

pub type JobStoreResult<T> = Result<T, JobStoreError>;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
}

/// In-memory job table. Every mutating operation takes the single lock
/// once, so `enqueue_bulk` can batch many inserts under one acquisition
/// instead of looping separate lock/unlock cycles per job.
pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, job: Job) -> String {
        let id = job.id.clone();
        self.jobs.lock().insert(id.clone(), job);
        id
    }

    pub fn enqueue_bulk(&self, jobs: Vec<Job>) -> Vec<String> {
        let mut table = self.jobs.lock();
        jobs.into_iter()
            .map(|job| {
                let id = job.id.clone();
                table.insert(id.clone(), job);
                id
            })
            .collect()
    }

    /// Claim the highest-priority eligible job (priority descending, then
    /// `run_at` ascending to break ties), marking it active.
    pub fn dequeue(&self, now_ms: u64) -> Option<Job> {
        let mut table = self.jobs.lock();
        let id = table
            .values()
            .filter(|j| j.is_eligible(now_ms))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.run_at.cmp(&b.run_at))
            })
            .map(|j| j.id.clone())?;

        let job = table.get_mut(&id)?;
        job.state = JobState::Active;
        job.updated_at = now_ms;
        Some(job.clone())
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().get(id).cloned()
    }

    pub fn update(&self, job: Job) -> JobStoreResult<()> {
        let mut table = self.jobs.lock();
        if !table.contains_key(&job.id) {
            return Err(JobStoreError::JobNotFound(job.id));
        }
        table.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn list(&self, state: Option<JobState>) -> Vec<Job> {
        let table = self.jobs.lock();
        table
            .values()
            .filter(|j| state.map(|s| s == j.state).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> JobStats {
        let table = self.jobs.lock();
        let mut stats = JobStats::default();
        for job in table.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Delayed => stats.delayed += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Paused => stats.paused += 1,
            }
        }
        stats
    }

    /// Remove terminal-state (`Completed`/`Failed`) jobs last updated
    /// before `older_than_ms`. Intended as a periodic reaper, mirroring
    /// the rate limiter's window sweeper.
    pub fn clean(&self, older_than_ms: u64, now_ms: u64) -> usize {
        let mut table = self.jobs.lock();
        let cutoff = now_ms.saturating_sub(older_than_ms);
        let expired: Vec<String> = table
            .values()
            .filter(|j| {
                matches!(j.state, JobState::Completed | JobState::Failed)
                    && j.updated_at < cutoff
            })
            .map(|j| j.id.clone())
            .collect();

        for id in &expired {
            table.remove(id);
        }
        expired.len()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(name: &str, priority: i32) -> Job {
        Job::new(name, json!({}), now_ms()).with_priority(priority)
    }

    #[test]
    fn dequeue_picks_highest_priority_first() {
        let store = JobStore::new();
        store.enqueue(job("low", 1));
        store.enqueue(job("high", 10));

        let dequeued = store.dequeue(now_ms()).unwrap();
        assert_eq!(dequeued.name, "high");
    }

    #[test]
    fn dequeue_breaks_priority_ties_by_run_at() {
        let store = JobStore::new();
        let mut later = job("later", 5);
        later.run_at = now_ms() + 5;
        let earlier = job("earlier", 5);

        store.enqueue(later);
        store.enqueue(earlier);

        let dequeued = store.dequeue(now_ms() + 10).unwrap();
        assert_eq!(dequeued.name, "earlier");
    }

    #[test]
    fn delayed_job_is_not_eligible_before_run_at() {
        let store = JobStore::new();
        let future = job("future", 0).with_run_at(now_ms() + 60_000);
        store.enqueue(future);

        assert!(store.dequeue(now_ms()).is_none());
    }

    #[test]
    fn enqueue_bulk_shares_one_lock_acquisition() {
        let store = JobStore::new();
        let jobs = vec![job("a", 0), job("b", 0), job("c", 0)];
        let ids = store.enqueue_bulk(jobs);
        assert_eq!(ids.len(), 3);
        assert_eq!(store.stats().waiting, 3);
    }

    #[test]
    fn clean_removes_only_old_terminal_jobs() {
        let store = JobStore::new();
        let mut completed = job("done", 0);
        completed.state = JobState::Completed;
        completed.updated_at = 0;
        store.enqueue(completed);

        let mut active = job("active", 0);
        active.state = JobState::Active;
        active.updated_at = 0;
        store.enqueue(active);

        let removed = store.clean(1_000, now_ms());
        assert_eq!(removed, 1);
        assert_eq!(store.stats().active, 1);
    }
}
