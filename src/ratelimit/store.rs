//! Fixed-window rate limiter store (C3): `increment(key, window_ms)`
//! returns the count for the current window, seeding a fresh window when
//! none exists or the current one has elapsed.
//!
//! Grounded on the teacher's `QuotaUsageTracker::reset_if_expired`
//! (`enterprise::ratelimit::quota`), which resets a counter's `period_start`
//! once `now >= period_start + period` — the same fixed-window reset rule,
//! narrowed here to the bare counter contract without quota hierarchy or
//! burst limits.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {key}: {count}/{limit} in current window")]
    Exceeded {
        key: String,
        count: u64,
        limit: u64,
    },
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    reset_at: u64,
}

/// Counter store backing fixed-window rate limiting. One window per key;
/// `increment` seeds a fresh window when the key is new or the prior
/// window has elapsed (`now >= reset_at`), otherwise it adds to the
/// existing count.
pub struct RateLimiterStore {
    windows: DashMap<String, Mutex<Window>>,
}

impl RateLimiterStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Increment `key`'s counter within a window of `window_ms`, returning
    /// the resulting count and the window's reset timestamp (ms since
    /// epoch).
    pub fn increment(&self, key: &str, window_ms: u64) -> (u64, u64) {
        let now = now_ms();
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(Window {
                    count: 0,
                    reset_at: now + window_ms,
                })
            });

        let mut window = entry.lock();
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + window_ms;
        }
        window.count += 1;
        (window.count, window.reset_at)
    }

    /// Read the current count without incrementing. Returns `None` if the
    /// key has no window yet, or the window has already elapsed.
    pub fn get(&self, key: &str) -> Option<(u64, u64)> {
        let entry = self.windows.get(key)?;
        let window = entry.lock();
        if now_ms() >= window.reset_at {
            return None;
        }
        Some((window.count, window.reset_at))
    }

    /// Check `increment`'s result against a limit, surfacing
    /// [`RateLimitError::Exceeded`] once the window's count exceeds it.
    pub fn check(&self, key: &str, window_ms: u64, limit: u64) -> RateLimitResult<u64> {
        let (count, _) = self.increment(key, window_ms);
        if count > limit {
            return Err(RateLimitError::Exceeded {
                key: key.to_string(),
                count,
                limit,
            });
        }
        Ok(count)
    }

    /// Drop windows that elapsed before `now`, bounding memory growth for
    /// keys that stop being used. Intended to run on an interval.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = self
            .windows
            .iter()
            .filter(|e| now >= e.value().lock().reset_at)
            .map(|e| e.key().clone())
            .collect();

        for key in &expired {
            self.windows.remove(key);
        }
        expired.len()
    }
}

impl Default for RateLimiterStore {
    fn default() -> Self {
        Self::new()
    }
}
