//! # Rate Limiter
//!
//! Fixed-window counter store (C3) used directly by callers and, as a gate,
//! by the job engine's worker loop.

pub mod store;

pub use store::{RateLimitError, RateLimitResult, RateLimiterStore};
