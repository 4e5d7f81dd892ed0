//! Transaction manager (C10): `run` wraps a callback in `BEGIN`/`COMMIT`/
//! `ROLLBACK`; `with_savepoint` nests further levels with `SAVEPOINT sp_N`/
//! `RELEASE`/`ROLLBACK TO`.
//!
//! Grounded on the teacher's `Transaction`/`SavepointGuard`
//! (`enterprise::database::transaction`), narrowed from its isolation-level
//! and read-only knobs to the savepoint-nesting contract this crate needs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::pool::{DbPool, PoolError};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction is not active")]
    NotActive,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("callback failed: {0}")]
    CallbackFailed(String),
}

pub type TransactionResult<T> = Result<T, TransactionError>;

/// Identifies a transaction and its current savepoint nesting depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionContext {
    pub id: String,
    pub depth: u32,
    pub savepoints: Vec<String>,
}

impl TransactionContext {
    fn root() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            depth: 0,
            savepoints: Vec::new(),
        }
    }

    fn next_savepoint_name(&self) -> String {
        format!("sp_{}", self.savepoints.len() + 1)
    }
}

/// Runs callbacks inside transactions against one pool, tracking nested
/// savepoint depth per transaction.
pub struct TransactionManager {
    pool: Arc<DbPool>,
    savepoint_counter: AtomicU64,
}

impl TransactionManager {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self {
            pool,
            savepoint_counter: AtomicU64::new(0),
        }
    }

    /// Run `callback` inside a top-level transaction: `BEGIN`, the
    /// callback, then `COMMIT` on success or `ROLLBACK` on error.
    pub async fn run<F, Fut, T>(&self, callback: F) -> TransactionResult<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = TransactionResult<T>>,
    {
        let ctx = TransactionContext::root();
        self.pool.execute("BEGIN", true).await?;

        match callback(ctx).await {
            Ok(value) => {
                self.pool.execute("COMMIT", true).await?;
                Ok(value)
            }
            Err(e) => {
                self.pool.execute("ROLLBACK", true).await.ok();
                Err(e)
            }
        }
    }

    /// Run `callback` inside a new savepoint nested within `ctx`'s
    /// transaction: `SAVEPOINT sp_N`, the callback, then `RELEASE
    /// SAVEPOINT sp_N` on success or `ROLLBACK TO SAVEPOINT sp_N` on
    /// error.
    pub async fn with_savepoint<F, Fut, T>(
        &self,
        ctx: &TransactionContext,
        callback: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = TransactionResult<T>>,
    {
        let name = ctx.next_savepoint_name();
        self.savepoint_counter.fetch_add(1, Ordering::Relaxed);

        let mut nested = ctx.clone();
        nested.depth += 1;
        nested.savepoints.push(name.clone());

        self.pool
            .execute(&format!("SAVEPOINT {}", name), true)
            .await?;

        match callback(nested).await {
            Ok(value) => {
                self.pool
                    .execute(&format!("RELEASE SAVEPOINT {}", name), true)
                    .await?;
                Ok(value)
            }
            Err(e) => {
                self.pool
                    .execute(&format!("ROLLBACK TO SAVEPOINT {}", name), true)
                    .await
                    .ok();
                Err(e)
            }
        }
    }
}
