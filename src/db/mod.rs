//! # Relational Query Orchestrator
//!
//! Dialect-aware SQL composition (C8/C9) over a pooled connection with
//! read-replica routing, transactions with savepoints (C10), and slow-
//! query/N+1/missing-index telemetry (C11).

pub mod dialect;
pub mod optimizer;
pub mod pool;
pub mod query;
pub mod transaction;

pub use dialect::{Capabilities, Dialect, MySqlDialect, PostgresDialect, SqliteDialect};
pub use optimizer::{Hint, OptimizerConfig, QueryOptimizer, QueryStats};
pub use pool::{DbPool, PoolConfig, PoolError, PoolHealthCheck, PoolMetrics, PoolResult, ReadPreference};
pub use query::{
    EagerLoadSpec, MutationEvent, MutationKind, QueryBuilder, QueryError, QueryMetrics,
    QueryOrchestrator, QueryResult, RelationKind, ThroughSpec,
};
pub use transaction::{TransactionContext, TransactionError, TransactionManager, TransactionResult};
