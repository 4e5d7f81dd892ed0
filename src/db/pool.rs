//! Connection pool and read-replica routing (C8).
//!
//! Connections are simulated the way the teacher's
//! `enterprise::database::connection::Connection` simulates a driver (a
//! `tokio::time::sleep` standing in for network I/O) rather than reaching
//! for a real driver crate. Pooling itself uses `deadpool::managed`, a
//! dependency the teacher's manifest already carried but never wired up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, Object, Pool, RecycleError, RecycleResult};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::dialect::{is_write_statement, Dialect};
use crate::health::{HealthCheck, HealthStatus};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to acquire connection: {0}")]
    AcquireFailed(String),
    #[error("connection unhealthy: {0}")]
    Unhealthy(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Per-call override of the default read-replica routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Round-robin across replicas when any exist, else the primary.
    #[default]
    Replica,
    /// Always the primary, even for a read-only statement.
    Primary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_size: usize,
    pub connection_timeout_ms: u64,
    pub simulated_latency_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            connection_timeout_ms: 5_000,
            simulated_latency_ms: 1,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub active: u64,
    pub idle: u64,
    pub created: u64,
    pub closed: u64,
    pub queries: u64,
}

/// A simulated connection: stands in for a real driver handle the way the
/// teacher's `Connection` does, issuing no actual I/O.
pub struct SimConnection {
    pub id: Uuid,
    latency: Duration,
    healthy: bool,
}

impl SimConnection {
    pub async fn execute(&self, sql: &str) -> PoolResult<u64> {
        tokio::time::sleep(self.latency).await;
        debug!("executed on {}: {}", self.id, sql);
        Ok(0)
    }

    pub async fn query(&self, sql: &str) -> PoolResult<Vec<Value>> {
        tokio::time::sleep(self.latency).await;
        debug!("queried on {}: {}", self.id, sql);
        Ok(Vec::new())
    }
}

pub struct ConnectionManager {
    config: PoolConfig,
    created: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            created: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Manager for ConnectionManager {
    type Type = SimConnection;
    type Error = PoolError;

    async fn create(&self) -> Result<SimConnection, PoolError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SimConnection {
            id: Uuid::new_v4(),
            latency: Duration::from_millis(self.config.simulated_latency_ms),
            healthy: true,
        })
    }

    async fn recycle(&self, conn: &mut SimConnection, _: &Metrics) -> RecycleResult<PoolError> {
        if conn.healthy {
            Ok(())
        } else {
            Err(RecycleError::Message("connection marked unhealthy".into()))
        }
    }
}

pub type PooledConnection = Object<ConnectionManager>;

/// Primary pool plus an ordered set of read replicas, round-robin routed.
pub struct DbPool {
    primary: Pool<ConnectionManager>,
    replicas: Vec<Pool<ConnectionManager>>,
    dialect: Arc<dyn Dialect>,
    round_robin: AtomicU64,
}

impl DbPool {
    pub fn new(
        config: PoolConfig,
        replica_count: usize,
        dialect: Arc<dyn Dialect>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let primary = Pool::builder(ConnectionManager::new(config.clone()))
            .max_size(config.max_size)
            .build()
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;

        let mut replicas = Vec::with_capacity(replica_count);
        for _ in 0..replica_count {
            let pool = Pool::builder(ConnectionManager::new(config.clone()))
                .max_size(config.max_size)
                .build()
                .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
            replicas.push(pool);
        }

        Ok(Self {
            primary,
            replicas,
            dialect,
            round_robin: AtomicU64::new(0),
        })
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    /// Writes and any statement issued inside a transaction always route
    /// to the primary; read-only statements outside a transaction are
    /// spread round-robin across replicas when any exist, unless
    /// `preference` pins the call to the primary.
    fn select_pool(
        &self,
        sql: &str,
        in_transaction: bool,
        preference: ReadPreference,
    ) -> &Pool<ConnectionManager> {
        if in_transaction
            || is_write_statement(sql)
            || self.replicas.is_empty()
            || preference == ReadPreference::Primary
        {
            return &self.primary;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) as usize % self.replicas.len();
        &self.replicas[index]
    }

    pub async fn acquire_for(
        &self,
        sql: &str,
        in_transaction: bool,
        preference: ReadPreference,
    ) -> PoolResult<PooledConnection> {
        self.select_pool(sql, in_transaction, preference)
            .get()
            .await
            .map_err(|e| PoolError::AcquireFailed(e.to_string()))
    }

    pub async fn execute(&self, sql: &str, in_transaction: bool) -> PoolResult<u64> {
        let conn = self
            .acquire_for(sql, in_transaction, ReadPreference::Primary)
            .await?;
        conn.execute(sql).await
    }

    pub async fn query(
        &self,
        sql: &str,
        in_transaction: bool,
        preference: ReadPreference,
    ) -> PoolResult<Vec<Value>> {
        let conn = self.acquire_for(sql, in_transaction, preference).await?;
        conn.query(sql).await
    }

    pub fn metrics(&self) -> PoolMetrics {
        let status = self.primary.status();
        PoolMetrics {
            active: (status.size - status.available as usize) as u64,
            idle: status.available as u64,
            created: status.size as u64,
            closed: 0,
            queries: 0,
        }
    }
}

/// Registers pool connectivity as a named health check, per the ambient
/// health-registry contract.
pub struct PoolHealthCheck {
    pool: Arc<DbPool>,
}

impl PoolHealthCheck {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthCheck for PoolHealthCheck {
    fn name(&self) -> &str {
        "db_pool"
    }

    async fn check(&self) -> HealthStatus {
        match self.pool.primary.get().await {
            Ok(_) => HealthStatus::Up,
            Err(e) => {
                warn!("db pool health check failed: {}", e);
                HealthStatus::Down {
                    details: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::PostgresDialect;

    fn pool(replicas: usize) -> DbPool {
        DbPool::new(PoolConfig::default(), replicas, Arc::new(PostgresDialect)).unwrap()
    }

    #[tokio::test]
    async fn write_statements_route_to_primary_even_with_replicas() {
        let pool = pool(2);
        let selected = pool.select_pool("INSERT INTO t VALUES (1)", false, ReadPreference::Replica);
        assert!(std::ptr::eq(selected, &pool.primary));
    }

    #[tokio::test]
    async fn in_transaction_statements_route_to_primary() {
        let pool = pool(2);
        let selected = pool.select_pool("SELECT 1", true, ReadPreference::Replica);
        assert!(std::ptr::eq(selected, &pool.primary));
    }

    #[tokio::test]
    async fn reads_spread_across_replicas_round_robin() {
        let pool = pool(2);
        let first = pool.select_pool("SELECT 1", false, ReadPreference::Replica) as *const _;
        let second = pool.select_pool("SELECT 1", false, ReadPreference::Replica) as *const _;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn no_replicas_falls_back_to_primary() {
        let pool = pool(0);
        let selected = pool.select_pool("SELECT 1", false, ReadPreference::Replica);
        assert!(std::ptr::eq(selected, &pool.primary));
    }

    #[tokio::test]
    async fn read_preference_primary_overrides_replica_round_robin() {
        let pool = pool(2);
        let selected = pool.select_pool("SELECT 1", false, ReadPreference::Primary);
        assert!(std::ptr::eq(selected, &pool.primary));
    }

    #[tokio::test]
    async fn acquire_and_execute_round_trip() {
        let pool = pool(0);
        let rows = pool.execute("SELECT 1", false).await.unwrap();
        assert_eq!(rows, 0);
    }
}
