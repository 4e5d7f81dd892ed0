//! Aggregated health reporting shared by every engine.
//!
//! Each engine that owns a background resource (a connection pool, a job
//! store) registers a named [`HealthCheck`] here; callers read back the
//! aggregate without reaching into engine internals.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Outcome of a single named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Up,
    Down { details: Option<String> },
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, HealthStatus::Up)
    }
}

/// A named, independently pollable health probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this check failing should mark the whole service down.
    fn critical(&self) -> bool {
        true
    }

    async fn check(&self) -> HealthStatus;
}

/// Snapshot of one check's last result, suitable for a `/health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub name: String,
    pub critical: bool,
    pub status: HealthStatus,
}

/// Aggregated status: `down` if any critical check is down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub status: HealthStatus,
    pub checks: Vec<HealthReport>,
}

/// Registry every engine's health check is registered against.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checks: Arc<DashMap<String, Arc<dyn HealthCheck>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            checks: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, check: Arc<dyn HealthCheck>) {
        self.checks.insert(check.name().to_string(), check);
    }

    pub fn unregister(&self, name: &str) {
        self.checks.remove(name);
    }

    /// Poll every registered check and aggregate per the contract: the
    /// overall status is `down` if any `critical` check is down.
    pub async fn aggregate(&self) -> AggregateHealth {
        let mut reports = Vec::with_capacity(self.checks.len());
        let mut any_critical_down = false;

        for entry in self.checks.iter() {
            let check = entry.value().clone();
            let status = check.check().await;
            if check.critical() && !status.is_up() {
                any_critical_down = true;
            }
            reports.push(HealthReport {
                name: check.name().to_string(),
                critical: check.critical(),
                status,
            });
        }

        let status = if any_critical_down {
            HealthStatus::Down {
                details: Some("one or more critical checks failing".to_string()),
            }
        } else {
            HealthStatus::Up
        };

        AggregateHealth {
            status,
            checks: reports,
        }
    }
}
