//! Query optimizer (C11): flags slow queries, repeated-pattern N+1 access,
//! and table scans missing an index, buffered for one read and cleared
//! after.
//!
//! Grounded on the top-level `database::query_optimizer::QueryOptimizer`
//! (not the enterprise module), whose `DashMap`-keyed plan cache and
//! `record_execution` feedback loop is reused here; its CAD-specific
//! spatial-index hinting is dropped in favor of the hint kinds this
//! crate's contract names.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hint {
    SlowQuery { fingerprint: String, duration_ms: u64 },
    NPlusOne { fingerprint: String, occurrences: u32 },
    MissingIndex { table: String, column: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub slow_query_threshold_ms: u64,
    pub n_plus_one_threshold: u32,
    /// Window within which repeated fingerprints count toward the N+1
    /// threshold; older occurrences age out.
    pub n_plus_one_window_ms: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 25,
            n_plus_one_threshold: 5,
            n_plus_one_window_ms: 1_000,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn fingerprint(sql: &str) -> String {
    let mut hasher = DefaultHasher::new();
    // Collapse whitespace so formatting differences don't defeat the
    // fingerprint the way literal values embedded in the query would.
    let normalized: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[derive(Debug, Clone)]
struct Occurrence {
    seen_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStats {
    pub executions: u64,
    pub total_duration_ms: u64,
}

/// Accumulates execution feedback and buffers hints until the next read,
/// clearing the buffer afterward (one-shot).
pub struct QueryOptimizer {
    config: OptimizerConfig,
    stats: DashMap<String, QueryStats>,
    recent_occurrences: DashMap<String, Vec<Occurrence>>,
    pending_hints: Mutex<Vec<Hint>>,
    /// Columns covered by a defined index, per table. Drives
    /// `note_where_columns`'s missing-index detection.
    indexes: DashMap<String, HashSet<String>>,
}

impl QueryOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            stats: DashMap::new(),
            recent_occurrences: DashMap::new(),
            pending_hints: Mutex::new(Vec::new()),
            indexes: DashMap::new(),
        }
    }

    /// Register a column as covered by an index on `table`, so WHERE
    /// clauses filtering on it are not flagged as table scans.
    pub fn define_index(&self, table: impl Into<String>, column: impl Into<String>) {
        self.indexes
            .entry(table.into())
            .or_default()
            .insert(column.into());
    }

    /// Feed back the column list of a query's WHERE clause; any column
    /// on `table` not covered by a defined index is reported via
    /// `flag_missing_index` (advisory only, one hint per column per
    /// call).
    pub fn note_where_columns(&self, table: &str, columns: &[String]) {
        let indexed = self.indexes.get(table);
        for column in columns {
            let covered = indexed
                .as_ref()
                .map(|cols| cols.contains(column))
                .unwrap_or(false);
            if !covered {
                self.flag_missing_index(table, column.clone());
            }
        }
    }

    /// Feed back an executed query's duration, updating aggregate stats
    /// and pushing any newly triggered hints into the pending buffer.
    pub fn record_execution(&self, sql: &str, duration_ms: u64) {
        let fp = fingerprint(sql);

        self.stats
            .entry(fp.clone())
            .and_modify(|s| {
                s.executions += 1;
                s.total_duration_ms += duration_ms;
            })
            .or_insert(QueryStats {
                executions: 1,
                total_duration_ms: duration_ms,
            });

        if duration_ms > self.config.slow_query_threshold_ms {
            self.pending_hints.lock().push(Hint::SlowQuery {
                fingerprint: fp.clone(),
                duration_ms,
            });
        }

        self.track_n_plus_one(&fp);
    }

    fn track_n_plus_one(&self, fingerprint: &str) {
        let now = now_ms();
        let mut occurrences = self
            .recent_occurrences
            .entry(fingerprint.to_string())
            .or_default();
        occurrences.retain(|o| now.saturating_sub(o.seen_at) <= self.config.n_plus_one_window_ms);
        occurrences.push(Occurrence { seen_at: now });

        if occurrences.len() as u32 >= self.config.n_plus_one_threshold {
            self.pending_hints.lock().push(Hint::NPlusOne {
                fingerprint: fingerprint.to_string(),
                occurrences: occurrences.len() as u32,
            });
            // Resets after the report: the same burst won't re-trigger
            // on its next occurrence.
            occurrences.clear();
        }
    }

    /// Flag a table scan an orchestrator detected has no supporting
    /// index.
    pub fn flag_missing_index(&self, table: impl Into<String>, column: impl Into<String>) {
        self.pending_hints.lock().push(Hint::MissingIndex {
            table: table.into(),
            column: column.into(),
        });
    }

    /// Drain and clear the pending hint buffer: a one-shot read, not an
    /// accumulating log.
    pub fn drain_hints(&self) -> Vec<Hint> {
        std::mem::take(&mut *self.pending_hints.lock())
    }

    pub fn stats_for(&self, sql: &str) -> Option<QueryStats> {
        self.stats.get(&fingerprint(sql)).map(|s| s.clone())
    }

    pub fn all_stats(&self) -> HashMap<String, QueryStats> {
        self.stats.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_query_over_threshold_is_hinted() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default());
        optimizer.record_execution("SELECT * FROM users", 50);
        let hints = optimizer.drain_hints();
        assert!(hints.iter().any(|h| matches!(h, Hint::SlowQuery { .. })));
    }

    #[test]
    fn fast_query_is_not_hinted() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default());
        optimizer.record_execution("SELECT * FROM users", 5);
        assert!(optimizer.drain_hints().is_empty());
    }

    #[test]
    fn n_plus_one_pattern_is_hinted_once_threshold_is_hit() {
        let optimizer = QueryOptimizer::new(OptimizerConfig {
            n_plus_one_threshold: 3,
            ..OptimizerConfig::default()
        });
        for _ in 0..3 {
            optimizer.record_execution("SELECT * FROM orders WHERE user_id = 1", 1);
        }
        let hints = optimizer.drain_hints();
        assert!(hints.iter().any(|h| matches!(h, Hint::NPlusOne { .. })));
    }

    #[test]
    fn hint_buffer_clears_after_one_read() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default());
        optimizer.record_execution("SELECT * FROM users", 50);
        assert_eq!(optimizer.drain_hints().len(), 1);
        assert!(optimizer.drain_hints().is_empty());
    }

    #[test]
    fn where_column_without_an_index_is_flagged() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default());
        optimizer.note_where_columns("users", &["email".to_string()]);
        let hints = optimizer.drain_hints();
        assert!(hints.iter().any(
            |h| matches!(h, Hint::MissingIndex { table, column } if table == "users" && column == "email")
        ));
    }

    #[test]
    fn where_column_covered_by_a_defined_index_is_not_flagged() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default());
        optimizer.define_index("users", "email");
        optimizer.note_where_columns("users", &["email".to_string()]);
        assert!(optimizer.drain_hints().is_empty());
    }

    #[test]
    fn stats_accumulate_across_executions() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default());
        optimizer.record_execution("SELECT 1", 5);
        optimizer.record_execution("SELECT 1", 15);
        let stats = optimizer.stats_for("SELECT 1").unwrap();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.total_duration_ms, 20);
    }
}
