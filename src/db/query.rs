//! Query orchestrator (C9): composes SQL via `sea-query`, resolves eager
//! loads in round trips batched by relation (never N+1), and feeds
//! execution timing into the query optimizer.
//!
//! SQL is always rendered through `SqliteQueryBuilder`: the simulated
//! connection underneath (`db::pool::SimConnection`) has no real backend
//! to speak a dialect to, so only the `RETURNING` fragment and write
//! routing defer to the pool's configured [`Dialect`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sea_query::{Alias, Asterisk, Expr, Order, Query, SimpleExpr, SqliteQueryBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::optimizer::QueryOptimizer;
use crate::db::pool::{DbPool, PoolError, ReadPreference};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("belongsTo relation {0} resolved more than one row for a single key")]
    NonUniqueBelongsTo(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub sql: String,
    pub duration_ms: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
    ManyToMany,
}

/// The join table for a `ManyToMany` relation.
#[derive(Debug, Clone)]
pub struct ThroughSpec {
    pub table: String,
    /// Column on the through table joining back to the base rows' key.
    pub local_key: String,
    /// Column on the through table joining to the related rows' key.
    pub foreign_key: String,
}

#[derive(Debug, Clone)]
pub struct EagerLoadSpec {
    /// Key the related rows are attached under on each base row.
    pub name: String,
    pub kind: RelationKind,
    pub related_table: String,
    /// Column on the related table joining back to the base rows' key
    /// (direct relations), or to the through table's foreign key
    /// (`ManyToMany`).
    pub foreign_key: String,
    /// Column on the base rows supplying the join value (usually `id`,
    /// or the belongsTo row's own foreign key column).
    pub local_key: String,
    /// Present only for `RelationKind::ManyToMany`.
    pub through: Option<ThroughSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// Emitted once per mutated row on `insert`/`update`, and once per
/// `delete` call describing what matched, to any realtime subscriber.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub table: String,
    pub kind: MutationKind,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy)]
enum WhereOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
struct WherePredicate {
    column: String,
    op: WhereOp,
    value: Value,
}

fn json_to_simple_expr(value: &Value) -> SimpleExpr {
    match value {
        Value::Null => Expr::cust("NULL"),
        Value::Bool(b) => Expr::value(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Expr::value(i)
            } else if let Some(f) = n.as_f64() {
                Expr::value(f)
            } else {
                Expr::value(n.to_string())
            }
        }
        Value::String(s) => Expr::value(s.clone()),
        other => Expr::value(other.to_string()),
    }
}

fn where_expr(pred: &WherePredicate) -> SimpleExpr {
    let col = Expr::col(Alias::new(pred.column.clone()));
    let value = json_to_simple_expr(&pred.value);
    match pred.op {
        WhereOp::Eq => col.eq(value),
        WhereOp::Ne => col.ne(value),
        WhereOp::Gt => col.gt(value),
        WhereOp::Gte => col.gte(value),
        WhereOp::Lt => col.lt(value),
        WhereOp::Lte => col.lte(value),
    }
}

fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Issues base selects and resolves declared relations, each relation
/// batched into one `IN (...)` follow-up query across every distinct key
/// in the base rows, never queried per-row.
pub struct QueryOrchestrator {
    pool: Arc<DbPool>,
    optimizer: Arc<QueryOptimizer>,
    realtime: broadcast::Sender<MutationEvent>,
}

impl QueryOrchestrator {
    pub fn new(pool: Arc<DbPool>, optimizer: Arc<QueryOptimizer>) -> Self {
        let (realtime, _rx) = broadcast::channel(1024);
        Self {
            pool,
            optimizer,
            realtime,
        }
    }

    /// Subscribe to `insert`/`update`/`delete` events emitted by any
    /// query run through this orchestrator.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.realtime.subscribe()
    }

    fn emit_mutation(&self, table: &str, kind: MutationKind, payload: Value) {
        let _ = self.realtime.send(MutationEvent {
            table: table.to_string(),
            kind,
            payload,
        });
    }

    async fn run(
        &self,
        sql: &str,
        in_transaction: bool,
        preference: ReadPreference,
    ) -> QueryResult<Vec<Value>> {
        let start = Instant::now();
        let rows = self.pool.query(sql, in_transaction, preference).await?;
        let duration_ms = start.elapsed().as_millis() as u64;
        self.optimizer.record_execution(sql, duration_ms);
        Ok(rows)
    }

    /// One-shot select with no WHERE/ORDER/LIMIT and no eager loading.
    /// Equivalent to `table(name).columns(columns).execute()`.
    pub async fn select(&self, table: &str, columns: &[&str]) -> QueryResult<Vec<Value>> {
        self.table(table).columns(columns).execute().await
    }

    /// Start a stateful query against `table`.
    pub fn table(&self, table: &str) -> QueryBuilder<'_> {
        QueryBuilder {
            orchestrator: self,
            table: table.to_string(),
            columns: Vec::new(),
            wheres: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            relations: Vec::new(),
            preference: ReadPreference::Replica,
        }
    }

    /// Resolve one eager-loaded relation for a batch of base rows.
    ///
    /// Round trip 1 is whatever produced `base_rows` (the caller's base
    /// select). Round trip 2 here is a single `WHERE foreign_key IN
    /// (...)` query across every distinct key in `base_rows` — never one
    /// query per base row. `ManyToMany` relations need an additional hop
    /// through the join table first, so they cost three round trips
    /// total instead of two.
    pub async fn eager_load(
        &self,
        base_rows: &[Value],
        spec: &EagerLoadSpec,
    ) -> QueryResult<HashMap<String, Vec<Value>>> {
        match &spec.through {
            Some(through) => self.eager_load_many_to_many(base_rows, spec, through).await,
            None => self.eager_load_direct(base_rows, spec).await,
        }
    }

    async fn eager_load_direct(
        &self,
        base_rows: &[Value],
        spec: &EagerLoadSpec,
    ) -> QueryResult<HashMap<String, Vec<Value>>> {
        let keys = distinct_keys(base_rows, &spec.local_key);
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query = Query::select();
        query
            .from(Alias::new(spec.related_table.clone()))
            .column(Asterisk)
            .and_where(Expr::col(Alias::new(spec.foreign_key.clone())).is_in(keys));
        let sql = query.to_string(SqliteQueryBuilder);

        let related_rows = self.run(&sql, false, ReadPreference::Replica).await?;
        let grouped = group_by(related_rows, &spec.foreign_key);
        assert_belongs_to_cardinality(spec, &grouped)?;
        Ok(grouped)
    }

    /// `base rows --(through.local_key)--> through table --(through.foreign_key)--> related rows`.
    async fn eager_load_many_to_many(
        &self,
        base_rows: &[Value],
        spec: &EagerLoadSpec,
        through: &ThroughSpec,
    ) -> QueryResult<HashMap<String, Vec<Value>>> {
        let base_keys = distinct_keys(base_rows, &spec.local_key);
        if base_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut through_query = Query::select();
        through_query
            .from(Alias::new(through.table.clone()))
            .column(Asterisk)
            .and_where(Expr::col(Alias::new(through.local_key.clone())).is_in(base_keys));
        let through_sql = through_query.to_string(SqliteQueryBuilder);
        let through_rows = self.run(&through_sql, false, ReadPreference::Replica).await?;

        // base_key -> [related_key, ...]
        let mut base_to_related: HashMap<String, Vec<String>> = HashMap::new();
        let mut related_keys: Vec<String> = Vec::new();
        for row in &through_rows {
            let (Some(base_key), Some(related_key)) =
                (row.get(&through.local_key), row.get(&through.foreign_key))
            else {
                continue;
            };
            let related_key = value_as_key(related_key);
            base_to_related
                .entry(value_as_key(base_key))
                .or_default()
                .push(related_key.clone());
            related_keys.push(related_key);
        }
        related_keys.sort();
        related_keys.dedup();

        if related_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut related_query = Query::select();
        related_query
            .from(Alias::new(spec.related_table.clone()))
            .column(Asterisk)
            .and_where(Expr::col(Alias::new(spec.foreign_key.clone())).is_in(related_keys));
        let related_sql = related_query.to_string(SqliteQueryBuilder);
        let related_rows = self.run(&related_sql, false, ReadPreference::Replica).await?;
        let related_by_key = group_by(related_rows, &spec.foreign_key);

        let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
        for (base_key, related_keys) in base_to_related {
            let rows = related_keys
                .iter()
                .filter_map(|k| related_by_key.get(k))
                .flatten()
                .cloned()
                .collect();
            grouped.insert(base_key, rows);
        }
        Ok(grouped)
    }
}

fn distinct_keys(rows: &[Value], column: &str) -> Vec<String> {
    let mut keys: Vec<String> = rows
        .iter()
        .filter_map(|row| row.get(column))
        .map(value_as_key)
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

fn group_by(rows: Vec<Value>, column: &str) -> HashMap<String, Vec<Value>> {
    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
    for row in rows {
        let Some(key_value) = row.get(column) else {
            continue;
        };
        let key = value_as_key(key_value);
        grouped.entry(key).or_default().push(row);
    }
    grouped
}

fn assert_belongs_to_cardinality(
    spec: &EagerLoadSpec,
    grouped: &HashMap<String, Vec<Value>>,
) -> QueryResult<()> {
    if !matches!(spec.kind, RelationKind::BelongsTo | RelationKind::HasOne) {
        return Ok(());
    }
    for (key, rows) in grouped {
        if spec.kind == RelationKind::BelongsTo && rows.len() > 1 {
            return Err(QueryError::NonUniqueBelongsTo(key.clone()));
        }
    }
    Ok(())
}

/// Accumulates columns, WHERE predicates, ORDER BY, LIMIT/OFFSET, and an
/// ordered list of eager-load relations for one query against a table.
#[derive(Clone)]
pub struct QueryBuilder<'a> {
    orchestrator: &'a QueryOrchestrator,
    table: String,
    columns: Vec<String>,
    wheres: Vec<WherePredicate>,
    order_by: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
    relations: Vec<EagerLoadSpec>,
    preference: ReadPreference,
}

impl<'a> QueryBuilder<'a> {
    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    fn push_where(mut self, column: &str, op: WhereOp, value: impl Into<Value>) -> Self {
        self.wheres.push(WherePredicate {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_where(column, WhereOp::Eq, value)
    }

    pub fn where_ne(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_where(column, WhereOp::Ne, value)
    }

    pub fn where_gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_where(column, WhereOp::Gt, value)
    }

    pub fn where_gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_where(column, WhereOp::Gte, value)
    }

    pub fn where_lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_where(column, WhereOp::Lt, value)
    }

    pub fn where_lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_where(column, WhereOp::Lte, value)
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order_by.push((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_relation(mut self, spec: EagerLoadSpec) -> Self {
        self.relations.push(spec);
        self
    }

    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.preference = preference;
        self
    }

    fn where_column_names(&self) -> Vec<String> {
        self.wheres.iter().map(|w| w.column.clone()).collect()
    }

    fn render_select(&self) -> String {
        let mut query = Query::select();
        query.from(Alias::new(self.table.clone()));
        if self.columns.is_empty() {
            query.column(Asterisk);
        } else {
            for c in &self.columns {
                query.column(Alias::new(c.clone()));
            }
        }
        for pred in &self.wheres {
            query.and_where(where_expr(pred));
        }
        for (col, asc) in &self.order_by {
            query.order_by(Alias::new(col.clone()), if *asc { Order::Asc } else { Order::Desc });
        }
        if let Some(limit) = self.limit {
            query.limit(limit);
        }
        if let Some(offset) = self.offset {
            query.offset(offset);
        }
        query.to_string(SqliteQueryBuilder)
    }

    /// Render, run, record metrics, then resolve every accumulated
    /// relation and attach it under its `EagerLoadSpec::name`.
    pub async fn execute(&self) -> QueryResult<Vec<Value>> {
        let sql = self.render_select();
        self.orchestrator
            .optimizer
            .note_where_columns(&self.table, &self.where_column_names());
        let mut rows = self.orchestrator.run(&sql, false, self.preference).await?;

        for spec in &self.relations {
            let grouped = self.orchestrator.eager_load(&rows, spec).await?;
            for row in rows.iter_mut() {
                let Some(obj) = row.as_object_mut() else {
                    continue;
                };
                let attached = obj
                    .get(&spec.local_key)
                    .map(|v| grouped.get(&value_as_key(v)).cloned().unwrap_or_default())
                    .unwrap_or_default();
                let value = match spec.kind {
                    RelationKind::HasMany | RelationKind::ManyToMany => Value::Array(attached),
                    RelationKind::HasOne | RelationKind::BelongsTo => {
                        attached.into_iter().next().unwrap_or(Value::Null)
                    }
                };
                obj.insert(spec.name.clone(), value);
            }
        }
        Ok(rows)
    }

    /// `limit(1).execute()` then head-or-null.
    pub async fn first(&self) -> QueryResult<Option<Value>> {
        let mut builder = self.clone();
        builder.limit = Some(1);
        Ok(builder.execute().await?.into_iter().next())
    }

    /// Insert one or more rows, sharing the first row's column set.
    /// Appends the dialect's `RETURNING` fragment; since the underlying
    /// connection is simulated and always returns zero rows, the emitted
    /// realtime payload and the method's return value are the input rows
    /// themselves rather than a driver-confirmed echo.
    pub async fn insert(&self, rows: Vec<Value>) -> QueryResult<Vec<Value>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let columns: Vec<String> = rows[0]
            .as_object()
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();

        let mut query = Query::insert();
        query
            .into_table(Alias::new(self.table.clone()))
            .columns(columns.iter().map(|c| Alias::new(c.clone())));
        for row in &rows {
            let values: Vec<SimpleExpr> = columns
                .iter()
                .map(|c| json_to_simple_expr(row.get(c).unwrap_or(&Value::Null)))
                .collect();
            query.values_panic(values);
        }

        let sql = format!(
            "{}{}",
            query.to_string(SqliteQueryBuilder),
            self.orchestrator.pool.dialect().returning(&["*"])
        );
        self.orchestrator.run(&sql, false, ReadPreference::Primary).await?;

        for row in &rows {
            self.orchestrator
                .emit_mutation(&self.table, MutationKind::Insert, row.clone());
        }
        Ok(rows)
    }

    /// Update every row matching the builder's accumulated WHERE
    /// predicates with `partial`'s fields, emitting one `update` event
    /// carrying `partial` per the simulated driver's lack of a real
    /// affected-row echo.
    pub async fn update(&self, partial: Value) -> QueryResult<Value> {
        let obj = partial.as_object().cloned().unwrap_or_default();
        let mut query = Query::update();
        query.table(Alias::new(self.table.clone()));
        for (col, val) in &obj {
            query.value(Alias::new(col.clone()), json_to_simple_expr(val));
        }
        for pred in &self.wheres {
            query.and_where(where_expr(pred));
        }

        self.orchestrator
            .optimizer
            .note_where_columns(&self.table, &self.where_column_names());
        let sql = format!(
            "{}{}",
            query.to_string(SqliteQueryBuilder),
            self.orchestrator.pool.dialect().returning(&["*"])
        );
        self.orchestrator.run(&sql, false, ReadPreference::Primary).await?;

        self.orchestrator
            .emit_mutation(&self.table, MutationKind::Update, partial.clone());
        Ok(partial)
    }

    /// Delete every row matching the builder's accumulated WHERE
    /// predicates, emitting one `delete` event describing the predicates
    /// that were applied (the simulated driver returns no deleted rows
    /// to echo back).
    pub async fn delete(&self) -> QueryResult<()> {
        let mut query = Query::delete();
        query.from_table(Alias::new(self.table.clone()));
        for pred in &self.wheres {
            query.and_where(where_expr(pred));
        }
        self.orchestrator
            .optimizer
            .note_where_columns(&self.table, &self.where_column_names());
        let sql = query.to_string(SqliteQueryBuilder);
        self.orchestrator.run(&sql, false, ReadPreference::Primary).await?;

        let mut predicates = serde_json::Map::new();
        for pred in &self.wheres {
            predicates.insert(pred.column.clone(), pred.value.clone());
        }
        self.orchestrator.emit_mutation(
            &self.table,
            MutationKind::Delete,
            json!({ "where": Value::Object(predicates) }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::PostgresDialect;
    use crate::db::pool::PoolConfig;
    use serde_json::json;

    fn orchestrator() -> QueryOrchestrator {
        let pool = Arc::new(DbPool::new(PoolConfig::default(), 0, Arc::new(PostgresDialect)).unwrap());
        let optimizer = Arc::new(QueryOptimizer::new(Default::default()));
        QueryOrchestrator::new(pool, optimizer)
    }

    fn comments_relation() -> EagerLoadSpec {
        EagerLoadSpec {
            name: "comments".to_string(),
            kind: RelationKind::HasMany,
            related_table: "comments".to_string(),
            foreign_key: "post_id".to_string(),
            local_key: "id".to_string(),
            through: None,
        }
    }

    #[tokio::test]
    async fn eager_load_with_no_base_rows_skips_the_query() {
        let orchestrator = orchestrator();
        let result = orchestrator.eager_load(&[], &comments_relation()).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn value_as_key_normalizes_strings_and_numbers() {
        assert_eq!(value_as_key(&json!("abc")), "abc");
        assert_eq!(value_as_key(&json!(42)), "42");
    }

    #[tokio::test]
    async fn select_builder_renders_where_order_and_limit() {
        let orchestrator = orchestrator();
        let builder = orchestrator
            .table("users")
            .columns(&["id", "name"])
            .where_eq("active", true)
            .order_by("name", true)
            .limit(10)
            .offset(5);
        let sql = builder.render_select();
        assert!(sql.contains("SELECT"));
        assert!(sql.contains("WHERE"));
        assert!(sql.contains("ORDER BY"));
        assert!(sql.contains("LIMIT 10"));
        assert!(sql.contains("OFFSET 5"));
    }

    #[tokio::test]
    async fn insert_emits_one_realtime_event_per_row() {
        let orchestrator = orchestrator();
        let mut events = orchestrator.subscribe();

        let rows = vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})];
        let inserted = orchestrator.table("users").insert(rows.clone()).await.unwrap();
        assert_eq!(inserted, rows);

        let first = events.try_recv().unwrap();
        assert_eq!(first.table, "users");
        assert_eq!(first.kind, MutationKind::Insert);
        let second = events.try_recv().unwrap();
        assert_eq!(second.kind, MutationKind::Insert);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_emits_a_realtime_event_with_the_partial() {
        let orchestrator = orchestrator();
        let mut events = orchestrator.subscribe();

        let partial = json!({"name": "updated"});
        orchestrator
            .table("users")
            .where_eq("id", 1)
            .update(partial.clone())
            .await
            .unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, MutationKind::Update);
        assert_eq!(event.payload, partial);
    }

    #[tokio::test]
    async fn delete_emits_a_realtime_event_describing_the_predicate() {
        let orchestrator = orchestrator();
        let mut events = orchestrator.subscribe();

        orchestrator.table("users").where_eq("id", 1).delete().await.unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, MutationKind::Delete);
        assert_eq!(event.payload["where"]["id"], json!(1));
    }

    #[tokio::test]
    async fn first_returns_none_when_nothing_matches() {
        let orchestrator = orchestrator();
        let row = orchestrator.table("users").where_eq("id", 999).first().await.unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn many_to_many_eager_load_walks_the_through_table() {
        // The simulated connection always returns empty result sets, so
        // this exercises the through-table branch end to end and
        // confirms it resolves to an empty grouping rather than panicking
        // or issuing the wrong query shape.
        let orchestrator = orchestrator();
        let spec = EagerLoadSpec {
            name: "tags".to_string(),
            kind: RelationKind::ManyToMany,
            related_table: "tags".to_string(),
            foreign_key: "id".to_string(),
            local_key: "id".to_string(),
            through: Some(ThroughSpec {
                table: "post_tags".to_string(),
                local_key: "post_id".to_string(),
                foreign_key: "tag_id".to_string(),
            }),
        };
        let base_rows = vec![json!({"id": 1}), json!({"id": 2})];
        let grouped = orchestrator.eager_load(&base_rows, &spec).await.unwrap();
        assert!(grouped.is_empty());
    }
}
