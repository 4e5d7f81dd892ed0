//! SQL dialect adapter (C8): the handful of syntax differences a query
//! orchestrator needs to stay portable across backends.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub json: bool,
    pub streaming: bool,
    pub realtime: bool,
    pub transactional: bool,
}

/// Per-backend syntax hooks the query orchestrator composes SQL through,
/// rather than hard-coding one backend's placeholder/quoting/pagination
/// syntax.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Render the placeholder for the `index`-th (1-based) bound
    /// parameter.
    fn param_placeholder(&self, index: usize) -> String;

    fn quote_identifier(&self, ident: &str) -> String;

    /// Render a `LIMIT`/`OFFSET` clause fragment.
    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String;

    /// Render a `RETURNING` clause fragment for the given columns, or an
    /// empty string for backends without the feature.
    fn returning(&self, columns: &[&str]) -> String;

    fn capabilities(&self) -> Capabilities;
}

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        render_limit_offset(limit, offset)
    }

    fn returning(&self, columns: &[&str]) -> String {
        if columns.is_empty() {
            String::new()
        } else {
            format!(" RETURNING {}", columns.join(", "))
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            json: true,
            streaming: true,
            realtime: true,
            transactional: true,
        }
    }
}

pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        render_limit_offset(limit, offset)
    }

    fn returning(&self, columns: &[&str]) -> String {
        if columns.is_empty() {
            String::new()
        } else {
            format!(" RETURNING {}", columns.join(", "))
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            json: true,
            streaming: false,
            realtime: false,
            transactional: true,
        }
    }
}

pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        render_limit_offset(limit, offset)
    }

    fn returning(&self, _columns: &[&str]) -> String {
        // MySQL has no RETURNING clause; the caller issues a follow-up
        // SELECT when it needs the written row back.
        String::new()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            json: true,
            streaming: true,
            realtime: false,
            transactional: true,
        }
    }
}

fn render_limit_offset(limit: Option<u64>, offset: Option<u64>) -> String {
    let mut clause = String::new();
    if let Some(limit) = limit {
        clause.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = offset {
        clause.push_str(&format!(" OFFSET {}", offset));
    }
    clause
}

/// First-keyword check used to route statements to the primary: any
/// statement whose first token is a mutating verb must go to the writer.
pub fn is_write_statement(sql: &str) -> bool {
    const WRITE_KEYWORDS: &[&str] = &[
        "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "TRUNCATE", "REPLACE",
    ];
    let first_word = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    WRITE_KEYWORDS.contains(&first_word.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_placeholders_are_positional() {
        let d = PostgresDialect;
        assert_eq!(d.param_placeholder(1), "$1");
        assert_eq!(d.param_placeholder(2), "$2");
    }

    #[test]
    fn sqlite_and_mysql_placeholders_are_bare_marks() {
        assert_eq!(SqliteDialect.param_placeholder(3), "?");
        assert_eq!(MySqlDialect.param_placeholder(3), "?");
    }

    #[test]
    fn mysql_returning_is_empty() {
        assert_eq!(MySqlDialect.returning(&["id"]), "");
    }

    #[test]
    fn postgres_returning_lists_columns() {
        assert_eq!(PostgresDialect.returning(&["id", "name"]), " RETURNING id, name");
    }

    #[test]
    fn write_statements_are_detected_by_first_keyword() {
        assert!(is_write_statement("  insert into t values (1)"));
        assert!(is_write_statement("UPDATE t SET x = 1"));
        assert!(!is_write_statement("SELECT * FROM t"));
        assert!(!is_write_statement("WITH cte AS (SELECT 1) SELECT * FROM cte"));
    }
}
