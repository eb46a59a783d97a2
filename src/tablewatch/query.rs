//! Query construction and WHERE-clause validation
//!
//! The scan query is fixed at startup. Conditions supplied through
//! `sql-condition` must parse as a lone WHERE fragment and clear a coarse
//! reject-list; `raw-sql` bypasses both gates and is operator-trusted.

use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::warn;

use crate::error::{Error, Result};

/// Substrings rejected anywhere in a lowercased WHERE fragment. This is a
/// best-effort gate against statement smuggling, not a full SQL firewall.
const DISALLOWED_PATTERNS: &[&str] = &[
    ";",
    "--",
    "xp_",
    "/*",
    "*/",
    "truncate",
    "insert",
    "delete",
    "update",
    "drop",
    "create",
    "alter",
    "grant",
    "shutdown",
    "exec",
];

/// Validate a user-supplied WHERE fragment.
///
/// The fragment is parsed inside a probe statement; anything that does not
/// parse as a single SELECT (e.g. `'1' = '1'; TRUNCATE x;`) is rejected, as
/// is any fragment containing a disallowed pattern.
pub fn validate_where_clause(where_clause: &str) -> Result<()> {
    if where_clause.is_empty() {
        return Ok(());
    }

    let probe = format!("SELECT * FROM fake_table WHERE {where_clause}");
    if let Err(e) = Parser::parse_sql(&GenericDialect {}, &probe) {
        warn!(clause = %where_clause, "rejected unparsable WHERE clause");
        return Err(Error::invalid_where_clause(format!(
            "{where_clause}: {e}"
        )));
    }

    let normalized = where_clause.to_lowercase();
    for pattern in DISALLOWED_PATTERNS {
        if normalized.contains(pattern) {
            return Err(Error::invalid_where_clause(format!(
                "disallowed pattern in WHERE clause: {pattern}"
            )));
        }
    }

    Ok(())
}

/// Build the scan query executed on every tick.
///
/// A non-empty `raw_sql` replaces the built query entirely and is not
/// validated.
pub fn build_query(table_name: &str, sql_condition: &str, raw_sql: &str) -> Result<String> {
    if !raw_sql.is_empty() {
        return Ok(raw_sql.to_string());
    }

    if table_name.is_empty() {
        return Err(Error::config("table name is missing"));
    }

    validate_where_clause(sql_condition)?;

    if sql_condition.is_empty() {
        Ok(format!("SELECT * FROM {table_name}"))
    } else {
        Ok(format!("SELECT * FROM {table_name} WHERE {sql_condition}"))
    }
}
