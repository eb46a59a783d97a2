//! Periodic table scanning
//!
//! A [`TableWatch`] executes one fixed query every check interval and
//! pushes each result row downstream as a map of column name to
//! stringified cell. The output channel is bounded, so a slow consumer
//! backpressures the scan between rows. Scan errors abandon the current
//! scan; the next tick retries.

pub mod connection;
pub mod credentials;
pub mod query;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use sqlx::postgres::{PgColumn, PgRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use connection::DbConn;

/// One scanned row: column name to stringified cell value. NULL cells
/// render as the empty string and are indistinguishable from it.
pub type Row = HashMap<String, String>;

/// Periodic scanner over one fixed SQL query.
pub struct TableWatch {
    sql_query: String,
    conn: Arc<DbConn>,
}

impl TableWatch {
    /// Build the scan query, open and verify the database connection, and
    /// spawn the credential rotation watcher.
    pub async fn new(config: &Config) -> Result<Self> {
        let sql_query =
            query::build_query(&config.table_name, &config.sql_condition, &config.raw_sql)?;

        let conn = DbConn::open(config.database.clone()).await?;
        tokio::spawn(Arc::clone(&conn).watch_credentials());

        Ok(Self { sql_query, conn })
    }

    /// Scan forever. Returns only when the receiving side shuts down.
    pub async fn watch(self, check_interval: Duration, output: mpsc::Sender<Row>) {
        info!(query = %self.sql_query, "starting table watch");

        loop {
            match self.scan(&output).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => error!(error = %e, "periodic check failed"),
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// One scan of the table. `Ok(false)` means the output channel closed.
    async fn scan(&self, output: &mpsc::Sender<Row>) -> Result<bool> {
        debug!("scanning database table");

        let pool = self.conn.pool().await;
        let mut rows = sqlx::query(&self.sql_query).fetch(&pool);

        while let Some(row) = rows.try_next().await? {
            if output.send(row_to_map(&row)).await.is_err() {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn row_to_map(row: &PgRow) -> Row {
    let mut map = Row::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), render_cell(row, index, column));
    }
    map
}

/// Render one cell to a string by its Postgres type. Undecodable or
/// unsupported cells render empty rather than failing the row.
fn render_cell(row: &PgRow, index: usize, column: &PgColumn) -> String {
    let raw = match row.try_get_raw(index) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(column = column.name(), error = %e, "unable to read cell");
            return String::new();
        }
    };

    if raw.is_null() {
        return String::new();
    }

    let rendered = match column.type_info().name() {
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => row.try_get::<String, _>(index),
        "INT2" => row.try_get::<i16, _>(index).map(|v| v.to_string()),
        "INT4" => row.try_get::<i32, _>(index).map(|v| v.to_string()),
        "INT8" => row.try_get::<i64, _>(index).map(|v| v.to_string()),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| v.to_string()),
        "FLOAT8" => row.try_get::<f64, _>(index).map(|v| v.to_string()),
        "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(index)
            .map(|v| v.to_string()),
        "BOOL" => row.try_get::<bool, _>(index).map(|v| v.to_string()),
        "UUID" => row.try_get::<uuid::Uuid, _>(index).map(|v| v.to_string()),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|v| v.to_rfc3339()),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|v| v.to_string()),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|v| v.to_string()),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(index)
            .map(|v| v.to_string()),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(index)
            .map(|v| v.to_string()),
        other => {
            warn!(
                column = column.name(),
                column_type = other,
                "unsupported column type, rendering empty"
            );
            return String::new();
        }
    };

    match rendered {
        Ok(value) => value,
        Err(e) => {
            warn!(column = column.name(), error = %e, "unable to decode cell");
            String::new()
        }
    }
}
