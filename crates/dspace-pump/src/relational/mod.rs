//! Resilient access to a relational store.
//!
//! A [`RelationalSource`] owns exactly one connection. Before every
//! operation the connection is checked with `SELECT 1` and re-established if
//! it is gone; the whole operation is retried with capped exponential
//! backoff. Large reads are split into LIMIT/OFFSET windows.

mod postgres;
mod query;
mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use postgres::PgConnector;
pub use query::{
    count_query, has_order_clause, has_window_clause, is_identifier, quote_ident, windowed,
};
pub use value::{RowSet, SqlNullType, SqlValue};

use crate::config::SqlRetryPolicy;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// A single live database session.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet>;

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run one or more statements without parameters.
    async fn batch(&mut self, sql: &str) -> Result<()>;
}

/// Opens new sessions for a [`RelationalSource`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>>;

    /// Name used in logs.
    fn describe(&self) -> String;
}

/// One database operation, retried as a unit.
enum SqlOp<'a> {
    Query(&'a str, &'a [SqlValue]),
    Execute(&'a str, &'a [SqlValue]),
    Batch(&'a str),
}

enum SqlReply {
    Rows(RowSet),
    Affected(u64),
    Done,
}

/// True when an error message indicates a broken session.
pub fn is_connection_error(err: &MigrateError) -> bool {
    if let MigrateError::Database(e) = err {
        if e.is_closed() {
            return true;
        }
    }
    if matches!(err, MigrateError::Connection { .. }) {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    [
        "connection",
        "closed",
        "terminat",
        "abort",
        "broken pipe",
        "reset by peer",
        "timed out",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

/// Resilient SQL wrapper around one owned connection.
pub struct RelationalSource {
    name: String,
    connector: Box<dyn Connector>,
    conn: Option<Box<dyn SqlConnection>>,
    policy: SqlRetryPolicy,
}

impl RelationalSource {
    /// Create a source; the connection is opened on first use.
    pub fn new(name: impl Into<String>, connector: Box<dyn Connector>, policy: SqlRetryPolicy) -> Self {
        Self {
            name: name.into(),
            connector,
            conn: None,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return a live connection, probing the current one and reconnecting
    /// if the check fails.
    async fn live_connection(&mut self) -> Result<&mut Box<dyn SqlConnection>> {
        let alive = match self.conn.as_mut() {
            Some(conn) => match conn.query("SELECT 1", &[]).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("{}: liveness check failed, reconnecting: {}", self.name, e);
                    false
                }
            },
            None => false,
        };

        if !alive {
            self.conn = None;
            debug!("{}: connecting to {}", self.name, self.connector.describe());
            let conn = self.connector.connect().await?;
            self.conn = Some(conn);
        }

        self.conn
            .as_mut()
            .ok_or_else(|| MigrateError::connection("no connection", self.name.clone()))
    }

    async fn run(&mut self, op: SqlOp<'_>) -> Result<SqlReply> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = match self.live_connection().await {
                Ok(conn) => match &op {
                    SqlOp::Query(sql, params) => conn.query(sql, params).await.map(SqlReply::Rows),
                    SqlOp::Execute(sql, params) => {
                        conn.execute(sql, params).await.map(SqlReply::Affected)
                    }
                    SqlOp::Batch(sql) => conn.batch(sql).await.map(|_| SqlReply::Done),
                },
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= max_attempts {
                error!(
                    "{}: giving up after {} attempt(s): {}",
                    self.name, attempt, err
                );
                return Err(err);
            }
            if is_connection_error(&err) {
                self.conn = None;
            }
            let delay = self.policy.backoff(attempt - 1);
            warn!(
                "{}: {}, retry {}/{} in {:?}",
                self.name,
                err,
                attempt,
                max_attempts - 1,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn query_once(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet> {
        match self.run(SqlOp::Query(sql, params)).await? {
            SqlReply::Rows(rows) => Ok(rows),
            _ => Ok(RowSet::default()),
        }
    }

    /// Read every row of `sql`, windowing large results.
    pub async fn fetch_all(&mut self, sql: &str) -> Result<RowSet> {
        if has_window_clause(sql) {
            return self.query_once(sql, &[]).await;
        }

        let total = match self.fetch_one(&count_query(sql)).await {
            Ok(Some(value)) => value.as_i64().unwrap_or(0).max(0) as u64,
            Ok(None) => 0,
            Err(e) => {
                warn!("{}: row count failed, reading unchunked: {}", self.name, e);
                return self.query_once(sql, &[]).await;
            }
        };

        if total <= self.policy.chunk_threshold {
            return self.query_once(sql, &[]).await;
        }
        if !has_order_clause(sql) {
            warn!(
                "{}: {} rows without ORDER BY, reading unchunked",
                self.name, total
            );
            return self.query_once(sql, &[]).await;
        }

        let chunk = self.policy.chunk_size.max(1);
        info!(
            "{}: reading {} rows in windows of {}",
            self.name, total, chunk
        );
        let mut result = RowSet::default();
        let mut offset = 0;
        while offset < total {
            if offset > 0 {
                tokio::time::sleep(self.policy.chunk_delay()).await;
            }
            let window = self.query_once(&windowed(sql, chunk, offset), &[]).await?;
            if result.columns.is_empty() {
                result.columns = window.columns;
            }
            let got = window.rows.len() as u64;
            result.rows.extend(window.rows);
            if got < chunk {
                break;
            }
            offset += chunk;
        }
        Ok(result)
    }

    /// First column of the first row, if any.
    pub async fn fetch_one(&mut self, sql: &str) -> Result<Option<SqlValue>> {
        self.fetch_one_params(sql, &[]).await
    }

    pub async fn fetch_one_params(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<SqlValue>> {
        let rows = self.query_once(sql, params).await?;
        Ok(rows.scalar().filter(|v| !v.is_null()).cloned())
    }

    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet> {
        self.query_once(sql, params).await
    }

    /// Execute a statement with bound parameters; returns affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self.run(SqlOp::Execute(sql, params)).await? {
            SqlReply::Affected(n) => Ok(n),
            _ => Ok(0),
        }
    }

    pub async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.run(SqlOp::Batch(sql)).await.map(|_| ())
    }

    /// Highest value of `column` in `table`, or 0 for an empty table.
    pub async fn get_last_id(&mut self, table: &str, column: &str) -> Result<i64> {
        if !is_identifier(table) || !is_identifier(column) {
            return Err(MigrateError::Config(format!(
                "invalid identifier {}.{}",
                table, column
            )));
        }
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            quote_ident(column),
            quote_ident(table)
        );
        Ok(self
            .fetch_one(&sql)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    /// Advance a sequence to `value`.
    pub async fn set_sequence(&mut self, sequence: &str, value: i64) -> Result<()> {
        self.query_once(
            "SELECT setval($1::text::regclass, $2::bigint)",
            &[SqlValue::String(sequence.to_string()), SqlValue::I64(value)],
        )
        .await
        .map(|_| ())
    }

    /// UUID of the eperson with the given email.
    pub async fn admin_uuid(&mut self, email: &str) -> Result<Option<uuid::Uuid>> {
        let value = self
            .fetch_one_params(
                "SELECT uuid FROM eperson WHERE email = $1",
                &[SqlValue::String(email.to_string())],
            )
            .await?;
        Ok(match value {
            Some(SqlValue::Uuid(u)) => Some(u),
            Some(other) => other.as_text().and_then(|s| uuid::Uuid::parse_str(&s).ok()),
            None => None,
        })
    }

    /// Row count of every table in the public schema.
    pub async fn table_counts(&mut self) -> Result<BTreeMap<String, i64>> {
        let tables = self
            .query_once(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
                &[],
            )
            .await?;
        let mut counts = BTreeMap::new();
        for row in tables.rows {
            let Some(table) = row.first().and_then(SqlValue::as_text) else {
                continue;
            };
            let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table));
            let count = self.fetch_one(&sql).await?.and_then(|v| v.as_i64()).unwrap_or(0);
            counts.insert(table, count);
        }
        Ok(counts)
    }

    /// Delete every row of `table` and check that exactly the counted rows went.
    pub async fn delete_all_verified(&mut self, table: &str) -> Result<u64> {
        if !is_identifier(table) {
            return Err(MigrateError::Config(format!("invalid table name {}", table)));
        }
        let quoted = quote_ident(table);
        let expected = self
            .fetch_one(&format!("SELECT COUNT(*) FROM {}", quoted))
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u64;
        let deleted = self.execute(&format!("DELETE FROM {}", quoted), &[]).await?;
        if deleted != expected {
            error!(
                "CRITICAL {}: expected to delete {} rows from {}, deleted {}",
                self.name, expected, table, deleted
            );
            return Err(MigrateError::Invariant(format!(
                "{}: deleted {} of {} rows from {}",
                self.name, deleted, expected, table
            )));
        }
        info!("{}: deleted {} rows from {}", self.name, deleted, table);
        Ok(deleted)
    }
}
