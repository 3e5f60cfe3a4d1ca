//! In-memory [`Connector`] for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Connector, RowSet, SqlConnection, SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};

/// A single-table database plus canned answers for arbitrary queries.
#[derive(Default)]
pub(crate) struct FakeDb {
    ids: Mutex<Vec<i64>>,
    canned: Mutex<Vec<(String, RowSet)>>,
    executes: Mutex<Vec<(String, Vec<SqlValue>)>>,
    queries: Mutex<Vec<(String, Vec<SqlValue>)>>,
    failures: Mutex<(usize, String)>,
    short_delete: AtomicU64,
    connects: AtomicUsize,
    windowed: AtomicUsize,
    counts: AtomicUsize,
}

impl FakeDb {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Table `synthetic` with ids `1..=n` and a `name` column.
    pub(crate) fn with_synthetic_rows(n: i64) -> Arc<Self> {
        let db = Self::default();
        *db.ids.lock().unwrap() = (1..=n).collect();
        Arc::new(db)
    }

    /// Answer any query containing `needle` (case-insensitive) with `rows`.
    pub(crate) fn respond(&self, needle: &str, rows: RowSet) {
        self.canned
            .lock()
            .unwrap()
            .push((needle.to_ascii_lowercase(), rows));
    }

    /// Fail the next `n` statements with `message`.
    pub(crate) fn fail_next(&self, n: usize, message: &str) {
        *self.failures.lock().unwrap() = (n, message.to_string());
    }

    /// Make DELETE report `n` fewer rows than it removed.
    pub(crate) fn short_delete(&self, n: u64) {
        self.short_delete.store(n, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn windowed_reads(&self) -> usize {
        self.windowed.load(Ordering::SeqCst)
    }

    pub(crate) fn count_queries(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    pub(crate) fn executes(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.executes.lock().unwrap().clone()
    }

    /// Queries that carried bound parameters.
    pub(crate) fn bound_queries(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.queries.lock().unwrap().clone()
    }

    pub(crate) fn last_execute(&self) -> Option<(String, Vec<SqlValue>)> {
        self.executes.lock().unwrap().last().cloned()
    }

    fn take_failure(&self) -> Option<String> {
        let mut failures = self.failures.lock().unwrap();
        if failures.0 == 0 {
            return None;
        }
        failures.0 -= 1;
        Some(failures.1.clone())
    }

    fn answer(&self, sql: &str) -> RowSet {
        let lower = sql.to_ascii_lowercase();

        if lower.trim() == "select 1" {
            return scalar(SqlValue::I32(1));
        }

        if let Some((needle, rows)) = self
            .canned
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| lower.contains(needle.as_str()))
        {
            // Row counts of canned reads are derived unless the count itself is canned.
            if lower.contains("count(*)") && !needle.contains("count(") {
                self.counts.fetch_add(1, Ordering::SeqCst);
                return scalar(SqlValue::I64(rows.rows.len() as i64));
            }
            return rows.clone();
        }

        let ids = self.ids.lock().unwrap();
        if lower.contains("count(*)") {
            self.counts.fetch_add(1, Ordering::SeqCst);
            return scalar(SqlValue::I64(ids.len() as i64));
        }
        if lower.contains("max(") {
            return scalar(
                ids.iter()
                    .max()
                    .map(|m| SqlValue::I64(*m))
                    .unwrap_or(SqlValue::Null(SqlNullType::I64)),
            );
        }

        let (limit, offset) = window(&lower);
        if limit.is_some() {
            self.windowed.fetch_add(1, Ordering::SeqCst);
        }
        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(usize::MAX);
        RowSet {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: ids
                .iter()
                .skip(offset)
                .take(limit)
                .map(|id| vec![SqlValue::I64(*id), SqlValue::String(format!("row-{}", id))])
                .collect(),
        }
    }
}

fn scalar(value: SqlValue) -> RowSet {
    RowSet {
        columns: vec!["?column?".to_string()],
        rows: vec![vec![value]],
    }
}

fn window(lower: &str) -> (Option<usize>, Option<usize>) {
    let tokens: Vec<&str> = lower.split_whitespace().collect();
    let after = |word: &str| {
        tokens
            .iter()
            .position(|t| *t == word)
            .and_then(|i| tokens.get(i + 1))
            .and_then(|v| v.parse().ok())
    };
    (after("limit"), after("offset"))
}

pub(crate) struct FakeConnector {
    db: Arc<FakeDb>,
}

impl FakeConnector {
    pub(crate) fn new(db: Arc<FakeDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        self.db.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            db: Arc::clone(&self.db),
        }))
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FakeConnection {
    db: Arc<FakeDb>,
}

#[async_trait]
impl SqlConnection for FakeConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet> {
        if let Some(message) = self.db.take_failure() {
            return Err(MigrateError::connection(message, "fake"));
        }
        if !params.is_empty() {
            self.db
                .queries
                .lock()
                .unwrap()
                .push((sql.to_string(), params.to_vec()));
        }
        Ok(self.db.answer(sql))
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        if let Some(message) = self.db.take_failure() {
            return Err(MigrateError::connection(message, "fake"));
        }
        self.db
            .executes
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        if sql.to_ascii_lowercase().starts_with("delete from") {
            let mut ids = self.db.ids.lock().unwrap();
            let removed = ids.len() as u64;
            ids.clear();
            return Ok(removed.saturating_sub(self.db.short_delete.load(Ordering::SeqCst)));
        }
        Ok(1)
    }

    async fn batch(&mut self, sql: &str) -> Result<()> {
        self.db
            .executes
            .lock()
            .unwrap()
            .push((sql.to_string(), Vec::new()));
        Ok(())
    }
}
