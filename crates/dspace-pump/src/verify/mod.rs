//! Cross-database consistency report.
//!
//! Compares row counts of the legacy store and the destination store for the
//! tables a migration fills, then diffs the natural keys of the tables that
//! have one. A mismatch is reported, never fatal: some destination tables
//! legitimately hold extra rows (default groups, the administrator account).

use crate::error::Result;
use crate::relational::{quote_ident, RelationalSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Tables compared by [`verify`].
pub const VERIFIED_TABLES: [&str; 10] = [
    "community",
    "collection",
    "item",
    "bundle",
    "bitstream",
    "eperson",
    "epersongroup",
    "handle",
    "resourcepolicy",
    "versionitem",
];

/// Tables with a natural key shared by both schemas, and that key.
pub const KEYED_TABLES: [(&str, &str); 3] = [
    ("eperson", "email"),
    ("epersongroup", "name"),
    ("handle", "handle"),
];

/// Keys listed per side in a [`TableDiff`].
pub const DIFF_SAMPLE: usize = 5;

/// Row counts of one table on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCheck {
    pub table: String,
    pub legacy: i64,
    pub destination: i64,
}

impl TableCheck {
    pub fn matches(&self) -> bool {
        self.legacy == self.destination
    }
}

/// Natural keys present on only one side of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDiff {
    pub table: String,
    pub column: String,
    pub only_legacy: u64,
    pub only_destination: u64,
    /// First keys found only in the legacy table, emails masked.
    pub legacy_sample: Vec<String>,
    /// First keys found only in the destination table, emails masked.
    pub destination_sample: Vec<String>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.only_legacy == 0 && self.only_destination == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub tables: Vec<TableCheck>,
    #[serde(default)]
    pub diffs: Vec<TableDiff>,
}

impl ConsistencyReport {
    pub fn mismatches(&self) -> impl Iterator<Item = &TableCheck> {
        self.tables.iter().filter(|t| !t.matches())
    }

    pub fn divergent(&self) -> impl Iterator<Item = &TableDiff> {
        self.diffs.iter().filter(|d| !d.is_empty())
    }

    pub fn is_consistent(&self) -> bool {
        self.mismatches().next().is_none() && self.divergent().next().is_none()
    }
}

/// `alice@example.org` becomes `a***@example.org`.
pub fn mask_email(value: &str) -> String {
    match value.split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{}***@{}", first, domain)
        }
        None => value.to_string(),
    }
}

async fn row_count(db: &mut RelationalSource, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    Ok(db.fetch_one(&sql).await?.and_then(|v| v.as_i64()).unwrap_or(0))
}

async fn keys(db: &mut RelationalSource, table: &str, column: &str) -> Result<BTreeSet<String>> {
    let sql = format!(
        "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL ORDER BY {col}",
        col = quote_ident(column),
        table = quote_ident(table)
    );
    let rows = db.fetch_all(&sql).await?;
    Ok(rows
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(|v| v.as_text()))
        .map(|key| key.trim().to_lowercase())
        .collect())
}

/// Compare the `column` values of `table` on both sides.
pub async fn diff_table(
    legacy: &mut RelationalSource,
    destination: &mut RelationalSource,
    table: &str,
    column: &str,
) -> Result<TableDiff> {
    let old = keys(legacy, table, column).await?;
    let new = keys(destination, table, column).await?;
    let render = |key: &String| {
        if column == "email" {
            mask_email(key)
        } else {
            key.clone()
        }
    };
    let diff = TableDiff {
        table: table.to_string(),
        column: column.to_string(),
        only_legacy: old.difference(&new).count() as u64,
        only_destination: new.difference(&old).count() as u64,
        legacy_sample: old.difference(&new).take(DIFF_SAMPLE).map(render).collect(),
        destination_sample: new.difference(&old).take(DIFF_SAMPLE).map(render).collect(),
    };
    if !diff.is_empty() {
        warn!(
            "{}.{}: {} only in legacy {:?}, {} only in destination {:?}",
            table,
            column,
            diff.only_legacy,
            diff.legacy_sample,
            diff.only_destination,
            diff.destination_sample
        );
    }
    Ok(diff)
}

/// Count every table of [`VERIFIED_TABLES`] in both stores, then diff the
/// keys of [`KEYED_TABLES`].
pub async fn verify(
    legacy: &mut RelationalSource,
    destination: &mut RelationalSource,
) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();
    for table in VERIFIED_TABLES {
        let check = TableCheck {
            table: table.to_string(),
            legacy: row_count(legacy, table).await?,
            destination: row_count(destination, table).await?,
        };
        if check.matches() {
            info!("{}: {} rows (match)", table, check.legacy);
        } else {
            warn!(
                "{}: legacy={} destination={} (MISMATCH)",
                table, check.legacy, check.destination
            );
        }
        report.tables.push(check);
    }
    for (table, column) in KEYED_TABLES {
        report
            .diffs
            .push(diff_table(legacy, destination, table, column).await?);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqlRetryPolicy;
    use crate::relational::testing::{FakeConnector, FakeDb};
    use crate::relational::{RowSet, SqlValue};
    use std::sync::Arc;

    fn source(db: &Arc<FakeDb>) -> RelationalSource {
        RelationalSource::new(
            "fake",
            Box::new(FakeConnector::new(Arc::clone(db))),
            SqlRetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_mismatched_tables_are_reported() {
        let legacy = FakeDb::with_synthetic_rows(3);
        let destination = FakeDb::with_synthetic_rows(3);
        destination.respond(
            "\"item\"",
            RowSet {
                columns: vec!["id".to_string()],
                rows: vec![vec![SqlValue::I64(1)], vec![SqlValue::I64(2)]],
            },
        );

        let report = verify(&mut source(&legacy), &mut source(&destination))
            .await
            .unwrap();

        assert_eq!(report.tables.len(), VERIFIED_TABLES.len());
        let mismatched: Vec<&TableCheck> = report.mismatches().collect();
        assert_eq!(
            mismatched,
            vec![&TableCheck {
                table: "item".to_string(),
                legacy: 3,
                destination: 2,
            }]
        );
        assert!(!report.is_consistent());
        assert_eq!(report.diffs.len(), KEYED_TABLES.len());
        assert_eq!(report.divergent().count(), 0);
    }

    fn emails(values: &[&str]) -> RowSet {
        RowSet {
            columns: vec!["email".to_string()],
            rows: values
                .iter()
                .map(|v| vec![SqlValue::String(v.to_string())])
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_key_diff_samples_both_sides_with_masked_emails() {
        let legacy = FakeDb::new();
        let mut old: Vec<String> = (0..8).map(|n| format!("user{}@example.org", n)).collect();
        old.push("Shared@Example.org".to_string());
        let old: Vec<&str> = old.iter().map(String::as_str).collect();
        legacy.respond("\"email\"", emails(&old));
        let destination = FakeDb::new();
        destination.respond(
            "\"email\"",
            emails(&["shared@example.org", "admin@example.org"]),
        );

        let diff = diff_table(
            &mut source(&legacy),
            &mut source(&destination),
            "eperson",
            "email",
        )
        .await
        .unwrap();

        assert_eq!(diff.only_legacy, 8);
        assert_eq!(diff.only_destination, 1);
        assert_eq!(diff.legacy_sample.len(), DIFF_SAMPLE);
        assert_eq!(diff.legacy_sample[0], "u***@example.org");
        assert_eq!(diff.destination_sample, vec!["a***@example.org"]);
        assert!(!diff.is_empty());
    }

    #[tokio::test]
    async fn test_non_email_keys_are_not_masked() {
        let legacy = FakeDb::new();
        legacy.respond("\"handle\"", emails(&["11234/1-1", "11234/1-2"]));
        let destination = FakeDb::new();
        destination.respond("\"handle\"", emails(&["11234/1-1"]));

        let diff = diff_table(
            &mut source(&legacy),
            &mut source(&destination),
            "handle",
            "handle",
        )
        .await
        .unwrap();

        assert_eq!(diff.legacy_sample, vec!["11234/1-2"]);
        assert!(diff.destination_sample.is_empty());
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("alice@example.org"), "a***@example.org");
        assert_eq!(mask_email("@example.org"), "***@example.org");
        assert_eq!(mask_email("not an email"), "not an email");
    }
}
