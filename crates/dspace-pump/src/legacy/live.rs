use super::{LegacyDb, LegacyTable, RecordSource, SourceRecord};
use crate::error::Result;
use crate::relational::{quote_ident, RelationalSource};
use async_trait::async_trait;
use tracing::debug;

/// Reads legacy tables straight from the two legacy databases.
pub struct LiveRecords {
    dspace: RelationalSource,
    utilities: RelationalSource,
}

impl LiveRecords {
    pub fn new(dspace: RelationalSource, utilities: RelationalSource) -> Self {
        Self { dspace, utilities }
    }

    pub fn source_for(&mut self, db: LegacyDb) -> &mut RelationalSource {
        match db {
            LegacyDb::Dspace => &mut self.dspace,
            LegacyDb::Utilities => &mut self.utilities,
        }
    }
}

#[async_trait]
impl RecordSource for LiveRecords {
    async fn load(&mut self, table: &LegacyTable) -> Result<Vec<SourceRecord>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(table.name),
            quote_ident(table.id_column)
        );
        let rows = self.source_for(table.db).fetch_all(&sql).await?;
        debug!("{}: read {} rows", table.name, rows.len());
        rows.to_json_objects()
            .into_iter()
            .map(|attrs| SourceRecord::from_object(table, attrs))
            .collect()
    }

    fn describe(&self) -> String {
        format!("live ({}, {})", self.dspace.name(), self.utilities.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqlRetryPolicy;
    use crate::relational::testing::{FakeConnector, FakeDb};
    use crate::relational::{RowSet, SqlValue};
    use std::sync::Arc;

    fn source(name: &str, db: &Arc<FakeDb>) -> RelationalSource {
        RelationalSource::new(
            name,
            Box::new(FakeConnector::new(Arc::clone(db))),
            SqlRetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_tables_are_read_from_their_database() {
        let dspace = FakeDb::new();
        dspace.respond(
            "from \"item\"",
            RowSet {
                columns: vec!["item_id".into(), "withdrawn".into()],
                rows: vec![
                    vec![SqlValue::I32(1), SqlValue::Bool(false)],
                    vec![SqlValue::I32(2), SqlValue::Bool(true)],
                ],
            },
        );
        let utilities = FakeDb::new();
        utilities.respond(
            "from \"license_label\"",
            RowSet {
                columns: vec!["label_id".into(), "label".into()],
                rows: vec![vec![SqlValue::I32(9), SqlValue::String("PUB".into())]],
            },
        );

        let mut live = LiveRecords::new(source("dspace5", &dspace), source("utilities5", &utilities));
        let items = live.load(LegacyTable::lookup("item").unwrap()).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[1].flag("withdrawn"));

        let labels = live
            .load(LegacyTable::lookup("license_label").unwrap())
            .await
            .unwrap();
        assert_eq!(labels[0].legacy_id, 9);
        assert_eq!(labels[0].str("label"), Some("PUB"));
    }
}
