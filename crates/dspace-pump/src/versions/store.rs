use crate::error::{MigrateError, Result};
use crate::identity::Handle;
use crate::relational::{RelationalSource, SqlNullType, SqlValue};
use async_trait::async_trait;
use std::collections::BTreeSet;
use uuid::Uuid;

/// A metadata field named `schema.element[.qualifier]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateField {
    pub schema: String,
    pub element: String,
    pub qualifier: Option<String>,
}

impl DateField {
    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        match parts.as_slice() {
            [schema, element] if !schema.is_empty() && !element.is_empty() => Ok(Self {
                schema: schema.to_string(),
                element: element.to_string(),
                qualifier: None,
            }),
            [schema, element, qualifier]
                if !schema.is_empty() && !element.is_empty() && !qualifier.is_empty() =>
            {
                Ok(Self {
                    schema: schema.to_string(),
                    element: element.to_string(),
                    qualifier: Some(qualifier.to_string()),
                })
            }
            _ => Err(MigrateError::Config(format!(
                "version date field '{}' is not schema.element[.qualifier]",
                name
            ))),
        }
    }
}

/// One `versionitem` row.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRow {
    pub history_id: i64,
    /// 1-based position in the chain, oldest first.
    pub version_number: i64,
    /// `YYYY-MM-DD`.
    pub date: String,
    pub item: Handle,
}

/// Destination tables holding version histories.
#[async_trait]
pub trait VersionStore: Send {
    /// Item uuids that already have a `versionitem` row.
    async fn versioned_items(&mut self) -> Result<BTreeSet<String>>;

    /// First non-empty value of `field` on the destination item.
    async fn version_date(&mut self, item: &Handle, field: &DateField) -> Result<Option<String>>;

    /// History the item's existing `versionitem` row belongs to.
    async fn history_of(&mut self, item: &Handle) -> Result<Option<i64>>;

    /// Insert a new `versionhistory` row and return its id.
    async fn allocate_history(&mut self) -> Result<i64>;

    async fn insert_version(&mut self, row: &VersionRow) -> Result<()>;
}

/// [`VersionStore`] writing straight into the destination database.
pub struct PgVersionStore<'a> {
    db: &'a mut RelationalSource,
    admin: Option<Uuid>,
}

impl<'a> PgVersionStore<'a> {
    /// `admin` becomes the eperson of every version row.
    pub fn new(db: &'a mut RelationalSource, admin: Option<Uuid>) -> Self {
        Self { db, admin }
    }
}

fn int4(value: i64) -> Result<SqlValue> {
    i32::try_from(value)
        .map(SqlValue::I32)
        .map_err(|_| MigrateError::Invariant(format!("id {} does not fit an integer column", value)))
}

fn item_uuid(handle: &Handle) -> Result<Uuid> {
    Uuid::parse_str(handle.as_str()).map_err(|_| {
        MigrateError::Invariant(format!("item handle {} is not a uuid", handle))
    })
}

#[async_trait]
impl VersionStore for PgVersionStore<'_> {
    async fn versioned_items(&mut self) -> Result<BTreeSet<String>> {
        let rows = self
            .db
            .fetch_all("SELECT item_id FROM versionitem ORDER BY item_id")
            .await?;
        Ok(rows
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(SqlValue::as_text))
            .collect())
    }

    async fn version_date(&mut self, item: &Handle, field: &DateField) -> Result<Option<String>> {
        let mut params = vec![
            SqlValue::Uuid(item_uuid(item)?),
            SqlValue::String(field.schema.clone()),
            SqlValue::String(field.element.clone()),
        ];
        let qualifier = match &field.qualifier {
            Some(q) => {
                params.push(SqlValue::String(q.clone()));
                "qualifier = $4"
            }
            None => "qualifier IS NULL",
        };
        let sql = format!(
            "SELECT text_value FROM metadatavalue \
             WHERE dspace_object_id = $1 AND metadata_field_id IN ( \
               SELECT metadata_field_id FROM metadatafieldregistry \
               WHERE metadata_schema_id = ( \
                 SELECT metadata_schema_id FROM metadataschemaregistry WHERE short_id = $2) \
               AND element = $3 AND {}) \
             ORDER BY place",
            qualifier
        );
        Ok(self
            .db
            .fetch_one_params(&sql, &params)
            .await?
            .and_then(|v| v.as_text())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    async fn history_of(&mut self, item: &Handle) -> Result<Option<i64>> {
        Ok(self
            .db
            .fetch_one_params(
                "SELECT versionhistory_id FROM versionitem WHERE item_id = $1 \
                 ORDER BY version_number LIMIT 1",
                &[SqlValue::Uuid(item_uuid(item)?)],
            )
            .await?
            .and_then(|v| v.as_i64()))
    }

    async fn allocate_history(&mut self) -> Result<i64> {
        let id = self
            .db
            .get_last_id("versionhistory", "versionhistory_id")
            .await?
            + 1;
        self.db
            .execute(
                "INSERT INTO versionhistory(versionhistory_id) VALUES ($1)",
                &[int4(id)?],
            )
            .await?;
        self.db.set_sequence("versionhistory_seq", id).await?;
        Ok(id)
    }

    async fn insert_version(&mut self, row: &VersionRow) -> Result<()> {
        let id = self.db.get_last_id("versionitem", "versionitem_id").await? + 1;
        let eperson = match self.admin {
            Some(uuid) => SqlValue::Uuid(uuid),
            None => SqlValue::Null(SqlNullType::Uuid),
        };
        self.db
            .execute(
                "INSERT INTO versionitem(versionitem_id, version_number, version_date, \
                 version_summary, versionhistory_id, eperson_id, item_id) \
                 VALUES ($1, $2, TO_TIMESTAMP($3, 'YYYY-MM-DD'), $4, $5, $6, $7)",
                &[
                    int4(id)?,
                    int4(row.version_number)?,
                    SqlValue::String(row.date.clone()),
                    SqlValue::String(String::new()),
                    int4(row.history_id)?,
                    eperson,
                    SqlValue::Uuid(item_uuid(&row.item)?),
                ],
            )
            .await?;
        self.db.set_sequence("versionitem_seq", id).await
    }
}
