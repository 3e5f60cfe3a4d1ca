//! Read side: legacy records from live databases or snapshot files.

mod live;
mod metadata;
mod snapshot;

pub use live::LiveRecords;
pub use metadata::{MetadataIndex, MetadataValue};
pub use snapshot::{export_table, SnapshotRecords};

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Which legacy database holds a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyDb {
    Dspace,
    Utilities,
}

/// A legacy table and the column holding its integer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyTable {
    pub name: &'static str,
    pub id_column: &'static str,
    pub db: LegacyDb,
}

const fn dspace(name: &'static str, id_column: &'static str) -> LegacyTable {
    LegacyTable {
        name,
        id_column,
        db: LegacyDb::Dspace,
    }
}

const fn utilities(name: &'static str, id_column: &'static str) -> LegacyTable {
    LegacyTable {
        name,
        id_column,
        db: LegacyDb::Utilities,
    }
}

/// Every legacy table the stages read.
pub const LEGACY_TABLES: &[LegacyTable] = &[
    dspace("epersongroup", "eperson_group_id"),
    dspace("group2group", "id"),
    dspace("handle", "handle_id"),
    dspace("metadataschemaregistry", "metadata_schema_id"),
    dspace("metadatafieldregistry", "metadata_field_id"),
    dspace("metadatavalue", "metadata_value_id"),
    dspace("community", "community_id"),
    dspace("community2community", "id"),
    dspace("collection", "collection_id"),
    dspace("community2collection", "id"),
    dspace("registrationdata", "registrationdata_id"),
    dspace("eperson", "eperson_id"),
    dspace("epersongroup2eperson", "id"),
    dspace("item", "item_id"),
    dspace("workspaceitem", "workspace_item_id"),
    dspace("workflowitem", "workflow_id"),
    dspace("collection2item", "id"),
    dspace("bundle", "bundle_id"),
    dspace("item2bundle", "id"),
    dspace("bitstream", "bitstream_id"),
    dspace("bundle2bitstream", "id"),
    dspace("bitstreamformatregistry", "bitstream_format_id"),
    dspace("fileextension", "file_extension_id"),
    dspace("resourcepolicy", "policy_id"),
    utilities("user_registration", "eperson_id"),
    utilities("license_label", "label_id"),
    utilities("license_definition", "license_id"),
    utilities("license_label_extended_mapping", "mapping_id"),
    utilities("user_metadata", "user_metadata_id"),
    utilities("license_resource_user_allowance", "transaction_id"),
    utilities("license_resource_mapping", "mapping_id"),
];

impl LegacyTable {
    pub fn lookup(name: &str) -> Result<&'static LegacyTable> {
        LEGACY_TABLES
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| MigrateError::Config(format!("unknown legacy table '{}'", name)))
    }
}

/// Legacy object type ids, as stored in `resource_type_id` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    Bitstream,
    Bundle,
    Item,
    Collection,
    Community,
    Group,
    Eperson,
}

impl ResourceType {
    pub fn id(&self) -> i64 {
        match self {
            ResourceType::Bitstream => 0,
            ResourceType::Bundle => 1,
            ResourceType::Item => 2,
            ResourceType::Collection => 3,
            ResourceType::Community => 4,
            ResourceType::Group => 6,
            ResourceType::Eperson => 7,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(ResourceType::Bitstream),
            1 => Some(ResourceType::Bundle),
            2 => Some(ResourceType::Item),
            3 => Some(ResourceType::Collection),
            4 => Some(ResourceType::Community),
            6 => Some(ResourceType::Group),
            7 => Some(ResourceType::Eperson),
            _ => None,
        }
    }
}

/// One immutable legacy row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub legacy_id: i64,
    /// Table the row came from.
    pub kind: &'static str,
    pub attrs: Map<String, Value>,
}

impl SourceRecord {
    pub fn from_object(table: &LegacyTable, attrs: Map<String, Value>) -> Result<Self> {
        let legacy_id = attrs
            .get(table.id_column)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                MigrateError::Config(format!(
                    "{}: row without integer {}",
                    table.name, table.id_column
                ))
            })?;
        Ok(Self {
            legacy_id,
            kind: table.name,
            attrs,
        })
    }

    /// Attribute value, `Null` when absent.
    pub fn value(&self, name: &str) -> Value {
        self.attrs.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).and_then(Value::as_i64)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }

    /// Boolean attribute; absent or null reads as false.
    pub fn flag(&self, name: &str) -> bool {
        self.attrs.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Integer attribute required by the caller; missing is a record error.
    pub fn require_int(&self, name: &str) -> Result<i64> {
        self.int(name).ok_or_else(|| {
            MigrateError::record(self.kind, self.legacy_id, format!("missing {}", name))
        })
    }
}

/// Where legacy rows come from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn load(&mut self, table: &LegacyTable) -> Result<Vec<SourceRecord>>;

    fn describe(&self) -> String;
}

/// Caches legacy tables and the metadata index for the whole run.
pub struct LegacyStore {
    source: Box<dyn RecordSource>,
    tables: HashMap<&'static str, Arc<Vec<SourceRecord>>>,
    metadata: Option<Arc<MetadataIndex>>,
    replaced_fields: BTreeMap<String, String>,
    ignored_fields: Vec<String>,
}

impl LegacyStore {
    pub fn new(source: Box<dyn RecordSource>, config: &MigrationConfig) -> Self {
        Self {
            source,
            tables: HashMap::new(),
            metadata: None,
            replaced_fields: config.replaced_metadata_fields.clone(),
            ignored_fields: config.ignored_metadata_fields.clone(),
        }
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    pub async fn table(&mut self, name: &str) -> Result<Arc<Vec<SourceRecord>>> {
        let table = LegacyTable::lookup(name)?;
        if let Some(rows) = self.tables.get(table.name) {
            return Ok(Arc::clone(rows));
        }
        let rows = Arc::new(self.source.load(table).await?);
        if rows.is_empty() {
            info!("Empty input: [{}]", table.name);
        }
        self.tables.insert(table.name, Arc::clone(&rows));
        Ok(rows)
    }

    pub async fn metadata(&mut self) -> Result<Arc<MetadataIndex>> {
        if let Some(index) = &self.metadata {
            return Ok(Arc::clone(index));
        }
        let values = self.table("metadatavalue").await?;
        let fields = self.table("metadatafieldregistry").await?;
        let schemas = self.table("metadataschemaregistry").await?;
        let index = Arc::new(MetadataIndex::build(
            &values,
            &fields,
            &schemas,
            self.replaced_fields.clone(),
            self.ignored_fields.clone(),
        ));
        info!(
            "Metadata index: {} values on {} objects",
            values.len(),
            index.object_count()
        );
        self.metadata = Some(Arc::clone(&index));
        Ok(index)
    }
}
