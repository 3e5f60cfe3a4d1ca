use super::{ResourceType, SourceRecord};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// One metadata value of one object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataValue {
    pub value: String,
    pub language: Option<String>,
    pub authority: Option<String>,
    pub confidence: i64,
    pub place: i64,
}

type FieldValues = BTreeMap<String, Vec<MetadataValue>>;

/// Legacy metadata keyed by (resource type id, resource id).
#[derive(Debug, Default)]
pub struct MetadataIndex {
    fields: HashMap<i64, String>,
    objects: HashMap<(i64, i64), FieldValues>,
    replaced: BTreeMap<String, String>,
    ignored: BTreeSet<String>,
}

impl MetadataIndex {
    pub fn build(
        values: &[SourceRecord],
        fields: &[SourceRecord],
        schemas: &[SourceRecord],
        replaced: BTreeMap<String, String>,
        ignored: Vec<String>,
    ) -> Self {
        let schema_names: HashMap<i64, &str> = schemas
            .iter()
            .filter_map(|s| s.str("short_id").map(|name| (s.legacy_id, name)))
            .collect();

        let mut field_names = HashMap::new();
        for field in fields {
            let Some(schema) = field
                .int("metadata_schema_id")
                .and_then(|id| schema_names.get(&id))
            else {
                warn!("Metadata field [{}] has no schema", field.legacy_id);
                continue;
            };
            let element = field.str("element").unwrap_or_default();
            let name = match field.str("qualifier") {
                Some(q) if !q.is_empty() => format!("{}.{}.{}", schema, element, q),
                _ => format!("{}.{}", schema, element),
            };
            field_names.insert(field.legacy_id, name);
        }

        let mut objects: HashMap<(i64, i64), FieldValues> = HashMap::new();
        for row in values {
            let (Some(rtype), Some(rid), Some(fid)) = (
                row.int("resource_type_id"),
                row.int("resource_id"),
                row.int("metadata_field_id"),
            ) else {
                continue;
            };
            let Some(name) = field_names.get(&fid) else {
                continue;
            };
            objects
                .entry((rtype, rid))
                .or_default()
                .entry(name.clone())
                .or_default()
                .push(MetadataValue {
                    value: row.str("text_value").unwrap_or_default().to_string(),
                    language: row.str("text_lang").map(str::to_string),
                    authority: row.str("authority").map(str::to_string),
                    confidence: row.int("confidence").unwrap_or(-1),
                    place: row.int("place").unwrap_or(0),
                });
        }
        for fields in objects.values_mut() {
            for values in fields.values_mut() {
                values.sort_by_key(|v| v.place);
            }
        }

        Self {
            fields: field_names,
            objects,
            replaced,
            ignored: ignored.into_iter().collect(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// `schema.element[.qualifier]` of a legacy field id.
    pub fn field_name(&self, field_id: i64) -> Option<&str> {
        self.fields.get(&field_id).map(String::as_str)
    }

    pub fn values(&self, rtype: ResourceType, id: i64, field: &str) -> &[MetadataValue] {
        self.objects
            .get(&(rtype.id(), id))
            .and_then(|f| f.get(field))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first(&self, rtype: ResourceType, id: i64, field: &str) -> Option<&str> {
        self.values(rtype, id, field).first().map(|v| v.value.as_str())
    }

    /// Ids of objects of `rtype` carrying any of `fields`.
    pub fn resources_with(&self, rtype: ResourceType, fields: &[&str]) -> BTreeSet<i64> {
        self.objects
            .iter()
            .filter(|((t, _), values)| {
                *t == rtype.id() && fields.iter().any(|f| values.contains_key(*f))
            })
            .map(|((_, id), _)| *id)
            .collect()
    }

    /// Metadata as the destination expects it: `{"dc.title": [{"value": ..}]}`.
    /// Ignored fields are dropped and replaced fields renamed.
    pub fn to_json(&self, rtype: ResourceType, id: i64) -> Option<Value> {
        let fields = self.objects.get(&(rtype.id(), id))?;
        let mut out = Map::new();
        for (name, values) in fields {
            if self.ignored.contains(name) {
                continue;
            }
            let key = self.replaced.get(name).unwrap_or(name);
            let entry = out
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let (Value::Array(list), Ok(Value::Array(more))) =
                (entry, serde_json::to_value(values))
            {
                list.extend(more);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(Value::Object(out))
        }
    }
}
