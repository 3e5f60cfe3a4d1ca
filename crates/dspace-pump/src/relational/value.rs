//! Typed SQL values and result sets.

use serde_json::Value;
use tokio_postgres::types::ToSql;

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Decimal(rust_decimal::Decimal),
    DateTime(chrono::NaiveDateTime),
    DateTimeOffset(chrono::DateTime<chrono::FixedOffset>),
    Date(chrono::NaiveDate),
    Json(Value),
}

/// Type hint for NULL values to ensure correct PostgreSQL encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Json,
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Integer view of any integral value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(*v as i64),
            SqlValue::I32(v) => Some(*v as i64),
            SqlValue::I64(v) => Some(*v),
            SqlValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Textual view; uuids and dates are rendered.
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null(_) => None,
            SqlValue::String(s) => Some(s.clone()),
            SqlValue::Uuid(u) => Some(u.to_string()),
            other => match other.to_json() {
                Value::String(s) => Some(s),
                Value::Null => None,
                v => Some(v.to_string()),
            },
        }
    }

    /// JSON rendering used for snapshots and legacy records.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null(_) => Value::Null,
            SqlValue::Bool(v) => Value::Bool(*v),
            SqlValue::I16(v) => Value::from(*v),
            SqlValue::I32(v) => Value::from(*v),
            SqlValue::I64(v) => Value::from(*v),
            SqlValue::F32(v) => Value::from(*v as f64),
            SqlValue::F64(v) => Value::from(*v),
            SqlValue::String(v) => Value::String(v.clone()),
            SqlValue::Bytes(v) => Value::String(hex::encode(v)),
            SqlValue::Uuid(v) => Value::String(v.to_string()),
            SqlValue::Decimal(v) => Value::String(v.to_string()),
            SqlValue::DateTime(v) => Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            SqlValue::DateTimeOffset(v) => Value::String(v.to_rfc3339()),
            SqlValue::Date(v) => Value::String(v.format("%Y-%m-%d").to_string()),
            SqlValue::Json(v) => v.clone(),
        }
    }

    /// Boxed parameter for binding.
    pub fn to_param(&self) -> Box<dyn ToSql + Sync + Send> {
        match self {
            SqlValue::Null(hint) => match hint {
                SqlNullType::Bool => Box::new(None::<bool>),
                SqlNullType::I16 => Box::new(None::<i16>),
                SqlNullType::I32 => Box::new(None::<i32>),
                SqlNullType::I64 => Box::new(None::<i64>),
                SqlNullType::F32 => Box::new(None::<f32>),
                SqlNullType::F64 => Box::new(None::<f64>),
                SqlNullType::String => Box::new(None::<String>),
                SqlNullType::Bytes => Box::new(None::<Vec<u8>>),
                SqlNullType::Uuid => Box::new(None::<uuid::Uuid>),
                SqlNullType::Decimal => Box::new(None::<rust_decimal::Decimal>),
                SqlNullType::DateTime => Box::new(None::<chrono::NaiveDateTime>),
                SqlNullType::DateTimeOffset => {
                    Box::new(None::<chrono::DateTime<chrono::FixedOffset>>)
                }
                SqlNullType::Date => Box::new(None::<chrono::NaiveDate>),
                SqlNullType::Json => Box::new(None::<Value>),
            },
            SqlValue::Bool(v) => Box::new(*v),
            SqlValue::I16(v) => Box::new(*v),
            SqlValue::I32(v) => Box::new(*v),
            SqlValue::I64(v) => Box::new(*v),
            SqlValue::F32(v) => Box::new(*v),
            SqlValue::F64(v) => Box::new(*v),
            SqlValue::String(v) => Box::new(v.clone()),
            SqlValue::Bytes(v) => Box::new(v.clone()),
            SqlValue::Uuid(v) => Box::new(*v),
            SqlValue::Decimal(v) => Box::new(*v),
            SqlValue::DateTime(v) => Box::new(*v),
            SqlValue::DateTimeOffset(v) => Box::new(*v),
            SqlValue::Date(v) => Box::new(*v),
            SqlValue::Json(v) => Box::new(v.clone()),
        }
    }
}

/// Rows of one query with their column names captured once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|r| r.first())
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_objects(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(SqlValue::to_json))
                    .collect()
            })
            .collect()
    }
}

/// Convert a PostgreSQL row value to SqlValue based on column type.
pub(crate) fn convert_pg_row_value(row: &tokio_postgres::Row, idx: usize) -> SqlValue {
    match row.columns()[idx].type_().name() {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bytes)
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Json)
            .unwrap_or(SqlValue::Null(SqlNullType::Json)),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::String)
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    }
}
