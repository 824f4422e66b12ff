//! Dynamic row representation.
//!
//! Staged rows carry whatever columns the configured extraction SQL selects,
//! so the engine works on a column-name → `CellValue` map decoded from the
//! driver's type info rather than per-entity structs.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};

/// One staged row: column name → value. BTreeMap keeps column order
/// deterministic across runs.
pub type Record = BTreeMap<String, CellValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Render a value for business-key building. Returns `None` for nulls
    /// and blank text so callers can treat those keys as missing.
    pub fn as_key_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            CellValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
            CellValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Coerce to a naive timestamp. Text falls back to the common ISO forms;
    /// anything else is `None`.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Timestamp(ts) => Some(*ts),
            CellValue::Date(d) => d.and_hms_opt(0, 0, 0),
            CellValue::Text(s) => {
                let s = s.trim();
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                    .ok()
                    .or_else(|| {
                        NaiveDate::parse_from_str(s, "%Y-%m-%d")
                            .ok()
                            .and_then(|d| d.and_hms_opt(0, 0, 0))
                    })
            }
            _ => None,
        }
    }

    /// Equality for change detection. Floats compare with a small tolerance
    /// so round-tripping through the database never registers as a change.
    pub fn approx_eq(&self, other: &CellValue) -> bool {
        match (self, other) {
            (CellValue::Float(a), CellValue::Float(b)) => (a - b).abs() < 1e-9,
            (CellValue::Int(a), CellValue::Float(b)) | (CellValue::Float(b), CellValue::Int(a)) => {
                (*a as f64 - b).abs() < 1e-9
            }
            (a, b) => a == b,
        }
    }
}

/// Decode a database row into a `Record` using the column type names the
/// driver reports. Unknown types fall back to text, and a failed decode
/// becomes a null rather than aborting the table.
pub fn decode_row(row: &PgRow) -> Record {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_cell(row, idx, column.type_info().name());
        record.insert(column.name().to_string(), value);
    }
    record
}

fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> CellValue {
    match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(v as i64))
            .unwrap_or(CellValue::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(v as i64))
            .unwrap_or(CellValue::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int)
            .unwrap_or(CellValue::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Float(v as f64))
            .unwrap_or(CellValue::Null),
        "FLOAT8" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float)
            .unwrap_or(CellValue::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Timestamp)
            .unwrap_or(CellValue::Null),
        // Instants are naive local throughout the warehouse; flatten the
        // zone on the way in so time keys and durations line up.
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Timestamp(v.naive_utc()))
            .unwrap_or(CellValue::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
    }
}

/// Bind one value onto a query, dispatching on the variant.
pub fn bind_cell<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &CellValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        CellValue::Null => query.bind(None::<String>),
        CellValue::Bool(b) => query.bind(*b),
        CellValue::Int(i) => query.bind(*i),
        CellValue::Float(f) => query.bind(*f),
        CellValue::Text(s) => query.bind(s.clone()),
        CellValue::Timestamp(ts) => query.bind(*ts),
        CellValue::Date(d) => query.bind(*d),
    }
}

/// Column names of a record, in the deterministic map order.
pub fn column_names(record: &Record) -> Vec<String> {
    record.keys().cloned().collect()
}

// =============================================================================
// TESTS
// =============================================================================
