//! Dimension merge engine.
//!
//! Splits staged rows against the target's current rows on business key,
//! plans inserts / type-1 overwrites / type-2 versioning as pure data, then
//! applies the plan through the batch executor. Surrogate keys are assigned
//! by the warehouse on first insert and never touched afterwards.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::PgPool;

use crate::batch::{self, BatchWriter};
use crate::config::{DimensionConfig, ScdPolicy};
use crate::error::EtlError;
use crate::record::{self, CellValue, Record};

/// Audit columns the engine owns; excluded from change detection.
pub const AUDIT_COLUMNS: [&str; 5] = [
    "valid_from",
    "valid_to",
    "is_current",
    "created_at",
    "updated_at",
];

/// Open-ended validity window for the current row.
pub fn valid_to_sentinel() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .expect("static date")
        .and_hms_opt(0, 0, 0)
        .expect("static time")
}

/// Render a record's business key from the configured key columns. Composite
/// keys join their parts with `|`; a missing or blank part means no key.
pub fn business_key(record: &Record, keys: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        parts.push(record.get(key)?.as_key_text()?);
    }
    Some(parts.join("|"))
}

#[derive(Debug, Default, PartialEq)]
pub struct MergePlan {
    /// New rows (and type-2 versions), audit columns attached.
    pub inserts: Vec<Record>,
    /// Type-1 in-place overwrites, `updated_at` attached.
    pub updates: Vec<Record>,
    /// Type-2: staged rows whose current target row must close first.
    pub closes: Vec<Record>,
    pub rejected: u64,
    pub unchanged: u64,
    pub deduped: u64,
}

/// Plan one dimension's merge. Pure: same staged input and target state
/// produce the same plan.
pub fn plan_merge(
    staged: &[Record],
    existing: &HashMap<String, Record>,
    cfg: &DimensionConfig,
    now: NaiveDateTime,
) -> MergePlan {
    let mut plan = MergePlan::default();

    // In-batch duplicates keep the last row in extraction order; the
    // extraction query's ORDER BY makes that order deterministic.
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, &Record> = HashMap::new();
    for rec in staged {
        match business_key(rec, &cfg.business_keys) {
            Some(key) => {
                if latest.insert(key.clone(), rec).is_some() {
                    plan.deduped += 1;
                } else {
                    order.push(key);
                }
            }
            None => plan.rejected += 1,
        }
    }

    for key in &order {
        let rec = latest[key];
        match existing.get(key) {
            None => plan.inserts.push(versioned(rec, now)),
            Some(current) => {
                if !attributes_changed(rec, current, cfg) {
                    plan.unchanged += 1;
                    continue;
                }
                match cfg.scd {
                    ScdPolicy::Type1 => {
                        let mut update = rec.clone();
                        update.remove(&cfg.surrogate_key);
                        update.insert("updated_at".into(), CellValue::Timestamp(now));
                        plan.updates.push(update);
                    }
                    ScdPolicy::Type2 => {
                        plan.closes.push(rec.clone());
                        plan.inserts.push(versioned(rec, now));
                    }
                }
            }
        }
    }

    plan
}

/// Attach the validity window and audit timestamps to a fresh row.
fn versioned(rec: &Record, now: NaiveDateTime) -> Record {
    let mut out = rec.clone();
    out.insert("valid_from".into(), CellValue::Timestamp(now));
    out.insert("valid_to".into(), CellValue::Timestamp(valid_to_sentinel()));
    out.insert("is_current".into(), CellValue::Bool(true));
    out.insert("created_at".into(), CellValue::Timestamp(now));
    out.insert("updated_at".into(), CellValue::Timestamp(now));
    out
}

/// Did any tracked attribute change? Business keys, the surrogate column and
/// the audit columns never count.
fn attributes_changed(staged: &Record, current: &Record, cfg: &DimensionConfig) -> bool {
    for (column, value) in staged {
        if cfg.business_keys.contains(column)
            || column == &cfg.surrogate_key
            || AUDIT_COLUMNS.contains(&column.as_str())
        {
            continue;
        }
        match current.get(column) {
            Some(existing) if value.approx_eq(existing) => {}
            _ => return true,
        }
    }
    false
}

/// Current rows of a dimension, keyed by business key, for planning.
pub async fn load_current_rows(
    pool: &PgPool,
    cfg: &DimensionConfig,
) -> Result<HashMap<String, Record>, sqlx::Error> {
    let sql = format!("SELECT * FROM {} WHERE is_current = TRUE", cfg.name);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut map = HashMap::new();
    for row in &rows {
        let rec = record::decode_row(row);
        if let Some(key) = business_key(&rec, &cfg.business_keys) {
            map.insert(key, rec);
        }
    }
    Ok(map)
}

/// Business key → current surrogate key, for fact resolution.
pub async fn load_key_map(
    pool: &PgPool,
    cfg: &DimensionConfig,
) -> Result<HashMap<String, i64>, sqlx::Error> {
    let sql = format!(
        "SELECT {}, {} FROM {} WHERE is_current = TRUE",
        cfg.business_keys.join(", "),
        cfg.surrogate_key,
        cfg.name
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut map = HashMap::new();
    for row in &rows {
        let rec = record::decode_row(row);
        let surrogate = match rec.get(&cfg.surrogate_key) {
            Some(CellValue::Int(dk)) => *dk,
            _ => continue,
        };
        if let Some(key) = business_key(&rec, &cfg.business_keys) {
            map.insert(key, surrogate);
        }
    }
    Ok(map)
}

/// Apply a merge plan: close superseded versions, overwrite type-1 rows,
/// then insert. Every write goes through the batch executor, one transaction
/// per chunk.
pub async fn apply_merge(
    pool: &PgPool,
    writer: &BatchWriter,
    cfg: &DimensionConfig,
    plan: &MergePlan,
    now: NaiveDateTime,
    cancel: &AtomicBool,
) -> Result<u64, EtlError> {
    let mut written = 0u64;

    if !plan.closes.is_empty() {
        let close_sql = batch::update_current_sql(
            &cfg.name,
            &[
                "valid_to".to_string(),
                "is_current".to_string(),
                "updated_at".to_string(),
            ],
            &cfg.business_keys,
        );
        written += writer
            .write_chunks(&cfg.name, &plan.closes, cancel, |chunk| {
                let pool = pool.clone();
                let close_sql = close_sql.clone();
                let keys = cfg.business_keys.clone();
                async move {
                    let mut tx = pool.begin().await?;
                    let mut affected = 0u64;
                    for rec in chunk {
                        let mut query = sqlx::query(&close_sql)
                            .bind(now)
                            .bind(false)
                            .bind(now);
                        for key in &keys {
                            query =
                                record::bind_cell(query, rec.get(key).unwrap_or(&CellValue::Null));
                        }
                        affected += query.execute(&mut *tx).await?.rows_affected();
                    }
                    tx.commit().await?;
                    Ok(affected)
                }
            })
            .await?;
    }

    if !plan.updates.is_empty() {
        let set_columns: Vec<String> = record::column_names(&plan.updates[0])
            .into_iter()
            .filter(|c| !cfg.business_keys.contains(c))
            .collect();
        let update_sql = batch::update_current_sql(&cfg.name, &set_columns, &cfg.business_keys);
        written += writer
            .write_chunks(&cfg.name, &plan.updates, cancel, |chunk| {
                let pool = pool.clone();
                let update_sql = update_sql.clone();
                let set_columns = set_columns.clone();
                let keys = cfg.business_keys.clone();
                async move {
                    let mut tx = pool.begin().await?;
                    let mut affected = 0u64;
                    for rec in chunk {
                        let mut query = sqlx::query(&update_sql);
                        for col in &set_columns {
                            query =
                                record::bind_cell(query, rec.get(col).unwrap_or(&CellValue::Null));
                        }
                        for key in &keys {
                            query =
                                record::bind_cell(query, rec.get(key).unwrap_or(&CellValue::Null));
                        }
                        affected += query.execute(&mut *tx).await?.rows_affected();
                    }
                    tx.commit().await?;
                    Ok(affected)
                }
            })
            .await?;
    }

    if !plan.inserts.is_empty() {
        let columns = record::column_names(&plan.inserts[0]);
        written += writer
            .write_chunks(&cfg.name, &plan.inserts, cancel, |chunk| {
                let pool = pool.clone();
                let table = cfg.name.clone();
                let columns = columns.clone();
                async move {
                    let sql = batch::insert_sql(&table, &columns, chunk.len(), "");
                    let mut query = sqlx::query(&sql);
                    for rec in chunk {
                        for col in &columns {
                            query =
                                record::bind_cell(query, rec.get(col).unwrap_or(&CellValue::Null));
                        }
                    }
                    let done = query.execute(&pool).await?;
                    Ok(done.rows_affected())
                }
            })
            .await?;
    }

    Ok(written)
}

// =============================================================================
// TESTS
// =============================================================================
