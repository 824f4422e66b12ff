//! Time dimension generator.
//!
//! Synthesizes a dense minute-grain calendar over a date range. The primary
//! key is derived arithmetically from the timestamp (YYYYMMDDHHMM), so fact
//! loading can compute join keys without a lookup. Loading is idempotent:
//! the derived key dedupes overlapping ranges. Instants are naive local.

use std::sync::atomic::AtomicBool;

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use sqlx::PgPool;

use crate::batch::{self, BatchWriter};
use crate::error::EtlError;
use crate::record::{CellValue, Record};

/// Minute-grain time key: YYYYMMDDHHMM as one integer.
pub fn time_key(ts: NaiveDateTime) -> i64 {
    ts.year() as i64 * 100_000_000
        + ts.month() as i64 * 1_000_000
        + ts.day() as i64 * 10_000
        + ts.hour() as i64 * 100
        + ts.minute() as i64
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeRow {
    pub time_key: i64,
    pub ts: NaiveDateTime,
    pub year: i32,
    pub half_year: i32,
    pub quarter: i32,
    pub month: i32,
    pub week: i32,
    pub day: i32,
    /// Monday = 0.
    pub day_of_week: i32,
    pub is_weekend: bool,
    /// Always false: no holiday table is wired into this system.
    pub is_holiday: bool,
    pub hour: i32,
    pub minute: i32,
    pub day_period: &'static str,
    pub year_month: i32,
}

fn day_period(hour: u32) -> &'static str {
    match hour {
        0..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}

impl TimeRow {
    fn at(ts: NaiveDateTime) -> Self {
        let quarter = (ts.month() as i32 - 1) / 3 + 1;
        let day_of_week = ts.weekday().num_days_from_monday() as i32;
        Self {
            time_key: time_key(ts),
            ts,
            year: ts.year(),
            half_year: (quarter - 1) / 2 + 1,
            quarter,
            month: ts.month() as i32,
            week: ts.iso_week().week() as i32,
            day: ts.day() as i32,
            day_of_week,
            is_weekend: day_of_week >= 5,
            is_holiday: false,
            hour: ts.hour() as i32,
            minute: ts.minute() as i32,
            day_period: day_period(ts.hour()),
            year_month: ts.year() * 100 + ts.month() as i32,
        }
    }

    fn to_record(&self) -> Record {
        let mut rec = Record::new();
        rec.insert("time_key".into(), CellValue::Int(self.time_key));
        rec.insert("ts".into(), CellValue::Timestamp(self.ts));
        rec.insert("year".into(), CellValue::Int(self.year as i64));
        rec.insert("half_year".into(), CellValue::Int(self.half_year as i64));
        rec.insert("quarter".into(), CellValue::Int(self.quarter as i64));
        rec.insert("month".into(), CellValue::Int(self.month as i64));
        rec.insert("week".into(), CellValue::Int(self.week as i64));
        rec.insert("day".into(), CellValue::Int(self.day as i64));
        rec.insert("day_of_week".into(), CellValue::Int(self.day_of_week as i64));
        rec.insert("is_weekend".into(), CellValue::Bool(self.is_weekend));
        rec.insert("is_holiday".into(), CellValue::Bool(self.is_holiday));
        rec.insert("hour".into(), CellValue::Int(self.hour as i64));
        rec.insert("minute".into(), CellValue::Int(self.minute as i64));
        rec.insert("day_period".into(), CellValue::Text(self.day_period.to_string()));
        rec.insert("year_month".into(), CellValue::Int(self.year_month as i64));
        rec
    }
}

/// Generate one row per minute over `[start, end)`, gapless and monotonic.
pub fn generate(start: NaiveDateTime, end: NaiveDateTime) -> Vec<TimeRow> {
    let mut rows = Vec::new();
    let mut ts = start;
    while ts < end {
        rows.push(TimeRow::at(ts));
        ts += Duration::minutes(1);
    }
    rows
}

/// The generator owns this table's DDL: no source table backs it.
pub fn create_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         time_key BIGINT PRIMARY KEY,\n\
         ts TIMESTAMP NOT NULL,\n\
         year INT NOT NULL,\n\
         half_year INT NOT NULL,\n\
         quarter INT NOT NULL,\n\
         month INT NOT NULL,\n\
         week INT NOT NULL,\n\
         day INT NOT NULL,\n\
         day_of_week INT NOT NULL,\n\
         is_weekend BOOLEAN NOT NULL,\n\
         is_holiday BOOLEAN NOT NULL,\n\
         hour INT NOT NULL,\n\
         minute INT NOT NULL,\n\
         day_period TEXT NOT NULL,\n\
         year_month INT NOT NULL\n\
         )"
    )
}

/// Append-only range extension: the derived key dedupes overlap, so
/// re-running with an overlapping range never duplicates rows.
pub async fn load(
    pool: &PgPool,
    writer: &BatchWriter,
    table: &str,
    rows: &[TimeRow],
    cancel: &AtomicBool,
) -> Result<u64, EtlError> {
    let records: Vec<Record> = rows.iter().map(TimeRow::to_record).collect();
    let columns = match records.first() {
        Some(first) => crate::record::column_names(first),
        None => return Ok(0),
    };

    writer
        .write_chunks(table, &records, cancel, |chunk| {
            let pool = pool.clone();
            let table = table.to_string();
            let columns = columns.clone();
            async move {
                let sql = batch::insert_sql(
                    &table,
                    &columns,
                    chunk.len(),
                    "ON CONFLICT (time_key) DO NOTHING",
                );
                let mut query = sqlx::query(&sql);
                for rec in chunk {
                    for col in &columns {
                        query =
                            crate::record::bind_cell(query, rec.get(col).unwrap_or(&CellValue::Null));
                    }
                }
                let done = query.execute(&pool).await?;
                Ok(done.rows_affected())
            }
        })
        .await
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn key_is_yyyymmddhhmm() {
        assert_eq!(time_key(at(2024, 1, 15, 12, 30)), 202401151230);
        assert_eq!(time_key(at(2024, 12, 1, 0, 5)), 202412010005);
    }

    // -------------------------------------------------------------------------
    // One day at minute grain: exactly 1440 rows, unique keys, no gaps
    // -------------------------------------------------------------------------

    #[test]
    fn one_day_is_1440_gapless_rows() {
        let rows = generate(at(2024, 1, 1, 0, 0), at(2024, 1, 2, 0, 0));
        assert_eq!(rows.len(), 1440);

        let keys: HashSet<i64> = rows.iter().map(|r| r.time_key).collect();
        assert_eq!(keys.len(), 1440);

        for pair in rows.windows(2) {
            assert_eq!(pair[1].ts - pair[0].ts, Duration::minutes(1));
        }
        assert_eq!(rows[0].time_key, 202401010000);
        assert_eq!(rows[1439].time_key, 202401012359);
    }

    #[test]
    fn overlapping_ranges_share_keys() {
        let first = generate(at(2024, 1, 1, 0, 0), at(2024, 1, 1, 2, 0));
        let second = generate(at(2024, 1, 1, 1, 0), at(2024, 1, 1, 3, 0));
        // The second hour appears in both with identical keys, which is what
        // lets the primary key dedupe an overlapping re-run.
        assert_eq!(first[60..], second[..60]);
    }

    // -------------------------------------------------------------------------
    // Calendar attributes
    // -------------------------------------------------------------------------

    #[test]
    fn day_period_bucket_edges() {
        assert_eq!(TimeRow::at(at(2024, 3, 4, 0, 0)).day_period, "morning");
        assert_eq!(TimeRow::at(at(2024, 3, 4, 11, 59)).day_period, "morning");
        assert_eq!(TimeRow::at(at(2024, 3, 4, 12, 0)).day_period, "afternoon");
        assert_eq!(TimeRow::at(at(2024, 3, 4, 17, 59)).day_period, "afternoon");
        assert_eq!(TimeRow::at(at(2024, 3, 4, 18, 0)).day_period, "evening");
        assert_eq!(TimeRow::at(at(2024, 3, 4, 23, 59)).day_period, "evening");
    }

    #[test]
    fn weekend_and_weekday_flags() {
        // 2024-01-06 is a Saturday, 2024-01-08 a Monday.
        let saturday = TimeRow::at(at(2024, 1, 6, 10, 0));
        assert_eq!(saturday.day_of_week, 5);
        assert!(saturday.is_weekend);

        let monday = TimeRow::at(at(2024, 1, 8, 10, 0));
        assert_eq!(monday.day_of_week, 0);
        assert!(!monday.is_weekend);
        assert!(!monday.is_holiday);
    }

    #[test]
    fn half_year_and_quarter_arithmetic() {
        let march = TimeRow::at(at(2024, 3, 1, 0, 0));
        assert_eq!((march.quarter, march.half_year), (1, 1));
        let june = TimeRow::at(at(2024, 6, 30, 0, 0));
        assert_eq!((june.quarter, june.half_year), (2, 1));
        let july = TimeRow::at(at(2024, 7, 1, 0, 0));
        assert_eq!((july.quarter, july.half_year), (3, 2));
        let december = TimeRow::at(at(2024, 12, 31, 0, 0));
        assert_eq!((december.quarter, december.half_year), (4, 2));
        assert_eq!(december.year_month, 202412);
    }

    #[test]
    fn record_shape_matches_ddl_columns() {
        let rec = TimeRow::at(at(2024, 1, 1, 0, 0)).to_record();
        let ddl = create_sql("dim_time");
        for column in crate::record::column_names(&rec) {
            assert!(ddl.contains(&column), "DDL missing column {column}");
        }
        assert_eq!(rec.len(), 15);
    }
}
