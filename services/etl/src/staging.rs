//! Staging loader: runs a configured extraction query against the source
//! database and materializes the rows in memory for the current run.
//! Staged rows live only as long as the run.

use chrono::NaiveDate;
use sqlx::PgPool;

use crate::error::EtlError;
use crate::record::{self, Record};

pub struct StagedTable {
    pub name: String,
    pub rows: Vec<Record>,
}

/// Substitute the run's date range into an extraction query. The only
/// client-supplied parameters are the literal {START_DATE}/{END_DATE}
/// placeholders; everything else in the query text is configuration.
pub fn apply_date_parameters(sql: &str, start: NaiveDate, end: NaiveDate) -> String {
    sql.replace("{START_DATE}", &start.format("%Y-%m-%d").to_string())
        .replace("{END_DATE}", &end.format("%Y-%m-%d").to_string())
}

/// Execute one extraction query and stage its rows. An extraction failure
/// carries the table name so the tracker can mark just that table failed.
pub async fn extract_table(
    pool: &PgPool,
    name: &str,
    sql: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<StagedTable, EtlError> {
    let sql = apply_date_parameters(sql, start, end);
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| EtlError::Extraction {
            table: name.to_string(),
            source: e,
        })?;

    let rows: Vec<Record> = rows.iter().map(record::decode_row).collect();
    println!("  [{}] staged {} rows", name, rows.len());

    Ok(StagedTable {
        name: name.to_string(),
        rows,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_both_placeholders() {
        let sql = "SELECT * FROM service WHERE requested_at >= '{START_DATE}' AND requested_at < '{END_DATE}'";
        let out = apply_date_parameters(
            sql,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        assert_eq!(
            out,
            "SELECT * FROM service WHERE requested_at >= '2024-01-01' AND requested_at < '2024-02-01'"
        );
    }

    #[test]
    fn leaves_plain_queries_alone() {
        let sql = "SELECT id, name FROM city ORDER BY id";
        let out = apply_date_parameters(
            sql,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        );
        assert_eq!(out, sql);
    }

    #[test]
    fn repeated_placeholders_all_substitute() {
        let sql = "SELECT 1 WHERE a >= '{START_DATE}' OR b >= '{START_DATE}'";
        let out = apply_date_parameters(
            sql,
            NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 16).unwrap(),
        );
        assert!(!out.contains("{START_DATE}"));
        assert_eq!(out.matches("2024-06-15").count(), 2);
    }
}
