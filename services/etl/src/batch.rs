//! Batch executor: chunked writes with bounded retry.
//!
//! Both loaders push every write through here. Each chunk commits in its own
//! transaction; a transient failure retries the same chunk after a fixed
//! delay, and chunks already committed stay committed (the upsert semantics
//! upstream make a resumed run safe). The commit future owns its connection,
//! so dropping it on error returns the connection to the pool before the
//! retry sleep. Cancellation is honored at chunk boundaries only.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;

use crate::config::Settings;
use crate::error::EtlError;
use crate::record::Record;

#[derive(Debug, Clone)]
pub struct BatchWriter {
    pub batch_size: usize,
    pub attempts: u32,
    pub delay: Duration,
}

impl BatchWriter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            batch_size: settings.batch_size,
            attempts: settings.retry_attempts,
            delay: settings.retry_delay,
        }
    }

    /// Write `rows` in fixed-size chunks, committing each via the supplied
    /// future. Returns the total rows affected across committed chunks.
    pub async fn write_chunks<'a, F, Fut>(
        &self,
        table: &str,
        rows: &'a [Record],
        cancel: &AtomicBool,
        mut commit: F,
    ) -> Result<u64, EtlError>
    where
        F: FnMut(&'a [Record]) -> Fut,
        Fut: Future<Output = Result<u64, sqlx::Error>>,
    {
        let mut written = 0u64;
        for chunk in rows.chunks(self.batch_size.max(1)) {
            if cancel.load(Ordering::Relaxed) {
                return Err(EtlError::Cancelled {
                    table: table.to_string(),
                });
            }

            let mut attempt = 1u32;
            loop {
                match commit(chunk).await {
                    Ok(affected) => {
                        written += affected;
                        break;
                    }
                    Err(e) if is_transient(&e) && attempt < self.attempts.max(1) => {
                        eprintln!(
                            "  [{}] transient failure (attempt {}/{}): {} — retrying in {:?}",
                            table, attempt, self.attempts, e, self.delay
                        );
                        sleep(self.delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        return Err(EtlError::Load {
                            table: table.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                }
            }
        }
        Ok(written)
    }
}

/// Failures worth retrying the same chunk for: lost connections, pool
/// exhaustion, deadlocks, serialization conflicts, server shutdown.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("57P01") | Some("53300") | Some("08000")
                | Some("08001") | Some("08006")
        ),
        _ => false,
    }
}

// =============================================================================
// Dynamic SQL builders shared by the loaders
// =============================================================================

/// `INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4) <suffix>`
pub fn insert_sql(table: &str, columns: &[String], rows: usize, suffix: &str) -> String {
    let mut sql = format!("INSERT INTO {} ({}) VALUES ", table, columns.join(", "));
    let mut placeholder = 1;
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..columns.len() {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&placeholder.to_string());
            placeholder += 1;
        }
        sql.push(')');
    }
    if !suffix.is_empty() {
        sql.push(' ');
        sql.push_str(suffix);
    }
    sql
}

/// `UPDATE t SET a = $1, b = $2 WHERE k1 = $3 AND is_current = TRUE`
pub fn update_current_sql(table: &str, set_columns: &[String], key_columns: &[String]) -> String {
    let mut placeholder = 1;
    let sets: Vec<String> = set_columns
        .iter()
        .map(|c| {
            let s = format!("{} = ${}", c, placeholder);
            placeholder += 1;
            s
        })
        .collect();
    let keys: Vec<String> = key_columns
        .iter()
        .map(|c| {
            let s = format!("{} = ${}", c, placeholder);
            placeholder += 1;
            s
        })
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} AND is_current = TRUE",
        table,
        sets.join(", "),
        keys.join(" AND ")
    )
}

/// `DELETE FROM t WHERE k IN ($1, $2, ...)`
pub fn delete_in_sql(table: &str, key_column: &str, count: usize) -> String {
    let placeholders: Vec<String> = (1..=count).map(|n| format!("${n}")).collect();
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        table,
        key_column,
        placeholders.join(", ")
    )
}

// =============================================================================
// TESTS
// =============================================================================
