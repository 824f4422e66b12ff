//! Run tracker.
//!
//! One `etl_runs` row per execution, one `etl_run_tables` row per table step.
//! The tracker enforces the single-writer rule: starting a run while another
//! is still `running` is refused outright, not queued. The final status is
//! written once, at the run's natural end or on unrecoverable abort; a run
//! is `succeeded` only if every table step finished ok.

use chrono::NaiveDateTime;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EtlError;

const CREATE_RUNS_SQL: &str = "CREATE TABLE IF NOT EXISTS etl_runs (\n\
     run_id UUID PRIMARY KEY,\n\
     started_at TIMESTAMP NOT NULL,\n\
     ended_at TIMESTAMP,\n\
     status TEXT NOT NULL\n\
     )";

const CREATE_RUN_TABLES_SQL: &str = "CREATE TABLE IF NOT EXISTS etl_run_tables (\n\
     run_id UUID NOT NULL REFERENCES etl_runs(run_id),\n\
     table_name TEXT NOT NULL,\n\
     rows_read BIGINT NOT NULL DEFAULT 0,\n\
     rows_written BIGINT NOT NULL DEFAULT 0,\n\
     rows_rejected BIGINT NOT NULL DEFAULT 0,\n\
     status TEXT NOT NULL,\n\
     error TEXT,\n\
     PRIMARY KEY (run_id, table_name)\n\
     )";

/// Final state of a run. `running` is never written by `finish`; it only
/// exists between `start` and `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Ok,
    Failed,
    Skipped,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Ok => "ok",
            TableStatus::Failed => "failed",
            TableStatus::Skipped => "skipped",
        }
    }
}

/// Per-table step counters reported against the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableCounts {
    pub read: u64,
    pub written: u64,
    pub rejected: u64,
}

pub struct RunTracker {
    pool: PgPool,
    pub run_id: Uuid,
}

impl RunTracker {
    /// Create the tracking tables if missing, refuse to start while another
    /// run is active, and insert the run row.
    pub async fn start(
        pool: &PgPool,
        run_id: Uuid,
        started_at: NaiveDateTime,
    ) -> Result<Self, EtlError> {
        sqlx::query(CREATE_RUNS_SQL).execute(pool).await?;
        sqlx::query(CREATE_RUN_TABLES_SQL).execute(pool).await?;

        let active: Option<(Uuid,)> =
            sqlx::query_as("SELECT run_id FROM etl_runs WHERE status = 'running' LIMIT 1")
                .fetch_optional(pool)
                .await?;
        if let Some((active_id,)) = active {
            return Err(EtlError::ConcurrentRun { run_id: active_id });
        }

        sqlx::query("INSERT INTO etl_runs (run_id, started_at, status) VALUES ($1, $2, 'running')")
            .bind(run_id)
            .bind(started_at)
            .execute(pool)
            .await?;

        Ok(Self {
            pool: pool.clone(),
            run_id,
        })
    }

    /// Upsert one table step's counters. A step may report more than once as
    /// it progresses; the last report wins.
    pub async fn record_table(
        &self,
        table: &str,
        status: TableStatus,
        counts: TableCounts,
        error: Option<&str>,
    ) -> Result<(), EtlError> {
        sqlx::query(
            r#"
            INSERT INTO etl_run_tables
            (run_id, table_name, rows_read, rows_written, rows_rejected, status, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id, table_name) DO UPDATE
            SET rows_read = EXCLUDED.rows_read,
                rows_written = EXCLUDED.rows_written,
                rows_rejected = EXCLUDED.rows_rejected,
                status = EXCLUDED.status,
                error = EXCLUDED.error
            "#,
        )
        .bind(self.run_id)
        .bind(table)
        .bind(counts.read as i64)
        .bind(counts.written as i64)
        .bind(counts.rejected as i64)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write the final status and end time. The `status = 'running'` guard
    /// keeps the transition one-way.
    pub async fn finish(&self, status: RunStatus, ended_at: NaiveDateTime) -> Result<(), EtlError> {
        sqlx::query(
            "UPDATE etl_runs SET ended_at = $2, status = $3 \
             WHERE run_id = $1 AND status = 'running'",
        )
        .bind(self.run_id)
        .bind(ended_at)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_match_the_tracking_schema() {
        assert_eq!(RunStatus::Succeeded.as_str(), "succeeded");
        assert_eq!(RunStatus::Failed.as_str(), "failed");
        assert_eq!(TableStatus::Ok.as_str(), "ok");
        assert_eq!(TableStatus::Failed.as_str(), "failed");
        assert_eq!(TableStatus::Skipped.as_str(), "skipped");
    }

    #[test]
    fn tracking_schema_carries_per_table_counters() {
        for column in ["rows_read", "rows_written", "rows_rejected", "status", "error"] {
            assert!(
                CREATE_RUN_TABLES_SQL.contains(column),
                "schema missing {column}"
            );
        }
        assert!(CREATE_RUN_TABLES_SQL.contains("PRIMARY KEY (run_id, table_name)"));
    }
}
