//! Error taxonomy for the ETL engine.
//!
//! Table-level errors (`EtlError`) abort one table's step and are recorded
//! against the run. Row-level rejects (`RowReject`) are counted and skipped;
//! the batch keeps going.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("extraction failed for {table}: {source}")]
    Extraction {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("load failed for {table} after {attempts} attempt(s): {source}")]
    Load {
        table: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("another run is already active: {run_id}")]
    ConcurrentRun { run_id: Uuid },

    #[error("run cancelled before {table} completed")]
    Cancelled { table: String },

    #[error("run tracking failed: {0}")]
    Tracker(#[from] sqlx::Error),
}

/// Why a single staged row was rejected. Never fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowReject {
    #[error("transform: {0}")]
    Transform(String),

    #[error("no current row in {dimension} for business key '{key}'")]
    Referential { dimension: String, key: String },
}
