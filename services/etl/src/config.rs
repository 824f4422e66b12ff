//! Configuration: global settings from the environment, entity mapping from
//! a JSON file. The engine never hard-codes which tables move — it reads the
//! mapping and obeys it.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::fs;

/// Global settings, environment-supplied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_db_url: String,
    pub warehouse_db_url: String,
    pub max_connections: u32,
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub dim_workers: usize,
    pub time_dim_table: String,
    pub time_dim_start: NaiveDate,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            source_db_url: std::env::var("SOURCE_DB_URL")
                .context("SOURCE_DB_URL env var missing")?,
            warehouse_db_url: std::env::var("WAREHOUSE_DB_URL")
                .context("WAREHOUSE_DB_URL env var missing")?,
            max_connections: env_or("MAX_CONNECTIONS", 5),
            batch_size: env_or("BATCH_SIZE", 1000),
            retry_attempts: env_or("RETRY_ATTEMPTS", 3),
            retry_delay: Duration::from_secs(env_or("RETRY_DELAY_SECS", 5)),
            dim_workers: env_or("DIM_WORKERS", 4),
            time_dim_table: std::env::var("TIME_DIM_TABLE")
                .unwrap_or_else(|_| "dim_time".to_string()),
            time_dim_start: std::env::var("TIME_DIM_START")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| NaiveDate::from_ymd_opt(2023, 1, 1).expect("valid date")),
        })
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// =============================================================================
// Entity Mapping (JSON file)
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WarehouseConfig {
    pub version: String,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub facts: Vec<FactConfig>,
}

impl WarehouseConfig {
    pub fn dimension(&self, name: &str) -> Option<&DimensionConfig> {
        self.dimensions.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimensionConfig {
    /// Target dimension table name.
    pub name: String,
    /// Extraction query against the source database. May use the
    /// {START_DATE}/{END_DATE} placeholders.
    pub extract_sql: String,
    /// Column(s) forming the business key, in key order.
    pub business_keys: Vec<String>,
    /// Warehouse-generated identity column. Never written by the engine.
    pub surrogate_key: String,
    #[serde(default)]
    pub scd: ScdPolicy,
    /// Optional create-if-not-exists DDL run before loading.
    #[serde(default)]
    pub create_sql: Option<String>,
}

/// Slowly-changing-dimension policy, a tagged choice consumed by one merge
/// path rather than per-dimension code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScdPolicy {
    #[default]
    Type1,
    Type2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactConfig {
    /// Target fact table name.
    pub name: String,
    pub extract_sql: String,
    /// Column holding the natural event id, unique within the fact table.
    pub natural_key: String,
    #[serde(default)]
    pub create_sql: Option<String>,
    #[serde(default)]
    pub dimension_refs: Vec<DimensionRef>,
    #[serde(default)]
    pub time_keys: Vec<TimeKeyColumn>,
    #[serde(default)]
    pub duration: Option<DurationConfig>,
}

/// One staged business-key column resolved to a dimension surrogate.
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionRef {
    /// Staged column carrying the business key.
    pub column: String,
    /// Dimension table to resolve against.
    pub dimension: String,
    /// Fact column receiving the surrogate key.
    pub target: String,
    /// Optional prefix applied before lookup, for dimensions keyed by a
    /// prefixed concatenation (e.g. "O-"/"D-" address keys).
    #[serde(default)]
    pub prefix: Option<String>,
}

/// A timestamp column turned into a derived time-dimension key.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeKeyColumn {
    pub source: String,
    pub target: String,
}

/// Sequential per-group duration measure: rows sharing `group_by` are
/// ordered by `timestamp` and each row measures the minutes to the next
/// row, the last one against now.
#[derive(Debug, Clone, Deserialize)]
pub struct DurationConfig {
    pub group_by: String,
    pub timestamp: String,
    pub target: String,
}

/// Load the entity mapping from a JSON file.
pub async fn load_warehouse_config(path: &str) -> Result<WarehouseConfig> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read warehouse config {path}"))?;
    let config: WarehouseConfig =
        serde_json::from_str(&content).context("Failed to parse warehouse config")?;
    Ok(config)
}

// =============================================================================
// TESTS
// =============================================================================
