//! Warehouse ETL Service - Loads operational messaging data into the star schema
//!
//! Responsibilities:
//! - Extract configured source tables into per-run staging
//! - Merge staged rows into dimensions (type-1 overwrite or type-2 versioning)
//! - Generate the dense minute-grain time dimension
//! - Resolve fact rows to current surrogate keys and load them idempotently
//! - Track every run and its per-table counters for auditing
//!
//! Usage:
//!   # Full run over the default range:
//!   cargo run --bin etl -- --config config/warehouse.json
//!
//!   # Explicit date range:
//!   cargo run --bin etl -- --config config/warehouse.json --start-date 2024-01-01 --end-date 2024-02-01
//!
//!   # Extract and plan without writing:
//!   cargo run --bin etl -- --config config/warehouse.json --dry-run

mod batch;
mod config;
mod dims;
mod error;
mod facts;
mod record;
mod staging;
mod timedim;
mod tracker;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::batch::BatchWriter;
use crate::config::{DimensionConfig, FactConfig, Settings, WarehouseConfig};
use crate::error::EtlError;
use crate::tracker::{RunStatus, RunTracker, TableCounts, TableStatus};

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads operational data into the warehouse star schema")]
struct Args {
    /// Path to the warehouse entity mapping (JSON)
    #[arg(long)]
    config: String,

    /// Start of the run's date range (defaults to TIME_DIM_START)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// End of the run's date range (defaults to today)
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Dry run - extract and plan but write nothing, record no run
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

/// Explicit per-run state threaded through every step. Nothing is global, so
/// sequential runs never leak into each other.
#[derive(Clone)]
struct RunContext {
    run_id: Uuid,
    start: NaiveDate,
    end: NaiveDate,
    now: NaiveDateTime,
    cancel: Arc<AtomicBool>,
    dry_run: bool,
}

impl RunContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Every fact reference must name a configured dimension; catching a broken
/// mapping up front beats rejecting every fact row at load time.
fn validate_config(cfg: &WarehouseConfig) -> Result<()> {
    for fact in &cfg.facts {
        for dim_ref in &fact.dimension_refs {
            if cfg.dimension(&dim_ref.dimension).is_none() {
                anyhow::bail!(
                    "fact {} references unknown dimension {}",
                    fact.name,
                    dim_ref.dimension
                );
            }
        }
    }
    Ok(())
}

/// Create-if-not-exists pass: the time dimension table (engine-owned) plus
/// whatever DDL the entity mapping supplies. Configured DDL may carry
/// multiple statements (table plus indexes), so it runs unprepared.
async fn run_ddl(warehouse: &PgPool, settings: &Settings, cfg: &WarehouseConfig) -> Result<()> {
    sqlx::raw_sql(&timedim::create_sql(&settings.time_dim_table))
        .execute(warehouse)
        .await
        .context("Failed to create time dimension table")?;

    for create_sql in cfg
        .dimensions
        .iter()
        .filter_map(|d| d.create_sql.as_deref())
        .chain(cfg.facts.iter().filter_map(|f| f.create_sql.as_deref()))
    {
        sqlx::raw_sql(create_sql)
            .execute(warehouse)
            .await
            .context("Failed to run configured DDL")?;
    }
    Ok(())
}

/// Extract, plan and apply one dimension. Returns the step's counters.
async fn process_dimension(
    source: PgPool,
    warehouse: PgPool,
    writer: BatchWriter,
    cfg: DimensionConfig,
    ctx: RunContext,
) -> Result<TableCounts, EtlError> {
    if ctx.cancelled() {
        return Err(EtlError::Cancelled {
            table: cfg.name.clone(),
        });
    }

    let staged =
        staging::extract_table(&source, &cfg.name, &cfg.extract_sql, ctx.start, ctx.end).await?;
    let read = staged.rows.len() as u64;

    let existing = dims::load_current_rows(&warehouse, &cfg)
        .await
        .map_err(|e| EtlError::Extraction {
            table: cfg.name.clone(),
            source: e,
        })?;

    let plan = dims::plan_merge(&staged.rows, &existing, &cfg, ctx.now);
    println!(
        "  [{}] plan: {} insert, {} update, {} close, {} unchanged, {} deduped, {} rejected",
        staged.name,
        plan.inserts.len(),
        plan.updates.len(),
        plan.closes.len(),
        plan.unchanged,
        plan.deduped,
        plan.rejected
    );

    let written = if ctx.dry_run {
        0
    } else {
        dims::apply_merge(&warehouse, &writer, &cfg, &plan, ctx.now, &ctx.cancel).await?
    };

    Ok(TableCounts {
        read,
        written,
        rejected: plan.rejected,
    })
}

/// Extract, resolve and load one fact table. The caller has already checked
/// that every referenced dimension loaded successfully this run.
async fn process_fact(
    source: &PgPool,
    warehouse: &PgPool,
    writer: &BatchWriter,
    warehouse_cfg: &WarehouseConfig,
    cfg: &FactConfig,
    ctx: &RunContext,
) -> Result<TableCounts, EtlError> {
    if ctx.cancelled() {
        return Err(EtlError::Cancelled {
            table: cfg.name.clone(),
        });
    }

    let staged =
        staging::extract_table(source, &cfg.name, &cfg.extract_sql, ctx.start, ctx.end).await?;
    let read = staged.rows.len() as u64;

    let mut key_maps = facts::KeyMaps::new();
    for dim_ref in &cfg.dimension_refs {
        if key_maps.contains_key(&dim_ref.dimension) {
            continue;
        }
        let Some(dim_cfg) = warehouse_cfg.dimension(&dim_ref.dimension) else {
            continue; // rejected at startup by validate_config
        };
        let map = dims::load_key_map(warehouse, dim_cfg)
            .await
            .map_err(|e| EtlError::Extraction {
                table: cfg.name.clone(),
                source: e,
            })?;
        key_maps.insert(dim_ref.dimension.clone(), map);
    }

    let resolution = facts::resolve_facts(&staged.rows, &key_maps, cfg, ctx.now);
    for reject in &resolution.rejects {
        eprintln!(
            "  [{}] rejected {}: {}",
            cfg.name,
            reject.natural_key.as_deref().unwrap_or("<no id>"),
            reject.reason
        );
    }
    println!(
        "  [{}] resolved {} of {} rows ({} rejected, {} deduped)",
        cfg.name,
        resolution.rows.len(),
        read,
        resolution.rejects.len(),
        resolution.deduped
    );

    let written = if ctx.dry_run {
        0
    } else {
        facts::load_facts(warehouse, writer, cfg, &resolution.rows, &ctx.cancel).await?
    };

    Ok(TableCounts {
        read,
        written,
        rejected: resolution.rejects.len() as u64,
    })
}

/// Execute the run's steps in order: DDL, time dimension, dimensions under a
/// bounded worker pool, then facts gated on their dimensions. Returns whether
/// every table step finished ok.
async fn execute_run(
    source: &PgPool,
    warehouse: &PgPool,
    settings: &Settings,
    warehouse_cfg: &WarehouseConfig,
    ctx: &RunContext,
    tracker: Option<&RunTracker>,
) -> Result<bool> {
    let writer = BatchWriter::from_settings(settings);
    let mut all_ok = true;

    if !ctx.dry_run {
        run_ddl(warehouse, settings, warehouse_cfg).await?;
    }

    // Time dimension first. Fact time keys are derived with the same formula,
    // so the calendar covers every minute of the run's date range.
    println!("\n=== Time Dimension ===");
    let range_start = ctx.start.and_time(NaiveTime::MIN);
    let range_end = ctx
        .end
        .succ_opt()
        .unwrap_or(ctx.end)
        .and_time(NaiveTime::MIN);
    let time_rows = timedim::generate(range_start, range_end);
    println!(
        "  [{}] {} minute rows over {} to {}",
        settings.time_dim_table,
        time_rows.len(),
        ctx.start,
        ctx.end
    );

    let time_counts = TableCounts {
        read: time_rows.len() as u64,
        ..Default::default()
    };
    if ctx.dry_run {
        println!("  [{}] dry run - nothing written", settings.time_dim_table);
    } else {
        match timedim::load(warehouse, &writer, &settings.time_dim_table, &time_rows, &ctx.cancel)
            .await
        {
            Ok(written) => {
                println!("  ✓ [{}] {} new rows", settings.time_dim_table, written);
                if let Some(tracker) = tracker {
                    tracker
                        .record_table(
                            &settings.time_dim_table,
                            TableStatus::Ok,
                            TableCounts { written, ..time_counts },
                            None,
                        )
                        .await?;
                }
            }
            Err(e) => {
                eprintln!("  ✗ [{}] {}", settings.time_dim_table, e);
                all_ok = false;
                if let Some(tracker) = tracker {
                    tracker
                        .record_table(
                            &settings.time_dim_table,
                            TableStatus::Failed,
                            time_counts,
                            Some(&e.to_string()),
                        )
                        .await?;
                }
            }
        }
    }

    // Independent dimensions run concurrently under a bounded worker pool.
    println!("\n=== Dimensions ===");
    let semaphore = Arc::new(Semaphore::new(settings.dim_workers.max(1)));
    let mut handles = Vec::new();
    for dim_cfg in warehouse_cfg.dimensions.iter().cloned() {
        let semaphore = semaphore.clone();
        let source = source.clone();
        let warehouse = warehouse.clone();
        let writer = writer.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let name = dim_cfg.name.clone();
            let result = process_dimension(source, warehouse, writer, dim_cfg, ctx).await;
            (name, result)
        }));
    }

    let mut failed_dimensions: BTreeSet<String> = BTreeSet::new();
    for handle in handles {
        let (name, result) = handle.await.context("dimension worker panicked")?;
        match result {
            Ok(counts) => {
                println!(
                    "  ✓ [{}] {} read, {} written, {} rejected",
                    name, counts.read, counts.written, counts.rejected
                );
                if let Some(tracker) = tracker {
                    tracker.record_table(&name, TableStatus::Ok, counts, None).await?;
                }
            }
            Err(e) => {
                eprintln!("  ✗ [{}] {}", name, e);
                all_ok = false;
                if let Some(tracker) = tracker {
                    tracker
                        .record_table(
                            &name,
                            TableStatus::Failed,
                            TableCounts::default(),
                            Some(&e.to_string()),
                        )
                        .await?;
                }
                failed_dimensions.insert(name);
            }
        }
    }

    // Facts wait for every dimension they reference; a fact whose dimension
    // failed is skipped with the dependency recorded, not loaded against
    // stale keys.
    println!("\n=== Facts ===");
    for fact_cfg in &warehouse_cfg.facts {
        let blocked: BTreeSet<&str> = fact_cfg
            .dimension_refs
            .iter()
            .filter(|r| failed_dimensions.contains(&r.dimension))
            .map(|r| r.dimension.as_str())
            .collect();
        if !blocked.is_empty() {
            let reason = format!(
                "dimension(s) failed this run: {}",
                blocked.into_iter().collect::<Vec<_>>().join(", ")
            );
            eprintln!("  - [{}] skipped: {}", fact_cfg.name, reason);
            all_ok = false;
            if let Some(tracker) = tracker {
                tracker
                    .record_table(
                        &fact_cfg.name,
                        TableStatus::Skipped,
                        TableCounts::default(),
                        Some(&reason),
                    )
                    .await?;
            }
            continue;
        }

        match process_fact(source, warehouse, &writer, warehouse_cfg, fact_cfg, ctx).await {
            Ok(counts) => {
                println!(
                    "  ✓ [{}] {} read, {} written, {} rejected",
                    fact_cfg.name, counts.read, counts.written, counts.rejected
                );
                if let Some(tracker) = tracker {
                    tracker
                        .record_table(&fact_cfg.name, TableStatus::Ok, counts, None)
                        .await?;
                }
            }
            Err(e) => {
                eprintln!("  ✗ [{}] {}", fact_cfg.name, e);
                all_ok = false;
                if let Some(tracker) = tracker {
                    tracker
                        .record_table(
                            &fact_cfg.name,
                            TableStatus::Failed,
                            TableCounts::default(),
                            Some(&e.to_string()),
                        )
                        .await?;
                }
            }
        }
    }

    Ok(all_ok)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::from_env()?;

    println!("=== Warehouse ETL ===");

    let warehouse_cfg = config::load_warehouse_config(&args.config).await?;
    println!("Config version: {}", warehouse_cfg.version);
    println!(
        "Entities: {} dimension(s), {} fact(s)",
        warehouse_cfg.dimensions.len(),
        warehouse_cfg.facts.len()
    );
    validate_config(&warehouse_cfg)?;

    let source = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.source_db_url)
        .await
        .context("Failed to connect to source database")?;
    let warehouse = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.warehouse_db_url)
        .await
        .context("Failed to connect to warehouse database")?;

    let now = Local::now().naive_local();
    let start = args.start_date.unwrap_or(settings.time_dim_start);
    let end = args.end_date.unwrap_or_else(|| now.date());
    println!("Date range: {} to {}", start, end);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancellation requested; stopping at the next chunk boundary");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let ctx = RunContext {
        run_id: Uuid::new_v4(),
        start,
        end,
        now,
        cancel,
        dry_run: args.dry_run,
    };

    let tracker = if args.dry_run {
        println!("Dry run - no writes, no run record");
        None
    } else {
        let tracker = RunTracker::start(&warehouse, ctx.run_id, now).await?;
        println!("Run: {}", ctx.run_id);
        Some(tracker)
    };

    let result = execute_run(&source, &warehouse, &settings, &warehouse_cfg, &ctx, tracker.as_ref())
        .await;

    // Finalize the run exactly once, whatever happened, so an aborted run
    // never stays `running` and blocks the next one.
    if let Some(tracker) = &tracker {
        let status = match &result {
            Ok(true) => RunStatus::Succeeded,
            _ => RunStatus::Failed,
        };
        tracker.finish(status, Local::now().naive_local()).await?;
    }

    println!("\n=== Run Summary ===");
    println!("Run: {}", ctx.run_id);
    match result {
        Ok(true) => {
            println!("Status: succeeded");
            Ok(())
        }
        Ok(false) => {
            println!("Status: failed (one or more table steps failed)");
            anyhow::bail!("run {} finished with failed tables", ctx.run_id)
        }
        Err(e) => {
            println!("Status: failed");
            Err(e)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_catches_unknown_dimension_refs() {
        let json = r#"{
            "version": "1",
            "dimensions": [],
            "facts": [
                {
                    "name": "fact_service",
                    "extract_sql": "SELECT 1",
                    "natural_key": "service_id",
                    "dimension_refs": [
                        {"column": "client_id", "dimension": "dim_client", "target": "dk_client"}
                    ]
                }
            ]
        }"#;
        let cfg: WarehouseConfig = serde_json::from_str(json).unwrap();
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("dim_client"));
    }
}
