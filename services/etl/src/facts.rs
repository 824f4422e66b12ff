//! Fact resolver/loader.
//!
//! Resolves staged business keys against the current dimension rows, derives
//! time-dimension keys arithmetically, computes sequential per-group duration
//! measures, and replaces fact rows wholesale per natural event id. A row
//! that cannot be resolved is rejected and counted; its siblings still load.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use chrono::NaiveDateTime;
use sqlx::PgPool;

use crate::batch::{self, BatchWriter};
use crate::config::{DurationConfig, FactConfig};
use crate::error::{EtlError, RowReject};
use crate::record::{self, CellValue, Record};
use crate::timedim;

/// Business key → current surrogate key, per dimension name.
pub type KeyMaps = HashMap<String, HashMap<String, i64>>;

/// One rejected staged row: the natural event id when it could be read, and
/// the reason. Logged by the caller; never fatal to the batch.
#[derive(Debug)]
pub struct FactReject {
    pub natural_key: Option<String>,
    pub reason: RowReject,
}

#[derive(Debug, Default)]
pub struct FactResolution {
    pub rows: Vec<Record>,
    pub rejects: Vec<FactReject>,
    pub deduped: u64,
}

/// Resolve one fact table's staged rows. Pure: same staged input, key maps
/// and clock produce the same resolution.
pub fn resolve_facts(
    staged: &[Record],
    key_maps: &KeyMaps,
    cfg: &FactConfig,
    now: NaiveDateTime,
) -> FactResolution {
    let mut out = FactResolution::default();

    // In-batch duplicate event ids keep the last staged row, the same
    // tie-break the dimension merge applies, so one extraction order rules
    // both loaders.
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, &Record> = HashMap::new();
    for rec in staged {
        match rec.get(&cfg.natural_key).and_then(CellValue::as_key_text) {
            Some(key) => {
                if latest.insert(key.clone(), rec).is_some() {
                    out.deduped += 1;
                } else {
                    order.push(key);
                }
            }
            None => out.rejects.push(FactReject {
                natural_key: None,
                reason: RowReject::Transform(format!("missing natural key {}", cfg.natural_key)),
            }),
        }
    }

    'rows: for key in &order {
        let mut rec = latest[key].clone();

        // Swap each business-key column for the referenced dimension's
        // current surrogate. A null source key is an absent participant and
        // becomes a null FK; a present but unknown key rejects the row.
        for dim_ref in &cfg.dimension_refs {
            let source = rec.remove(&dim_ref.column).unwrap_or(CellValue::Null);
            match source.as_key_text() {
                None => {
                    rec.insert(dim_ref.target.clone(), CellValue::Null);
                }
                Some(text) => {
                    let lookup = match &dim_ref.prefix {
                        Some(prefix) => format!("{prefix}{text}"),
                        None => text,
                    };
                    match key_maps.get(&dim_ref.dimension).and_then(|m| m.get(&lookup)) {
                        Some(surrogate) => {
                            rec.insert(dim_ref.target.clone(), CellValue::Int(*surrogate));
                        }
                        None => {
                            out.rejects.push(FactReject {
                                natural_key: Some(key.clone()),
                                reason: RowReject::Referential {
                                    dimension: dim_ref.dimension.clone(),
                                    key: lookup,
                                },
                            });
                            continue 'rows;
                        }
                    }
                }
            }
        }

        // Time keys share the generator's formula, so the join needs no
        // lookup. The source timestamp stays on the row as an attribute.
        for time_key_col in &cfg.time_keys {
            let source = rec.get(&time_key_col.source).cloned().unwrap_or(CellValue::Null);
            if source.is_null() {
                rec.insert(time_key_col.target.clone(), CellValue::Null);
            } else {
                match source.as_timestamp() {
                    Some(ts) => {
                        rec.insert(
                            time_key_col.target.clone(),
                            CellValue::Int(timedim::time_key(ts)),
                        );
                    }
                    None => {
                        out.rejects.push(FactReject {
                            natural_key: Some(key.clone()),
                            reason: RowReject::Transform(format!(
                                "unparseable timestamp in {}",
                                time_key_col.source
                            )),
                        });
                        continue 'rows;
                    }
                }
            }
        }

        out.rows.push(rec);
    }

    if let Some(measure) = &cfg.duration {
        assign_durations(&mut out.rows, measure, now);
    }

    out
}

/// (start, end, whole minutes) windows for an ordered event sequence: each
/// event measures to the next one's timestamp, the last against `now`.
pub fn duration_windows(
    times: &[NaiveDateTime],
    now: NaiveDateTime,
) -> Vec<(NaiveDateTime, NaiveDateTime, i64)> {
    let mut out = Vec::with_capacity(times.len());
    for (idx, start) in times.iter().enumerate() {
        let end = times.get(idx + 1).copied().unwrap_or(now);
        out.push((*start, end, (end - *start).num_minutes()));
    }
    out
}

/// Attach the configured duration measure to every resolved row. Rows share
/// a group, sort by the configured timestamp, and measure to the next event;
/// rows without a group or a parseable timestamp carry a null measure.
fn assign_durations(rows: &mut [Record], measure: &DurationConfig, now: NaiveDateTime) {
    let mut groups: HashMap<String, Vec<(usize, NaiveDateTime)>> = HashMap::new();
    for (idx, rec) in rows.iter().enumerate() {
        let group = rec.get(&measure.group_by).and_then(CellValue::as_key_text);
        let ts = rec.get(&measure.timestamp).and_then(CellValue::as_timestamp);
        if let (Some(group), Some(ts)) = (group, ts) {
            groups.entry(group).or_default().push((idx, ts));
        }
    }

    for rec in rows.iter_mut() {
        rec.insert(measure.target.clone(), CellValue::Null);
    }

    for entries in groups.values_mut() {
        // Stable sort: timestamp ties keep the staged order.
        entries.sort_by_key(|&(_, ts)| ts);
        let times: Vec<NaiveDateTime> = entries.iter().map(|&(_, ts)| ts).collect();
        for ((idx, _), (_, _, minutes)) in entries.iter().zip(duration_windows(&times, now)) {
            rows[*idx].insert(measure.target.clone(), CellValue::Int(minutes));
        }
    }
}

/// Load resolved rows: per chunk, delete any existing fact rows sharing the
/// chunk's natural event ids, then insert the recomputed rows, in one
/// transaction. Reprocessing an event replaces its row instead of
/// duplicating it.
pub async fn load_facts(
    pool: &PgPool,
    writer: &BatchWriter,
    cfg: &FactConfig,
    rows: &[Record],
    cancel: &AtomicBool,
) -> Result<u64, EtlError> {
    let columns = match rows.first() {
        Some(first) => record::column_names(first),
        None => return Ok(0),
    };

    writer
        .write_chunks(&cfg.name, rows, cancel, |chunk| {
            let pool = pool.clone();
            let table = cfg.name.clone();
            let natural_key = cfg.natural_key.clone();
            let columns = columns.clone();
            async move {
                let mut tx = pool.begin().await?;

                let delete_sql = batch::delete_in_sql(&table, &natural_key, chunk.len());
                let mut delete = sqlx::query(&delete_sql);
                for rec in chunk {
                    delete =
                        record::bind_cell(delete, rec.get(&natural_key).unwrap_or(&CellValue::Null));
                }
                delete.execute(&mut *tx).await?;

                let insert_sql = batch::insert_sql(&table, &columns, chunk.len(), "");
                let mut insert = sqlx::query(&insert_sql);
                for rec in chunk {
                    for col in &columns {
                        insert = record::bind_cell(insert, rec.get(col).unwrap_or(&CellValue::Null));
                    }
                }
                let done = insert.execute(&mut *tx).await?;
                tx.commit().await?;
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
    use crate::config::{DimensionRef, TimeKeyColumn};
    use chrono::NaiveDate;

    fn cfg() -> FactConfig {
        FactConfig {
            name: "fact_service".into(),
            extract_sql: "SELECT * FROM service ORDER BY service_id".into(),
            natural_key: "service_id".into(),
            create_sql: None,
            dimension_refs: vec![DimensionRef {
                column: "client_id".into(),
                dimension: "dim_client".into(),
                target: "dk_client".into(),
                prefix: None,
            }],
            time_keys: vec![TimeKeyColumn {
                source: "requested_at".into(),
                target: "tk_requested".into(),
            }],
            duration: None,
        }
    }

    fn key_maps(pairs: &[(&str, i64)]) -> KeyMaps {
        let mut maps = KeyMaps::new();
        maps.insert(
            "dim_client".into(),
            pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        );
        maps
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn now() -> NaiveDateTime {
        at(2024, 5, 1, 12, 0)
    }

    fn service(id: i64, client: CellValue, requested: CellValue) -> Record {
        let mut rec = Record::new();
        rec.insert("service_id".into(), CellValue::Int(id));
        rec.insert("client_id".into(), client);
        rec.insert("requested_at".into(), requested);
        rec
    }

    // -------------------------------------------------------------------------
    // Surrogate resolution
    // -------------------------------------------------------------------------

    #[test]
    fn resolves_surrogates_and_drops_source_keys() {
        let staged = vec![service(
            1,
            CellValue::Int(7),
            CellValue::Timestamp(at(2024, 1, 15, 12, 30)),
        )];
        let out = resolve_facts(&staged, &key_maps(&[("7", 70)]), &cfg(), now());

        assert_eq!(out.rows.len(), 1);
        assert!(out.rejects.is_empty());
        let row = &out.rows[0];
        assert_eq!(row.get("dk_client"), Some(&CellValue::Int(70)));
        assert!(row.get("client_id").is_none());
        assert_eq!(row.get("tk_requested"), Some(&CellValue::Int(202401151230)));
    }

    #[test]
    fn null_business_key_is_an_absent_participant() {
        let staged = vec![service(
            1,
            CellValue::Null,
            CellValue::Timestamp(at(2024, 1, 15, 12, 30)),
        )];
        let out = resolve_facts(&staged, &key_maps(&[("7", 70)]), &cfg(), now());

        assert_eq!(out.rows.len(), 1);
        assert!(out.rejects.is_empty());
        assert_eq!(out.rows[0].get("dk_client"), Some(&CellValue::Null));
    }

    #[test]
    fn unresolved_key_rejects_the_row_but_siblings_load() {
        let staged = vec![
            service(1, CellValue::Int(7), CellValue::Timestamp(at(2024, 1, 15, 12, 30))),
            service(2, CellValue::Int(99), CellValue::Timestamp(at(2024, 1, 15, 13, 0))),
        ];
        let out = resolve_facts(&staged, &key_maps(&[("7", 70)]), &cfg(), now());

        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].get("service_id"), Some(&CellValue::Int(1)));
        assert_eq!(out.rejects.len(), 1);
        let reject = &out.rejects[0];
        assert_eq!(reject.natural_key.as_deref(), Some("2"));
        assert_eq!(
            reject.reason,
            RowReject::Referential {
                dimension: "dim_client".into(),
                key: "99".into(),
            }
        );
    }

    #[test]
    fn prefixed_keys_resolve_against_composite_dimensions() {
        let mut fact = cfg();
        fact.dimension_refs = vec![DimensionRef {
            column: "origin_id".into(),
            dimension: "dim_client".into(),
            target: "dk_origin".into(),
            prefix: Some("O-".into()),
        }];
        let mut rec = Record::new();
        rec.insert("service_id".into(), CellValue::Int(1));
        rec.insert("origin_id".into(), CellValue::Int(7));
        rec.insert("requested_at".into(), CellValue::Timestamp(at(2024, 1, 15, 12, 30)));

        let out = resolve_facts(&[rec], &key_maps(&[("O-7", 700)]), &fact, now());
        assert_eq!(out.rows[0].get("dk_origin"), Some(&CellValue::Int(700)));
    }

    // -------------------------------------------------------------------------
    // Time keys
    // -------------------------------------------------------------------------

    #[test]
    fn null_timestamp_yields_null_time_key() {
        let staged = vec![service(1, CellValue::Int(7), CellValue::Null)];
        let out = resolve_facts(&staged, &key_maps(&[("7", 70)]), &cfg(), now());

        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].get("tk_requested"), Some(&CellValue::Null));
    }

    #[test]
    fn unparseable_timestamp_rejects_the_row() {
        let staged = vec![service(
            1,
            CellValue::Int(7),
            CellValue::Text("not a timestamp".into()),
        )];
        let out = resolve_facts(&staged, &key_maps(&[("7", 70)]), &cfg(), now());

        assert!(out.rows.is_empty());
        assert_eq!(out.rejects.len(), 1);
        assert!(matches!(out.rejects[0].reason, RowReject::Transform(_)));
    }

    // -------------------------------------------------------------------------
    // Natural event ids
    // -------------------------------------------------------------------------

    #[test]
    fn duplicate_event_ids_keep_the_last_staged_row() {
        let staged = vec![
            service(1, CellValue::Int(7), CellValue::Timestamp(at(2024, 1, 15, 12, 0))),
            service(1, CellValue::Int(7), CellValue::Timestamp(at(2024, 1, 15, 13, 0))),
        ];
        let out = resolve_facts(&staged, &key_maps(&[("7", 70)]), &cfg(), now());

        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.deduped, 1);
        assert_eq!(out.rows[0].get("tk_requested"), Some(&CellValue::Int(202401151300)));
    }

    #[test]
    fn missing_event_id_is_a_transform_reject() {
        let mut rec = Record::new();
        rec.insert("service_id".into(), CellValue::Null);
        rec.insert("client_id".into(), CellValue::Int(7));
        rec.insert("requested_at".into(), CellValue::Null);

        let out = resolve_facts(&[rec], &key_maps(&[("7", 70)]), &cfg(), now());
        assert!(out.rows.is_empty());
        assert_eq!(out.rejects.len(), 1);
        assert!(out.rejects[0].natural_key.is_none());
    }

    // -------------------------------------------------------------------------
    // Durations: each event measures to the next, the last against now
    // -------------------------------------------------------------------------

    #[test]
    fn windows_measure_to_next_event_then_now() {
        let t0 = at(2024, 1, 15, 10, 0);
        let t1 = at(2024, 1, 15, 10, 45);
        let t2 = at(2024, 1, 15, 11, 30);
        let windows = duration_windows(&[t0, t1, t2], now());

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], (t0, t1, 45));
        assert_eq!(windows[1], (t1, t2, 45));
        assert_eq!(windows[2], (t2, now(), 30));
    }

    #[test]
    fn single_event_measures_against_now() {
        let t0 = at(2024, 5, 1, 11, 0);
        let windows = duration_windows(&[t0], now());
        assert_eq!(windows, vec![(t0, now(), 60)]);
    }

    fn status_cfg() -> FactConfig {
        FactConfig {
            name: "fact_service_status".into(),
            extract_sql: "SELECT * FROM service_status ORDER BY status_id".into(),
            natural_key: "status_id".into(),
            create_sql: None,
            dimension_refs: vec![],
            time_keys: vec![],
            duration: Some(DurationConfig {
                group_by: "service_id".into(),
                timestamp: "status_at".into(),
                target: "status_minutes".into(),
            }),
        }
    }

    fn status(id: i64, service: i64, ts: CellValue) -> Record {
        let mut rec = Record::new();
        rec.insert("status_id".into(), CellValue::Int(id));
        rec.insert("service_id".into(), CellValue::Int(service));
        rec.insert("status_at".into(), ts);
        rec
    }

    #[test]
    fn durations_are_assigned_per_group_in_timestamp_order() {
        // Two interleaved services, staged out of timestamp order.
        let staged = vec![
            status(3, 1, CellValue::Timestamp(at(2024, 5, 1, 11, 30))),
            status(4, 2, CellValue::Timestamp(at(2024, 5, 1, 11, 0))),
            status(1, 1, CellValue::Timestamp(at(2024, 5, 1, 10, 0))),
            status(2, 1, CellValue::Timestamp(at(2024, 5, 1, 10, 45))),
        ];
        let out = resolve_facts(&staged, &KeyMaps::new(), &status_cfg(), now());
        assert_eq!(out.rows.len(), 4);

        let minutes: HashMap<i64, CellValue> = out
            .rows
            .iter()
            .map(|r| {
                let id = match r.get("status_id") {
                    Some(CellValue::Int(id)) => *id,
                    other => panic!("unexpected id {other:?}"),
                };
                (id, r.get("status_minutes").cloned().unwrap())
            })
            .collect();

        assert_eq!(minutes[&1], CellValue::Int(45));
        assert_eq!(minutes[&2], CellValue::Int(45));
        assert_eq!(minutes[&3], CellValue::Int(30));
        // The other service has a single event, measured against now.
        assert_eq!(minutes[&4], CellValue::Int(60));
    }

    #[test]
    fn rows_outside_a_sequence_carry_a_null_measure() {
        let staged = vec![status(1, 1, CellValue::Null)];
        let out = resolve_facts(&staged, &KeyMaps::new(), &status_cfg(), now());
        assert_eq!(out.rows[0].get("status_minutes"), Some(&CellValue::Null));
    }

    #[test]
    fn replaying_with_a_new_event_recomputes_all_durations() {
        let history = vec![
            status(1, 1, CellValue::Timestamp(at(2024, 5, 1, 10, 0))),
            status(2, 1, CellValue::Timestamp(at(2024, 5, 1, 10, 45))),
        ];
        let first = resolve_facts(&history, &KeyMaps::new(), &status_cfg(), now());
        assert_eq!(first.rows[1].get("status_minutes"), Some(&CellValue::Int(75)));

        // A third status is recorded; the full history replays and the old
        // open-ended measure closes.
        let mut replayed = history.clone();
        replayed.push(status(3, 1, CellValue::Timestamp(at(2024, 5, 1, 11, 30))));
        let second = resolve_facts(&replayed, &KeyMaps::new(), &status_cfg(), now());

        assert_eq!(second.rows[0].get("status_minutes"), Some(&CellValue::Int(45)));
        assert_eq!(second.rows[1].get("status_minutes"), Some(&CellValue::Int(45)));
        assert_eq!(second.rows[2].get("status_minutes"), Some(&CellValue::Int(30)));
    }
}
