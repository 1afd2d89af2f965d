//! Cycle Orchestrator (spec.md §4.7.3, §4.8).
//!
//! Drives the state machine `IDLE → FETCH_ORDERS → [FETCH_HISTORY] → SYNC →
//! CALC_STATS → SYNC → CALC_DOCTRINES → DONE`, any stage may fall to `FAIL`.
//! Stage sequencing and the "write an UpdateLog row on every successful
//! stage" contract follow the scheduling discipline of
//! `cooprefr-bettersys::main`'s top-level run loop, generalized from a
//! polling loop to a one-shot pipeline of distinct stages.

use crate::auth::CredentialStore;
use crate::config::Settings;
use crate::derive::{doctrines, stats};
use crate::error::{CoreError, CoreResult};
use crate::ingest::orders::OrderFetchOutcome;
use crate::ingest::{history, names, orders};
use crate::store::replicated::ReplicatedStore;
use crate::store::schema::{DOCTRINES, MARKET_ORDERS, MARKET_STATS};
use crate::store::upsert::{upsert, Row};
use chrono::Utc;
use rusqlite::{types::ToSql, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    FetchOrders,
    FetchHistory,
    Sync,
    CalcStats,
    CalcDoctrines,
    Done,
}

/// Outcome of a full cycle run. `failed_at` is `None` only when `stage ==
/// Done`, per spec.md §4.8's "0 on DONE, non-zero on FAIL" contract.
#[derive(Debug)]
pub struct CycleReport {
    pub stage: Stage,
    pub failed_at: Option<Stage>,
    pub reason: Option<String>,
}

impl CycleReport {
    /// 0 on success, 2 on any in-cycle failure (validation/config failures
    /// are surfaced separately by the CLI before a cycle is even started).
    pub fn exit_code(&self) -> i32 {
        if self.failed_at.is_some() {
            2
        } else {
            0
        }
    }
}

struct CycleError {
    stage: Stage,
    source: CoreError,
}

/// Runs one full cycle against the configured market store. `fetch_history`
/// gates the optional FETCH_HISTORY stage.
pub async fn run_cycle(settings: &Settings, credentials: &CredentialStore, fetch_history: bool) -> CycleReport {
    match run_cycle_inner(settings, credentials, fetch_history).await {
        Ok(()) => CycleReport {
            stage: Stage::Done,
            failed_at: None,
            reason: None,
        },
        Err(CycleError { stage, source }) => {
            error!(?stage, reason = %source.one_line(), "cycle failed");
            CycleReport {
                stage,
                failed_at: Some(stage),
                reason: Some(source.one_line()),
            }
        }
    }
}

async fn run_cycle_inner(
    settings: &Settings,
    credentials: &CredentialStore,
    fetch_history: bool,
) -> Result<(), CycleError> {
    let alias_name = settings.market_db_alias();
    let alias = settings
        .alias(alias_name)
        .map_err(|e| at(Stage::Idle, e))?;
    let store = ReplicatedStore::open(alias_name.as_str(), alias).map_err(|e| at(Stage::Idle, e))?;
    store.verify_db_exists().await.map_err(|e| at(Stage::Idle, e))?;

    // Credential validation happens before any network I/O, per spec.md §4.8.
    let token = credentials
        .get_token("esi-markets.structure_markets.v1")
        .await
        .map_err(|e| at(Stage::Idle, e))?;

    // FETCH_ORDERS
    let orders_endpoint = format!("structure_orders:{}", settings.market.structure_id);
    let prior_etag = {
        let conn_arc = store.engine();
        let conn = conn_arc.lock().await;
        load_etag(&conn, &orders_endpoint).map_err(|e| at(Stage::FetchOrders, e))?
    };

    let fetch_outcome = orders::fetch_structure_orders(
        &settings.esi,
        settings.market.structure_id,
        &token,
        prior_etag.as_deref(),
        Some(Path::new("data/market_orders_new.json")),
    )
    .await
    .map_err(|e| at(Stage::FetchOrders, e))?;

    match fetch_outcome {
        OrderFetchOutcome::Unchanged => {
            info!("FETCH_ORDERS skipped: 304 Not Modified, no change since last cycle");
        }
        OrderFetchOutcome::Fetched { orders: raw_orders, etag } => {
            let order_type_ids: Vec<i64> = raw_orders
                .iter()
                .map(|o| o.type_id)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let order_names = names::resolve_names(&settings.esi, &order_type_ids)
                .await
                .map_err(|e| at(Stage::FetchOrders, e))?;

            {
                let conn_arc = store.engine();
                let mut conn = conn_arc.lock().await;
                persist_market_orders(&mut conn, &raw_orders, &order_names).map_err(|e| at(Stage::FetchOrders, e))?;
                write_update_log(&conn, "marketorders", raw_orders.len()).map_err(|e| at(Stage::FetchOrders, e))?;
                if let Some(etag) = etag {
                    save_etag(&conn, &orders_endpoint, &etag).map_err(|e| at(Stage::FetchOrders, e))?;
                }
            }
            info!(rows = raw_orders.len(), "FETCH_ORDERS complete");
        }
    }

    // FETCH_HISTORY (optional)
    if fetch_history {
        let watchlist_names = {
            let conn_arc = store.engine();
            let conn = conn_arc.lock().await;
            load_watchlist_names(&conn).map_err(|e| at(Stage::FetchHistory, e))?
        };
        let watchlist_ids: Vec<i64> = {
            let mut ids: Vec<i64> = watchlist_names.keys().copied().collect();
            ids.sort_unstable();
            ids
        };

        let results = history::fetch_history_fanout(&settings.esi, settings.market.region_id, &watchlist_ids)
            .await
            .map_err(|e| at(Stage::FetchHistory, e))?;

        {
            let conn_arc = store.engine();
            let mut conn = conn_arc.lock().await;
            persist_history(&mut conn, &results, &watchlist_names).map_err(|e| at(Stage::FetchHistory, e))?;
            let total: usize = results.iter().map(|r| r.data.len()).sum();
            write_update_log(&conn, "market_history", total).map_err(|e| at(Stage::FetchHistory, e))?;
        }
        info!(type_ids = watchlist_ids.len(), "FETCH_HISTORY complete");
    }

    // SYNC before CALC_STATS, with one retry on validation failure.
    sync_and_validate(&store).await.map_err(|e| at(Stage::Sync, e))?;

    // CALC_STATS
    let stat_rows = {
        let conn_arc = store.engine();
        let mut conn = conn_arc.lock().await;
        let rows = stats::calculate_market_stats(&conn, Utc::now()).map_err(|e| at(Stage::CalcStats, e))?;
        let upsert_rows: Vec<Row> = rows.iter().map(stat_row_to_upsert_row).collect();
        upsert(&mut conn, &MARKET_STATS, upsert_rows)
            .map_err(CoreError::Upsert)
            .map_err(|e| at(Stage::CalcStats, e))?;
        write_update_log(&conn, "marketstats", rows.len()).map_err(|e| at(Stage::CalcStats, e))?;
        rows
    };
    info!(rows = stat_rows.len(), "CALC_STATS complete");

    // SYNC before CALC_DOCTRINES, with one retry on validation failure.
    sync_and_validate(&store).await.map_err(|e| at(Stage::Sync, e))?;

    // CALC_DOCTRINES
    {
        let conn_arc = store.engine();
        let mut conn = conn_arc.lock().await;
        let doctrine_rows =
            doctrines::calculate_doctrine_stats(&conn, &stat_rows).map_err(|e| at(Stage::CalcDoctrines, e))?;
        let upsert_rows: Vec<Row> = doctrine_rows.iter().map(doctrine_row_to_upsert_row).collect();
        upsert(&mut conn, &DOCTRINES, upsert_rows)
            .map_err(CoreError::Upsert)
            .map_err(|e| at(Stage::CalcDoctrines, e))?;
        write_update_log(&conn, "doctrines", doctrine_rows.len()).map_err(|e| at(Stage::CalcDoctrines, e))?;
        info!(rows = doctrine_rows.len(), "CALC_DOCTRINES complete");
    }

    Ok(())
}

fn at(stage: Stage, source: CoreError) -> CycleError {
    CycleError { stage, source }
}

/// Brings the local replica up to date and requires it validate; retries
/// `sync()` at most once more on validation failure before failing the
/// cycle, per spec.md §4.8.
async fn sync_and_validate(store: &ReplicatedStore) -> CoreResult<()> {
    store.sync().await?;
    if store.validate_sync().await? {
        return Ok(());
    }
    store.sync().await?;
    if store.validate_sync().await? {
        return Ok(());
    }
    Err(CoreError::Data("replica failed to validate after retrying sync once".to_string()))
}

fn persist_market_orders(
    conn: &mut Connection,
    raw: &[orders::RawMarketOrder],
    names: &HashMap<i64, String>,
) -> CoreResult<()> {
    let rows: Vec<Row> = raw
        .iter()
        .map(|o| {
            let row: Row = vec![
                Box::new(o.order_id),
                Box::new(o.is_buy_order as i64),
                Box::new(o.type_id),
                Box::new(names.get(&o.type_id).cloned().unwrap_or_default()),
                Box::new(o.duration),
                Box::new(o.issued.clone()),
                Box::new(o.price),
                Box::new(o.volume_remain),
            ];
            row
        })
        .collect();
    upsert(conn, &MARKET_ORDERS, rows).map_err(CoreError::Upsert)
}

/// Previously-persisted `ETag` for a conditional-request endpoint, if any,
/// per spec.md §6.
fn load_etag(conn: &Connection, endpoint: &str) -> CoreResult<Option<String>> {
    conn.query_row(
        "SELECT etag FROM http_cache WHERE endpoint = ?1",
        rusqlite::params![endpoint],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| CoreError::Data(e.to_string()))
}

fn save_etag(conn: &Connection, endpoint: &str, etag: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO http_cache (endpoint, etag) VALUES (?1, ?2)
         ON CONFLICT(endpoint) DO UPDATE SET etag = excluded.etag",
        rusqlite::params![endpoint, etag],
    )
    .map_err(|e| CoreError::Data(e.to_string()))?;
    Ok(())
}

fn load_watchlist_names(conn: &Connection) -> CoreResult<HashMap<i64, String>> {
    let mut stmt = conn
        .prepare("SELECT type_id, type_name FROM watchlist")
        .map_err(|e| CoreError::Data(e.to_string()))?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))
        .map_err(|e| CoreError::Data(e.to_string()))?;
    rows.collect::<Result<HashMap<_, _>, _>>()
        .map_err(|e| CoreError::Data(e.to_string()))
}

/// History rows dedup on `UNIQUE(type_id, date)`, not on the autoincrement
/// `id` primary key, so this bypasses the generic upsert engine (which keys
/// off an explicit PK value) in favor of a direct `ON CONFLICT` against that
/// constraint.
fn persist_history(
    conn: &mut Connection,
    results: &[history::HistoryResult],
    names: &HashMap<i64, String>,
) -> CoreResult<()> {
    let tx = conn.transaction().map_err(|e| CoreError::Data(e.to_string()))?;
    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO market_history
                    (date, type_id, type_name, average, volume, highest, lowest, order_count, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(type_id, date) DO UPDATE SET
                    average = excluded.average, volume = excluded.volume,
                    highest = excluded.highest, lowest = excluded.lowest,
                    order_count = excluded.order_count, timestamp = excluded.timestamp",
            )
            .map_err(|e| CoreError::Data(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        for result in results {
            let type_name = names.get(&result.type_id).cloned().unwrap_or_default();
            for record in &result.data {
                let params: &[&dyn ToSql] = &[
                    &record.date,
                    &result.type_id,
                    &type_name,
                    &record.average,
                    &record.volume,
                    &record.highest,
                    &record.lowest,
                    &record.order_count,
                    &now,
                ];
                stmt.execute(params).map_err(|e| CoreError::Data(e.to_string()))?;
            }
        }
    }
    tx.commit().map_err(|e| CoreError::Data(e.to_string()))
}

fn write_update_log(conn: &Connection, table_name: &str, rows: usize) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO update_log (table_name, updated_at, rows) VALUES (?1, ?2, ?3)",
        rusqlite::params![table_name, Utc::now().to_rfc3339(), rows as i64],
    )
    .map_err(|e| CoreError::Data(e.to_string()))?;
    Ok(())
}

fn stat_row_to_upsert_row(r: &stats::MarketStatRow) -> Row {
    vec![
        Box::new(r.type_id),
        Box::new(r.type_name.clone()),
        Box::new(r.group_id),
        Box::new(r.group_name.clone()),
        Box::new(r.category_id),
        Box::new(r.category_name.clone()),
        Box::new(r.total_volume_remain),
        Box::new(r.min_price),
        Box::new(r.price),
        Box::new(r.avg_price),
        Box::new(r.avg_volume),
        Box::new(r.days_remaining),
        Box::new(r.last_update.clone()),
    ]
}

fn doctrine_row_to_upsert_row(r: &doctrines::DoctrineRow) -> Row {
    // `DOCTRINES.columns` leads with `id`, which is autoincrement; binding
    // NULL lets SQLite assign it since this table is wipe-and-replace and
    // never needs to match an existing id.
    vec![
        Box::new(Option::<i64>::None),
        Box::new(r.fit_id),
        Box::new(r.ship_id),
        Box::new(r.ship_name.clone()),
        Box::new(r.hulls),
        Box::new(r.type_id),
        Box::new(r.type_name.clone()),
        Box::new(r.fit_qty),
        Box::new(r.fits_on_mkt),
        Box::new(r.total_stock),
        Box::new(r.price),
        Box::new(r.avg_vol),
        Box::new(r.days),
        Box::new(r.group_id),
        Box::new(r.group_name.clone()),
        Box::new(r.category_id),
        Box::new(r.category_name.clone()),
        Box::new(r.timestamp.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_maps_done_to_zero_and_failure_to_two() {
        let ok = CycleReport {
            stage: Stage::Done,
            failed_at: None,
            reason: None,
        };
        assert_eq!(ok.exit_code(), 0);

        let failed = CycleReport {
            stage: Stage::FetchOrders,
            failed_at: Some(Stage::FetchOrders),
            reason: Some("boom".into()),
        };
        assert_eq!(failed.exit_code(), 2);
    }
}
