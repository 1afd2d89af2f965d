//! Fit Updater (spec.md §4.10).
//!
//! Grounded in `original_source/src/mkts_backend/utils/parse_fits.py`
//! (parsing + type_id resolution via the SDE, `process_fit`'s item shape)
//! and `original_source/src/mkts_backend/utils/doctrine_update.py`
//! (`DoctrineFit`/`add_ship_target`/`add_doctrine_map_from_fittings_doctrine_fittings`/
//! `add_hurricane_fleet_issue_to_doctrines` for the doctrine-row shape and
//! the `ship_targets`/`doctrine_map` tables it writes into).

use crate::fit::eft::parse_eft;
use crate::error::{CoreError, CoreResult};
use crate::sde::StaticCatalogue;
use crate::watchlist::{self, Target};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone)]
pub struct FitMetadata {
    pub description: String,
    pub name: String,
    pub fit_id: i64,
    pub doctrine_id: i64,
    pub ship_target: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedItem {
    pub flag: String,
    pub type_id: i64,
    pub type_name: String,
    pub quantity: i64,
}

/// Result of parsing + resolving a fit file, returned as-is for `dry_run`
/// and used to drive the writes otherwise.
#[derive(Debug, Clone, Default)]
pub struct FitPreview {
    pub ship_type_id: Option<i64>,
    pub items: Vec<ResolvedItem>,
    pub missing_items: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FitUpdateOutcome {
    pub preview: FitPreview,
    pub watchlist_additions: Vec<i64>,
}

/// Creates the fittings-store tables and the market-store `ship_targets`
/// table this module owns, if they don't already exist.
pub fn create_fit_tables(fittings_conn: &Connection, market_conn: &Connection) -> rusqlite::Result<()> {
    fittings_conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS fittings_fitting (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            ship_type_id INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fittings_fittingitem (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fit_id INTEGER NOT NULL,
            flag TEXT NOT NULL,
            type_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fittings_doctrine (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fittings_doctrine_fittings (
            doctrine_id INTEGER NOT NULL,
            fitting_id INTEGER NOT NULL
        );
        ",
    )?;

    market_conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS doctrine_map (
            doctrine_id INTEGER NOT NULL,
            fit_id INTEGER NOT NULL,
            UNIQUE(doctrine_id, fit_id)
        );
        CREATE TABLE IF NOT EXISTS ship_targets (
            fit_id INTEGER PRIMARY KEY,
            fit_name TEXT NOT NULL,
            ship_id INTEGER NOT NULL,
            ship_name TEXT NOT NULL,
            ship_target INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        ",
    )
}

/// Parses and resolves a fit against the static catalogue. Always safe to
/// call; performs no writes.
pub async fn preview_fit(catalogue: &dyn StaticCatalogue, fit_text: &str) -> FitPreview {
    let parsed = parse_eft(fit_text);
    let ship_type_id = catalogue.lookup_by_name(&parsed.ship_name).await.map(|t| t.type_id);

    let mut items = Vec::new();
    let mut missing_items = Vec::new();
    for item in parsed.items {
        match catalogue.lookup_by_name(&item.item_name).await {
            Some(inv) => items.push(ResolvedItem {
                flag: item.flag,
                type_id: inv.type_id,
                type_name: inv.type_name,
                quantity: item.quantity,
            }),
            None => missing_items.push(item.item_name),
        }
    }

    FitPreview {
        ship_type_id,
        items,
        missing_items,
    }
}

/// `update_fit(fit_id, fit_file, metadata, target, clear_existing, dry_run)`.
/// `dry_run=true` returns the preview only; no writes are performed.
#[allow(clippy::too_many_arguments)]
pub async fn update_fit(
    fittings_conn: &mut Connection,
    market_conn: &mut Connection,
    catalogue: &dyn StaticCatalogue,
    fit_text: &str,
    metadata: &FitMetadata,
    _target: Target,
    clear_existing: bool,
    dry_run: bool,
) -> CoreResult<FitUpdateOutcome> {
    let preview = preview_fit(catalogue, fit_text).await;

    if dry_run {
        return Ok(FitUpdateOutcome {
            preview,
            watchlist_additions: Vec::new(),
        });
    }

    let ship_type_id = preview
        .ship_type_id
        .ok_or_else(|| CoreError::Data("fit updater: ship name did not resolve to a type_id".to_string()))?;

    upsert_fitting_header(fittings_conn, metadata, ship_type_id)?;

    if clear_existing {
        fittings_conn
            .execute("DELETE FROM fittings_fittingitem WHERE fit_id = ?1", [metadata.fit_id])
            .map_err(|e| CoreError::Data(e.to_string()))?;
    }

    for item in &preview.items {
        fittings_conn
            .execute(
                "INSERT INTO fittings_fittingitem (fit_id, flag, type_id, quantity) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![metadata.fit_id, item.flag, item.type_id, item.quantity],
            )
            .map_err(|e| CoreError::Data(e.to_string()))?;
    }

    ensure_doctrine_map(market_conn, metadata.doctrine_id, metadata.fit_id)?;

    let ship_name = catalogue_name_lookup(catalogue, ship_type_id).await.unwrap_or_default();
    upsert_ship_target(market_conn, metadata, ship_type_id, &ship_name)?;

    rebuild_doctrine_rows(market_conn, metadata, ship_type_id, &ship_name, &preview.items)?;

    let mut ids: HashSet<i64> = preview.items.iter().map(|i| i.type_id).collect();
    ids.insert(ship_type_id);
    let report = watchlist::add_to_watchlist(market_conn, catalogue, &ids, Target::Local).await?;

    info!(fit_id = metadata.fit_id, added = report.added.len(), "fit update complete");

    Ok(FitUpdateOutcome {
        preview,
        watchlist_additions: report.added,
    })
}

async fn catalogue_name_lookup(catalogue: &dyn StaticCatalogue, type_id: i64) -> Option<String> {
    catalogue.lookup_by_id(type_id).await.map(|t| t.type_name)
}

fn upsert_fitting_header(conn: &Connection, metadata: &FitMetadata, ship_type_id: i64) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO fittings_fitting (id, name, description, ship_type_id) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description,
            ship_type_id = excluded.ship_type_id",
        rusqlite::params![metadata.fit_id, metadata.name, metadata.description, ship_type_id],
    )
    .map_err(|e| CoreError::Data(e.to_string()))?;
    Ok(())
}

fn ensure_doctrine_map(conn: &Connection, doctrine_id: i64, fit_id: i64) -> CoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO doctrine_map (doctrine_id, fit_id) VALUES (?1, ?2)",
        [doctrine_id, fit_id],
    )
    .map_err(|e| CoreError::Data(e.to_string()))?;
    Ok(())
}

fn upsert_ship_target(conn: &Connection, metadata: &FitMetadata, ship_id: i64, ship_name: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO ship_targets (fit_id, fit_name, ship_id, ship_name, ship_target, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(fit_id) DO UPDATE SET fit_name = excluded.fit_name, ship_id = excluded.ship_id,
            ship_name = excluded.ship_name, ship_target = excluded.ship_target",
        rusqlite::params![
            metadata.fit_id,
            metadata.name,
            ship_id,
            ship_name,
            metadata.ship_target,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| CoreError::Data(e.to_string()))?;
    Ok(())
}

/// Replaces every `doctrines` row for this fit_id with the new component
/// set, filling derived fields from whatever `marketstats` row already
/// exists for each type_id (0 if the component is new and has no stats yet
/// — the next derivation cycle fills it in properly).
fn rebuild_doctrine_rows(
    conn: &Connection,
    metadata: &FitMetadata,
    ship_id: i64,
    ship_name: &str,
    items: &[ResolvedItem],
) -> CoreResult<()> {
    conn.execute("DELETE FROM doctrines WHERE fit_id = ?1", [metadata.fit_id])
        .map_err(|e| CoreError::Data(e.to_string()))?;

    let hulls: i64 = conn
        .query_row(
            "SELECT total_volume_remain FROM marketstats WHERE type_id = ?1",
            [ship_id],
            |r| r.get(0),
        )
        .unwrap_or(0);

    for item in items {
        let (total_stock, price, avg_vol, days, timestamp, group_id, group_name, category_id, category_name): (
            i64,
            f64,
            f64,
            f64,
            String,
            i64,
            String,
            i64,
            String,
        ) = conn
            .query_row(
                "SELECT total_volume_remain, price, avg_volume, days_remaining, last_update,
                        group_id, group_name, category_id, category_name
                 FROM marketstats WHERE type_id = ?1",
                [item.type_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                        r.get(8)?,
                    ))
                },
            )
            .unwrap_or((0, 0.0, 0.0, 0.0, String::new(), 0, String::new(), 0, String::new()));

        let fits_on_mkt = if item.quantity > 0 {
            ((total_stock as f64 / item.quantity as f64) * 10.0).round() / 10.0
        } else {
            0.0
        } as i64;

        conn.execute(
            "INSERT INTO doctrines (
                fit_id, ship_id, ship_name, hulls, type_id, type_name, fit_qty,
                fits_on_mkt, total_stock, price, avg_vol, days,
                group_id, group_name, category_id, category_name, timestamp
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            rusqlite::params![
                metadata.fit_id,
                ship_id,
                ship_name,
                hulls,
                item.type_id,
                item.type_name,
                item.quantity,
                fits_on_mkt,
                total_stock,
                price,
                avg_vol,
                days,
                group_id,
                group_name,
                category_id,
                category_name,
                timestamp,
            ],
        )
        .map_err(|e| CoreError::Data(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sde::{FixtureSde, InvType};
    use crate::store::schema::create_market_tables;

    fn catalogue() -> FixtureSde {
        FixtureSde::new()
            .with_type(InvType {
                type_id: 33157,
                type_name: "Hurricane Fleet Issue".into(),
                group_id: 1,
                group_name: "Battlecruiser".into(),
                category_id: 6,
                category_name: "Ship".into(),
            })
            .with_type(InvType {
                type_id: 100,
                type_name: "425mm AutoCannon II".into(),
                group_id: 2,
                group_name: "Weapon".into(),
                category_id: 7,
                category_name: "Module".into(),
            })
    }

    const FIT: &str = "[Hurricane Fleet Issue, Test]\n425mm AutoCannon II x2";

    #[tokio::test]
    async fn dry_run_performs_no_writes() {
        let cat = catalogue();
        let preview = preview_fit(&cat, FIT).await;
        assert_eq!(preview.ship_type_id, Some(33157));
        assert_eq!(preview.items.len(), 1);
        assert_eq!(preview.items[0].quantity, 2);
        assert!(preview.missing_items.is_empty());
    }

    #[tokio::test]
    async fn dry_run_reports_unresolved_components() {
        let cat = FixtureSde::new().with_type(InvType {
            type_id: 33157,
            type_name: "Hurricane Fleet Issue".into(),
            group_id: 1,
            group_name: "Battlecruiser".into(),
            category_id: 6,
            category_name: "Ship".into(),
        });
        let preview = preview_fit(&cat, FIT).await;
        assert_eq!(preview.missing_items, vec!["425mm AutoCannon II".to_string()]);
    }

    #[tokio::test]
    async fn update_fit_rebuilds_doctrines_and_watchlist() {
        let cat = catalogue();
        let mut fittings_conn = Connection::open_in_memory().unwrap();
        let mut market_conn = Connection::open_in_memory().unwrap();
        create_market_tables(&market_conn).unwrap();
        create_fit_tables(&fittings_conn, &market_conn).unwrap();

        let metadata = FitMetadata {
            description: "test fit".into(),
            name: "Test Fit".into(),
            fit_id: 494,
            doctrine_id: 1,
            ship_target: 100,
        };

        let outcome = update_fit(
            &mut fittings_conn,
            &mut market_conn,
            &cat,
            FIT,
            &metadata,
            Target::Local,
            true,
            false,
        )
        .await
        .unwrap();

        assert_eq!(outcome.preview.items.len(), 1);

        let doctrine_count: i64 = market_conn
            .query_row("SELECT count(*) FROM doctrines WHERE fit_id = 494", [], |r| r.get(0))
            .unwrap();
        assert_eq!(doctrine_count, 1);

        let watchlist_count: i64 = market_conn
            .query_row("SELECT count(*) FROM watchlist", [], |r| r.get(0))
            .unwrap();
        assert_eq!(watchlist_count, 2);
    }
}
