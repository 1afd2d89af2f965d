//! Watchlist Maintenance (spec.md §4.9).
//!
//! Grounded in `original_source/src/mkts_backend/utils/db_utils.py`'s
//! `add_missing_items_to_watchlist`: resolve each id against the static
//! catalogue, skip ids the catalogue doesn't know about (reporting them),
//! and append only the rows not already present.

use crate::error::{CoreError, CoreResult};
use crate::sde::StaticCatalogue;
use crate::store::schema::WATCHLIST;
use crate::store::upsert::{upsert, Row};
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote,
}

#[derive(Debug, Default)]
pub struct AddToWatchlistReport {
    pub added: Vec<i64>,
    pub already_present: Vec<i64>,
    pub unresolved: Vec<i64>,
}

/// `add_to_watchlist(ids, target)`: idempotent, safe to re-run.
pub async fn add_to_watchlist(
    conn: &mut Connection,
    catalogue: &dyn StaticCatalogue,
    ids: &HashSet<i64>,
    _target: Target,
) -> CoreResult<AddToWatchlistReport> {
    let existing = existing_type_ids(conn)?;

    let mut report = AddToWatchlistReport::default();
    let mut rows: Vec<Row> = Vec::new();

    for &id in ids {
        if existing.contains(&id) {
            report.already_present.push(id);
            continue;
        }
        match catalogue.lookup_by_id(id).await {
            Some(inv) => {
                rows.push(vec![
                    Box::new(inv.type_id),
                    Box::new(inv.type_name),
                    Box::new(inv.group_id),
                    Box::new(inv.group_name),
                    Box::new(inv.category_id),
                    Box::new(inv.category_name),
                ]);
                report.added.push(id);
            }
            None => {
                warn!(type_id = id, "watchlist: id not found in static catalogue, skipping");
                report.unresolved.push(id);
            }
        }
    }

    if !rows.is_empty() {
        upsert(conn, &WATCHLIST, rows).map_err(CoreError::Upsert)?;
    }

    Ok(report)
}

fn existing_type_ids(conn: &Connection) -> CoreResult<HashSet<i64>> {
    let mut stmt = conn
        .prepare("SELECT type_id FROM watchlist")
        .map_err(|e| CoreError::Data(e.to_string()))?;
    let ids = stmt
        .query_map([], |r| r.get::<_, i64>(0))
        .map_err(|e| CoreError::Data(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sde::{FixtureSde, InvType};
    use crate::store::schema::create_market_tables;

    #[tokio::test]
    async fn skips_existing_and_reports_unresolved() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_market_tables(&conn).unwrap();
        conn.execute(
            "INSERT INTO watchlist VALUES (34, 'Tritanium', 18, 'Minerals', 4, 'Material')",
            [],
        )
        .unwrap();

        let catalogue = FixtureSde::new().with_type(InvType {
            type_id: 35,
            type_name: "Pyerite".into(),
            group_id: 18,
            group_name: "Minerals".into(),
            category_id: 4,
            category_name: "Material".into(),
        });

        let ids: HashSet<i64> = [34, 35, 999].into_iter().collect();
        let mut report = add_to_watchlist(&mut conn, &catalogue, &ids, Target::Local).await.unwrap();
        report.added.sort();
        report.already_present.sort();
        report.unresolved.sort();

        assert_eq!(report.added, vec![35]);
        assert_eq!(report.already_present, vec![34]);
        assert_eq!(report.unresolved, vec![999]);

        let count: i64 = conn.query_row("SELECT count(*) FROM watchlist", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }
}
