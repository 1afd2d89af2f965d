//! Doctrine stats derivation (spec.md §4.7.2).
//!
//! Grounded in
//! `original_source/src/mkts_backend/processing/data_processing.py::calculate_doctrine_stats`:
//! the `doctrines` template rows (one per `(fit_id, type_id)` with
//! `fit_qty`) are joined against the freshly computed `marketstats` by
//! `type_id`, with `hulls` joined by `ship_id` instead. `fits_on_mkt` is
//! `round(total_stock / fit_qty, 1)` cast to an integer; all nulls fill to 0.

use crate::derive::stats::MarketStatRow;
use crate::error::CoreError;
use rusqlite::Connection;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct DoctrineRow {
    pub fit_id: i64,
    pub ship_id: i64,
    pub ship_name: String,
    pub hulls: i64,
    pub type_id: i64,
    pub type_name: String,
    pub fit_qty: i64,
    pub fits_on_mkt: i64,
    pub total_stock: i64,
    pub price: f64,
    pub avg_vol: i64,
    pub days: f64,
    pub group_id: i64,
    pub group_name: String,
    pub category_id: i64,
    pub category_name: String,
    pub timestamp: String,
}

struct DoctrineTemplateRow {
    fit_id: i64,
    ship_id: i64,
    ship_name: String,
    type_id: i64,
    type_name: String,
    fit_qty: i64,
    group_id: i64,
    group_name: String,
    category_id: i64,
    category_name: String,
}

/// Recomputes every `doctrines` row from the `doctrine_map`/fittings
/// template rows against the just-computed `marketstats`.
pub fn calculate_doctrine_stats(
    conn: &Connection,
    market_stats: &[MarketStatRow],
) -> Result<Vec<DoctrineRow>, CoreError> {
    let stats_by_type: HashMap<i64, &MarketStatRow> =
        market_stats.iter().map(|r| (r.type_id, r)).collect();

    let templates = load_doctrine_templates(conn)?;

    let mut rows = Vec::with_capacity(templates.len());
    for template in templates {
        let ship_stats = stats_by_type.get(&template.ship_id);
        let stats = stats_by_type.get(&template.type_id);

        let hulls = ship_stats.map(|s| s.total_volume_remain).unwrap_or(0);
        let total_stock = stats.map(|s| s.total_volume_remain).unwrap_or(0);
        let price = stats.map(|s| s.price).unwrap_or(0.0);
        let avg_vol = stats.map(|s| s.avg_volume as i64).unwrap_or(0);
        let days = stats.map(|s| s.days_remaining).unwrap_or(0.0);
        let timestamp = stats.map(|s| s.last_update.clone()).unwrap_or_default();

        let fits_on_mkt = if template.fit_qty > 0 {
            ((total_stock as f64 / template.fit_qty as f64) * 10.0).round() / 10.0
        } else {
            0.0
        } as i64;

        rows.push(DoctrineRow {
            fit_id: template.fit_id,
            ship_id: template.ship_id,
            ship_name: template.ship_name,
            hulls,
            type_id: template.type_id,
            type_name: template.type_name,
            fit_qty: template.fit_qty,
            fits_on_mkt,
            total_stock,
            price,
            avg_vol,
            days,
            group_id: template.group_id,
            group_name: template.group_name,
            category_id: template.category_id,
            category_name: template.category_name,
            timestamp,
        });
    }

    Ok(rows)
}

fn load_doctrine_templates(conn: &Connection) -> Result<Vec<DoctrineTemplateRow>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT fit_id, ship_id, ship_name, type_id, type_name, fit_qty,
                    group_id, group_name, category_id, category_name
             FROM doctrines",
        )
        .map_err(|e| CoreError::Data(e.to_string()))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(DoctrineTemplateRow {
                fit_id: r.get(0)?,
                ship_id: r.get(1)?,
                ship_name: r.get(2)?,
                type_id: r.get(3)?,
                type_name: r.get(4)?,
                fit_qty: r.get(5)?,
                group_id: r.get(6)?,
                group_name: r.get(7)?,
                category_id: r.get(8)?,
                category_name: r.get(9)?,
            })
        })
        .map_err(|e| CoreError::Data(e.to_string()))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|e| CoreError::Data(e.to_string()))
}
