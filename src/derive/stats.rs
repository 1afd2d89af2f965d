//! Market stats derivation (spec.md §4.7.1).
//!
//! Grounded directly in
//! `original_source/src/mkts_backend/processing/data_processing.py`:
//! `calculate_market_stats` (the watchlist/orders/history join and the
//! rounding rules), `calculate_5_percentile_price` (the 5th-percentile sell
//! price), and `fill_missing_stats_from_history` (the fill-rule order:
//! min_price → price → avg_price → avg_volume → 0).

use crate::error::CoreError;
use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct MarketStatRow {
    pub type_id: i64,
    pub type_name: String,
    pub group_id: i64,
    pub group_name: String,
    pub category_id: i64,
    pub category_name: String,
    pub total_volume_remain: i64,
    pub min_price: f64,
    pub price: f64,
    pub avg_price: f64,
    pub avg_volume: f64,
    pub days_remaining: f64,
    pub last_update: String,
}

struct WatchlistEntry {
    type_id: i64,
    type_name: String,
    group_id: i64,
    group_name: String,
    category_id: i64,
    category_name: String,
}

struct OrderAgg {
    min_price: f64,
    total_volume_remain: i64,
}

struct HistoryAgg {
    avg_price: f64,
    avg_volume: f64,
}

struct HistoryFill {
    min_average: f64,
    mean_average: f64,
    mean_volume: f64,
}

/// Computes `marketstats` for every watchlisted type_id against the tables
/// already present on `conn`. Pure function of the database's current
/// contents plus `now`; callers pass `now` so repeated calls in tests are
/// deterministic.
pub fn calculate_market_stats(conn: &Connection, now: chrono::DateTime<Utc>) -> Result<Vec<MarketStatRow>, CoreError> {
    let watchlist = load_watchlist(conn)?;
    let orders = load_order_aggregates(conn)?;
    let history = load_history_aggregates(conn)?;
    let percentiles = load_5th_percentile_prices(conn)?;

    let mut rows = Vec::with_capacity(watchlist.len());
    for entry in &watchlist {
        let order = orders.get(&entry.type_id);
        let hist = history.get(&entry.type_id);

        let mut min_price = order.map(|o| o.min_price);
        let total_volume_remain = order.map(|o| o.total_volume_remain).unwrap_or(0);
        let mut avg_price = hist.map(|h| h.avg_price);
        let mut avg_volume = hist.map(|h| h.avg_volume);
        let mut price = percentiles.get(&entry.type_id).copied();

        if min_price.is_none() || price.is_none() || avg_price.is_none() || avg_volume.is_none() {
            if let Some(fill) = load_history_fill(conn, entry.type_id)? {
                min_price = min_price.or(Some(fill.min_average));
                price = price.or(Some(fill.mean_average));
                avg_price = avg_price.or(Some(fill.mean_average));
                avg_volume = avg_volume.or(Some(fill.mean_volume));
            }
        }

        let min_price = min_price.unwrap_or(0.0);
        let price = round2(price.unwrap_or(0.0));
        let avg_price = round2(avg_price.filter(|v| *v > 0.0).unwrap_or(0.0));
        let avg_volume = round1(avg_volume.filter(|v| *v > 0.0).unwrap_or(0.0));
        let days_remaining = if avg_volume > 0.0 {
            round1(total_volume_remain as f64 / avg_volume)
        } else {
            0.0
        };

        rows.push(MarketStatRow {
            type_id: entry.type_id,
            type_name: entry.type_name.clone(),
            group_id: entry.group_id,
            group_name: entry.group_name.clone(),
            category_id: entry.category_id,
            category_name: entry.category_name.clone(),
            total_volume_remain,
            min_price,
            price,
            avg_price,
            avg_volume,
            days_remaining,
            last_update: now.to_rfc3339(),
        });
    }

    Ok(rows)
}

fn load_watchlist(conn: &Connection) -> Result<Vec<WatchlistEntry>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT type_id, type_name, group_id, group_name, category_id, category_name FROM watchlist")
        .map_err(|e| CoreError::Data(e.to_string()))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(WatchlistEntry {
                type_id: r.get(0)?,
                type_name: r.get(1)?,
                group_id: r.get(2)?,
                group_name: r.get(3)?,
                category_id: r.get(4)?,
                category_name: r.get(5)?,
            })
        })
        .map_err(|e| CoreError::Data(e.to_string()))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|e| CoreError::Data(e.to_string()))
}

fn load_order_aggregates(conn: &Connection) -> Result<HashMap<i64, OrderAgg>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT type_id, MIN(price), SUM(volume_remain) FROM marketorders
             WHERE is_buy_order = 0 GROUP BY type_id",
        )
        .map_err(|e| CoreError::Data(e.to_string()))?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                OrderAgg {
                    min_price: r.get(1)?,
                    total_volume_remain: r.get(2)?,
                },
            ))
        })
        .map_err(|e| CoreError::Data(e.to_string()))?;
    rows.collect::<Result<HashMap<_, _>, _>>().map_err(|e| CoreError::Data(e.to_string()))
}

fn load_history_aggregates(conn: &Connection) -> Result<HashMap<i64, HistoryAgg>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT type_id, AVG(average), AVG(volume) FROM market_history
             WHERE date >= DATE('now', '-30 day') AND average > 0 AND volume > 0
             GROUP BY type_id",
        )
        .map_err(|e| CoreError::Data(e.to_string()))?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                HistoryAgg {
                    avg_price: r.get(1)?,
                    avg_volume: r.get(2)?,
                },
            ))
        })
        .map_err(|e| CoreError::Data(e.to_string()))?;
    rows.collect::<Result<HashMap<_, _>, _>>().map_err(|e| CoreError::Data(e.to_string()))
}

fn load_5th_percentile_prices(conn: &Connection) -> Result<HashMap<i64, f64>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT type_id, price FROM marketorders WHERE is_buy_order = 0 ORDER BY type_id, price")
        .map_err(|e| CoreError::Data(e.to_string()))?;
    let mut by_type: HashMap<i64, Vec<f64>> = HashMap::new();
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?)))
        .map_err(|e| CoreError::Data(e.to_string()))?;
    for row in rows {
        let (type_id, price) = row.map_err(|e| CoreError::Data(e.to_string()))?;
        by_type.entry(type_id).or_default().push(price);
    }

    Ok(by_type
        .into_iter()
        .map(|(type_id, prices)| (type_id, round2(quantile(&prices, 0.05))))
        .collect())
}

/// Linear-interpolation percentile over an already price-sorted ascending slice.
fn quantile(sorted_ascending: &[f64], q: f64) -> f64 {
    if sorted_ascending.is_empty() {
        return 0.0;
    }
    if sorted_ascending.len() == 1 {
        return sorted_ascending[0];
    }
    let pos = q * (sorted_ascending.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        return sorted_ascending[lower];
    }
    let frac = pos - lower as f64;
    sorted_ascending[lower] + (sorted_ascending[upper] - sorted_ascending[lower]) * frac
}

fn load_history_fill(conn: &Connection, type_id: i64) -> Result<Option<HistoryFill>, CoreError> {
    let result = conn.query_row(
        "SELECT MIN(average), AVG(average), AVG(volume) FROM market_history WHERE type_id = ?1",
        [type_id],
        |r| {
            Ok((
                r.get::<_, Option<f64>>(0)?,
                r.get::<_, Option<f64>>(1)?,
                r.get::<_, Option<f64>>(2)?,
            ))
        },
    );
    match result {
        Ok((Some(min_average), Some(mean_average), Some(mean_volume))) => Ok(Some(HistoryFill {
            min_average,
            mean_average,
            mean_volume,
        })),
        Ok(_) => Ok(None),
        Err(e) => Err(CoreError::Data(e.to_string())),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
