//! Declarative entity definitions and column contracts (spec.md §4.4).
//!
//! The column order declared here is the canonical insert order for each
//! table — the upsert engine's chunked statements are built straight off
//! `Table::insert_columns()`, never off a row struct's field order, so
//! adding a field to a row type can't silently desync the SQL.

/// Update strategy an upsert-engine call uses for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// Delete all rows, insert the new set, then require an exact count match.
    WipeAndReplace,
    /// `INSERT ... ON CONFLICT(pk) DO UPDATE ... WHERE any column differs`.
    Conditional,
}

/// A table definition: name, primary key column, full column list in
/// canonical order, and which upsert strategy applies to it.
#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [&'static str],
    pub strategy: UpsertStrategy,
}

impl Table {
    /// Columns in canonical insert order, including the primary key.
    pub fn insert_columns(&self) -> &'static [&'static str] {
        self.columns
    }

    pub fn non_pk_columns(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().copied().filter(|c| *c != self.primary_key)
    }
}

pub const WATCHLIST: Table = Table {
    name: "watchlist",
    primary_key: "type_id",
    columns: &[
        "type_id",
        "type_name",
        "group_id",
        "group_name",
        "category_id",
        "category_name",
    ],
    strategy: UpsertStrategy::Conditional,
};

pub const MARKET_ORDERS: Table = Table {
    name: "marketorders",
    primary_key: "order_id",
    columns: &[
        "order_id",
        "is_buy_order",
        "type_id",
        "type_name",
        "duration",
        "issued",
        "price",
        "volume_remain",
    ],
    strategy: UpsertStrategy::WipeAndReplace,
};

pub const MARKET_HISTORY: Table = Table {
    name: "market_history",
    primary_key: "id",
    columns: &[
        "id",
        "date",
        "type_id",
        "type_name",
        "average",
        "volume",
        "highest",
        "lowest",
        "order_count",
        "timestamp",
    ],
    strategy: UpsertStrategy::Conditional,
};

pub const MARKET_STATS: Table = Table {
    name: "marketstats",
    primary_key: "type_id",
    columns: &[
        "type_id",
        "type_name",
        "group_id",
        "group_name",
        "category_id",
        "category_name",
        "total_volume_remain",
        "min_price",
        "price",
        "avg_price",
        "avg_volume",
        "days_remaining",
        "last_update",
    ],
    strategy: UpsertStrategy::WipeAndReplace,
};

pub const DOCTRINES: Table = Table {
    name: "doctrines",
    primary_key: "id",
    columns: &[
        "id",
        "fit_id",
        "ship_id",
        "ship_name",
        "hulls",
        "type_id",
        "type_name",
        "fit_qty",
        "fits_on_mkt",
        "total_stock",
        "price",
        "avg_vol",
        "days",
        "group_id",
        "group_name",
        "category_id",
        "category_name",
        "timestamp",
    ],
    strategy: UpsertStrategy::WipeAndReplace,
};

pub const UPDATE_LOG: Table = Table {
    name: "update_log",
    primary_key: "rowid",
    columns: &["table_name", "updated_at", "rows"],
    strategy: UpsertStrategy::Conditional,
};

/// One row per conditional-request resource (currently just the structure
/// orders feed), keyed by an opaque endpoint label, per spec.md §6's
/// `If-None-Match`/`304` contract. Written directly with `ON CONFLICT`
/// rather than through the generic upsert engine, the same way
/// `market_history` is (see `cycle::persist_history`) — it's a single
/// key/value row per cycle, not a batch.
pub const HTTP_CACHE: Table = Table {
    name: "http_cache",
    primary_key: "endpoint",
    columns: &["endpoint", "etag"],
    strategy: UpsertStrategy::Conditional,
};

/// `fittings_fitting` / `fittings_fittingitem` / `fittings_doctrine` /
/// `fittings_doctrine_fittings` plus the `doctrine_map` join table all live
/// in the separate fittings store; they are reference data mutated only by
/// the Fit Updater, never by a cycle, so they are declared in `fit::update`
/// next to the code that owns them instead of here.

/// Creates every market-store table if it does not already exist. Column
/// types follow §4.4: INT for ids/counts, REAL for prices/volumes, TEXT for
/// names/dates, DATETIME stored as RFC3339 TEXT, BOOL as INTEGER 0/1.
pub fn create_market_tables(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS watchlist (
            type_id INTEGER PRIMARY KEY,
            type_name TEXT NOT NULL,
            group_id INTEGER NOT NULL,
            group_name TEXT NOT NULL,
            category_id INTEGER NOT NULL,
            category_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS marketorders (
            order_id INTEGER PRIMARY KEY,
            is_buy_order INTEGER NOT NULL,
            type_id INTEGER NOT NULL,
            type_name TEXT NOT NULL,
            duration INTEGER NOT NULL,
            issued TEXT NOT NULL,
            price REAL NOT NULL,
            volume_remain INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_marketorders_type ON marketorders(type_id);

        CREATE TABLE IF NOT EXISTS market_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            type_id INTEGER NOT NULL,
            type_name TEXT NOT NULL,
            average REAL NOT NULL,
            volume INTEGER NOT NULL,
            highest REAL NOT NULL,
            lowest REAL NOT NULL,
            order_count INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            UNIQUE(type_id, date)
        );
        CREATE INDEX IF NOT EXISTS idx_market_history_type_date ON market_history(type_id, date);

        CREATE TABLE IF NOT EXISTS marketstats (
            type_id INTEGER PRIMARY KEY,
            type_name TEXT NOT NULL,
            group_id INTEGER NOT NULL,
            group_name TEXT NOT NULL,
            category_id INTEGER NOT NULL,
            category_name TEXT NOT NULL,
            total_volume_remain INTEGER NOT NULL,
            min_price REAL NOT NULL,
            price REAL NOT NULL,
            avg_price REAL NOT NULL,
            avg_volume REAL NOT NULL,
            days_remaining REAL NOT NULL,
            last_update TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS doctrines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fit_id INTEGER NOT NULL,
            ship_id INTEGER NOT NULL,
            ship_name TEXT NOT NULL,
            hulls INTEGER NOT NULL,
            type_id INTEGER NOT NULL,
            type_name TEXT NOT NULL,
            fit_qty INTEGER NOT NULL,
            fits_on_mkt INTEGER NOT NULL,
            total_stock INTEGER NOT NULL,
            price REAL NOT NULL,
            avg_vol REAL NOT NULL,
            days REAL NOT NULL,
            group_id INTEGER NOT NULL,
            group_name TEXT NOT NULL,
            category_id INTEGER NOT NULL,
            category_name TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            UNIQUE(fit_id, type_id)
        );

        CREATE TABLE IF NOT EXISTS update_log (
            table_name TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            rows INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS http_cache (
            endpoint TEXT PRIMARY KEY,
            etag TEXT NOT NULL
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_and_replace_tables_match_spec_allow_list() {
        assert_eq!(MARKET_STATS.strategy, UpsertStrategy::WipeAndReplace);
        assert_eq!(DOCTRINES.strategy, UpsertStrategy::WipeAndReplace);
        assert_eq!(WATCHLIST.strategy, UpsertStrategy::Conditional);
        assert_eq!(MARKET_HISTORY.strategy, UpsertStrategy::Conditional);
    }

    #[test]
    fn creates_tables_idempotently() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        create_market_tables(&conn).unwrap();
        create_market_tables(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='marketstats'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
