//! Static item catalogue ("SDE"), consumed read-only (spec.md §1).
//!
//! Grounded in `original_source/src/mkts_backend/utils/db_utils.py`'s
//! `inv_info` lookups (`typeID`/`typeName`/`groupID`/`groupName`/
//! `categoryID`/`categoryName`) and
//! `original_source/src/mkts_backend/utils/parse_fits.py`'s `_lookup_type_id`
//! name resolution. Modeled as a trait so a real SQLite SDE file backs it
//! in production and an in-memory fixture backs it in tests, the way
//! `cooprefr-bettersys::vault::vault_db` wraps a single connection behind a
//! small trait-free struct — here a trait, because two call sites
//! (Watchlist Maintenance, Fit Updater) both need substitutable lookups.

use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct InvType {
    pub type_id: i64,
    pub type_name: String,
    pub group_id: i64,
    pub group_name: String,
    pub category_id: i64,
    pub category_name: String,
}

#[async_trait::async_trait]
pub trait StaticCatalogue: Send + Sync {
    async fn lookup_by_id(&self, type_id: i64) -> Option<InvType>;
    async fn lookup_by_name(&self, type_name: &str) -> Option<InvType>;
}

/// Backs the catalogue with a read-only `inv_info` table in a SQLite file.
pub struct SqliteSde {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSde {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait::async_trait]
impl StaticCatalogue for SqliteSde {
    async fn lookup_by_id(&self, type_id: i64) -> Option<InvType> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT typeID, typeName, groupID, groupName, categoryID, categoryName
             FROM inv_info WHERE typeID = ?1",
            [type_id],
            row_to_inv_type,
        )
        .ok()
    }

    async fn lookup_by_name(&self, type_name: &str) -> Option<InvType> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT typeID, typeName, groupID, groupName, categoryID, categoryName
             FROM inv_info WHERE typeName = ?1",
            [type_name],
            row_to_inv_type,
        )
        .ok()
    }
}

fn row_to_inv_type(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvType> {
    Ok(InvType {
        type_id: row.get(0)?,
        type_name: row.get(1)?,
        group_id: row.get(2)?,
        group_name: row.get(3)?,
        category_id: row.get(4)?,
        category_name: row.get(5)?,
    })
}

/// In-memory fixture for tests, grounded in the same `InvType` shape.
#[derive(Default)]
pub struct FixtureSde {
    by_id: HashMap<i64, InvType>,
}

impl FixtureSde {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, inv: InvType) -> Self {
        self.by_id.insert(inv.type_id, inv);
        self
    }
}

#[async_trait::async_trait]
impl StaticCatalogue for FixtureSde {
    async fn lookup_by_id(&self, type_id: i64) -> Option<InvType> {
        self.by_id.get(&type_id).cloned()
    }

    async fn lookup_by_name(&self, type_name: &str) -> Option<InvType> {
        self.by_id.values().find(|v| v.type_name == type_name).cloned()
    }
}
