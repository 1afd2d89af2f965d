//! Upsert Engine (spec.md §4.6).
//!
//! Grounded in `original_source/db/db_handlers.py::upsert_remote_database`
//! for the chunk-size arithmetic and the two-strategy split, and in
//! `cooprefr-bettersys::vault::vault_db`'s `Connection` + prepared-statement
//! usage for the rusqlite texture.

use crate::error::UpsertError;
use crate::store::schema::{Table, UpsertStrategy};
use rusqlite::{types::ToSql, Connection, Transaction};

/// One bound-parameter budget: SQLite's default compiled-in limit is 32,766
/// host parameters per statement; `db_handlers.py` budgets against 256KB at
/// 8 bytes/parameter, which lands at the same order of magnitude. We take
/// the smaller, more conservative figure spec.md names.
const MAX_PARAMETERS: usize = 32_768;
const MAX_CHUNK_ROWS: usize = 2_000;

pub fn chunk_size(column_count: usize) -> usize {
    MAX_CHUNK_ROWS.min(MAX_PARAMETERS / column_count.max(1))
}

/// A single row's values, one per `Table::insert_columns()` entry, in order.
pub type Row = Vec<Box<dyn ToSql>>;

/// Runs `upsert(table, rows)` in one transaction, per spec.md §4.6.
pub fn upsert(conn: &mut Connection, table: &Table, rows: Vec<Row>) -> Result<(), UpsertError> {
    // `Table::primary_key` is a single column by construction, so a
    // composite-key table can't reach this function at all; the rejection
    // spec.md asks for at call time is enforced by the schema type itself.
    let tx = conn.transaction()?;
    match table.strategy {
        UpsertStrategy::WipeAndReplace => wipe_and_replace(&tx, table, rows)?,
        UpsertStrategy::Conditional => conditional_upsert(&tx, table, rows)?,
    }
    tx.commit()?;
    Ok(())
}

fn wipe_and_replace(tx: &Transaction<'_>, table: &Table, rows: Vec<Row>) -> Result<(), UpsertError> {
    let expected = rows.len();
    tx.execute(&format!("DELETE FROM {}", table.name), [])?;

    let cols = table.insert_columns();
    let chunk = chunk_size(cols.len());
    let placeholders_row = format!("({})", vec!["?"; cols.len()].join(","));
    let insert_cols = cols.join(", ");

    for batch in rows.chunks(chunk) {
        if batch.is_empty() {
            continue;
        }
        let placeholders = vec![placeholders_row.as_str(); batch.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table.name, insert_cols, placeholders
        );
        let params: Vec<&dyn ToSql> = batch.iter().flat_map(|r| r.iter().map(|v| v.as_ref())).collect();
        tx.execute(&sql, params.as_slice())?;
    }

    let actual: usize = tx.query_row(&format!("SELECT count(*) FROM {}", table.name), [], |r| {
        r.get::<_, i64>(0)
    })? as usize;

    if actual != expected {
        return Err(UpsertError::RowCountMismatch {
            table: table.name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn conditional_upsert(tx: &Transaction<'_>, table: &Table, rows: Vec<Row>) -> Result<(), UpsertError> {
    let cols = table.insert_columns();
    let insert_cols = cols.join(", ");
    let placeholders = vec!["?"; cols.len()].join(",");
    let non_pk: Vec<&str> = table.non_pk_columns().collect();
    let set_clause = non_pk
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let changed_predicate = non_pk
        .iter()
        .map(|c| format!("{c} IS NOT excluded.{c}"))
        .collect::<Vec<_>>()
        .join(" OR ");

    let sql = if non_pk.is_empty() {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO NOTHING",
            table.name, insert_cols, placeholders, table.primary_key
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {} WHERE {}",
            table.name, insert_cols, placeholders, table.primary_key, set_clause, changed_predicate
        )
    };

    let mut stmt = tx.prepare_cached(&sql)?;
    let mut distinct_pks = std::collections::HashSet::new();
    for row in &rows {
        let params: Vec<&dyn ToSql> = row.iter().map(|v| v.as_ref()).collect();
        stmt.execute(params.as_slice())?;
    }
    drop(stmt);

    for row in &rows {
        if let Some(pk) = row.first() {
            distinct_pks.insert(format!("{:?}", pk.to_sql()?));
        }
    }

    let current_count: usize = tx.query_row(&format!("SELECT count(*) FROM {}", table.name), [], |r| {
        r.get::<_, i64>(0)
    })? as usize;

    if distinct_pks.len() > current_count {
        return Err(UpsertError::RowCountTooLow {
            table: table.name.to_string(),
            expected: distinct_pks.len(),
            actual: current_count,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    fn row(values: Vec<Box<dyn ToSql>>) -> Row {
        values
    }

    #[test]
    fn chunk_size_respects_parameter_budget() {
        assert_eq!(chunk_size(13), 2000); // marketstats: 32768/13 = 2520, capped at 2000
        assert_eq!(chunk_size(100), 327);
    }

    #[test]
    fn wipe_and_replace_rejects_short_count() {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::create_market_tables(&conn).unwrap();
        let rows = vec![row(vec![
            Box::new(34i64),
            Box::new("Tritanium".to_string()),
            Box::new(18i64),
            Box::new("Minerals".to_string()),
            Box::new(4i64),
            Box::new("Material".to_string()),
            Box::new(300i64),
            Box::new(5.0f64),
            Box::new(5.0f64),
            Box::new(5.0f64),
            Box::new(0.0f64),
            Box::new(0.0f64),
            Box::new("2026-07-27T00:00:00Z".to_string()),
        ])];
        upsert(&mut conn, &schema::MARKET_STATS, rows).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM marketstats", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn conditional_upsert_preserves_untouched_pks() {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::create_market_tables(&conn).unwrap();
        let seed = vec![row(vec![
            Box::new(34i64),
            Box::new("Tritanium".to_string()),
            Box::new(18i64),
            Box::new("Minerals".to_string()),
            Box::new(4i64),
            Box::new("Material".to_string()),
        ])];
        upsert(&mut conn, &schema::WATCHLIST, seed).unwrap();

        let update = vec![row(vec![
            Box::new(35i64),
            Box::new("Pyerite".to_string()),
            Box::new(18i64),
            Box::new("Minerals".to_string()),
            Box::new(4i64),
            Box::new("Material".to_string()),
        ])];
        upsert(&mut conn, &schema::WATCHLIST, update).unwrap();

        let count: i64 = conn
            .query_row("SELECT count(*) FROM watchlist", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
