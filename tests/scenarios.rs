//! Integration tests for the six seed scenarios (spec.md §8).
//!
//! Each test drives the library's public API directly against an in-memory
//! or temp-file SQLite connection, the same way the inline unit tests do;
//! the rate-limit and permanent-403 scenarios additionally stand up an
//! `httpmock` server so the real ingest client's HTTP handling is exercised.

use chrono::Utc;
use httpmock::prelude::*;
use mkts_core::config::EsiConfig;
use mkts_core::fit::{self, FitMetadata};
use mkts_core::ingest::orders::{fetch_region_orders, OrderFetchOutcome, OrderType};
use mkts_core::ingest::fetch_history_fanout;
use mkts_core::sde::{FixtureSde, InvType};
use mkts_core::store::schema::{create_market_tables, DOCTRINES, MARKET_STATS};
use mkts_core::store::upsert::{upsert, Row};
use mkts_core::{derive, watchlist};
use rusqlite::Connection;
use std::collections::HashSet;

fn esi_config(base_url: &str) -> EsiConfig {
    EsiConfig {
        base_url: base_url.to_string(),
        compatibility_date: "2025-08-26".to_string(),
        user_agent: "mkts-core-tests/0.1".to_string(),
        tenant: "tranquility".to_string(),
    }
}

fn stat_row(r: &derive::MarketStatRow) -> Row {
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

// Scenario 1: happy path, history off — every watchlisted type_id gets
// exactly one marketstats row, derived straight off open orders.
#[test]
fn scenario_happy_path_history_off() {
    let conn = Connection::open_in_memory().unwrap();
    create_market_tables(&conn).unwrap();
    conn.execute_batch(
        "INSERT INTO watchlist VALUES (34, 'Tritanium', 18, 'Minerals', 4, 'Material');
         INSERT INTO watchlist VALUES (35, 'Pyerite', 18, 'Minerals', 4, 'Material');
         INSERT INTO marketorders VALUES (1, 0, 34, 'Tritanium', 90, '2026-01-01', 5.10, 100);
         INSERT INTO marketorders VALUES (2, 0, 34, 'Tritanium', 90, '2026-01-01', 5.00, 200);
         INSERT INTO marketorders VALUES (3, 0, 35, 'Pyerite', 90, '2026-01-01', 2.50, 50);",
    )
    .unwrap();

    let stats = derive::calculate_market_stats(&conn, Utc::now()).unwrap();
    assert_eq!(stats.len(), 2, "one marketstats row per watchlisted type_id");
    for row in &stats {
        assert!(row.total_volume_remain >= 0);
        assert!(row.min_price >= 0.0);
    }
}

// Scenario 2: history fills stats when there are no open orders at all.
#[test]
fn scenario_history_fill_when_no_open_orders() {
    let conn = Connection::open_in_memory().unwrap();
    create_market_tables(&conn).unwrap();
    conn.execute("INSERT INTO watchlist VALUES (600, 'Widget', 1, 'G', 1, 'C')", [])
        .unwrap();
    for day in 0..10 {
        let date = (Utc::now() - chrono::Duration::days(day)).format("%Y-%m-%d").to_string();
        conn.execute(
            "INSERT INTO market_history (date, type_id, type_name, average, volume, highest, lowest, order_count, timestamp)
             VALUES (?1, 600, 'Widget', 12.5, 1000, 13.0, 12.0, 5, ?1)",
            [&date],
        )
        .unwrap();
    }

    let stats = derive::calculate_market_stats(&conn, Utc::now()).unwrap();
    let row = stats.iter().find(|r| r.type_id == 600).unwrap();
    assert_eq!(row.total_volume_remain, 0, "no open orders means zero on-market volume");
    assert_eq!(row.min_price, 12.5, "min_price backfills from history");
    assert_eq!(row.avg_volume, 1000.0);
}

// Scenario 3: a persistent 429 is retried with exponential backoff and the
// fetch eventually gives up once the backoff budget is exhausted, rather
// than retrying forever. Run under a paused/virtual clock so the real
// ~180s budget resolves instantly and deterministically: tokio's paused
// clock auto-advances to the next timer when nothing else is runnable, so
// every `tokio::time::sleep` in the retry loop completes without any real
// wall-clock wait while the backoff bookkeeping still runs for real.
#[tokio::test(start_paused = true)]
async fn scenario_rate_limit_backoff_gives_up_after_budget_exhausted() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/markets/10000002/orders");
            then.status(429);
        })
        .await;

    let esi = esi_config(&server.base_url());
    let result = fetch_region_orders(&esi, 10_000_002, OrderType::Sell, None).await;

    let err = result.unwrap_err();
    assert!(
        err.to_string().contains("rate limited past backoff budget"),
        "unexpected error: {err}"
    );
}

// A 304 against the ETag sent on the first page is "no change": the fetch
// must stop immediately, send no further page requests, and report
// `Unchanged` rather than an empty order list.
#[tokio::test]
async fn etag_match_returns_unchanged_without_reading_a_body() {
    let server = MockServer::start_async().await;

    let not_modified = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/markets/10000002/orders")
                .header("If-None-Match", "\"prior-etag\"");
            then.status(304);
        })
        .await;

    let esi = esi_config(&server.base_url());
    let outcome = fetch_region_orders(&esi, 10_000_002, OrderType::Sell, Some("\"prior-etag\""))
        .await
        .unwrap();

    assert!(matches!(outcome, OrderFetchOutcome::Unchanged));
    not_modified.assert_async().await;
}

// A 200 response carries a fresh ETag forward so the next cycle's fetch can
// go conditional.
#[tokio::test]
async fn etag_mismatch_returns_fetched_orders_with_the_new_etag() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/markets/10000002/orders");
            then.status(200)
                .header("ETag", "\"fresh-etag\"")
                .header("Content-Type", "application/json")
                .json_body(serde_json::json!([
                    {
                        "order_id": 1,
                        "is_buy_order": false,
                        "type_id": 34,
                        "duration": 90,
                        "issued": "2026-07-26T00:00:00Z",
                        "price": 5.0,
                        "volume_remain": 100
                    }
                ]));
        })
        .await;

    let esi = esi_config(&server.base_url());
    let outcome = fetch_region_orders(&esi, 10_000_002, OrderType::Sell, None).await.unwrap();

    match outcome {
        OrderFetchOutcome::Fetched { orders, etag } => {
            assert_eq!(orders.len(), 1);
            assert_eq!(etag.as_deref(), Some("\"fresh-etag\""));
        }
        OrderFetchOutcome::Unchanged => panic!("expected a fresh order set, got Unchanged"),
    }
}

// Scenario 4: a permanent 403 on one type_id's history doesn't fail the
// whole fan-out — it yields empty data for that one id, others unaffected.
#[tokio::test]
async fn scenario_permanent_403_on_one_history_type_leaves_others_unaffected() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/markets/10000002/history").query_param("type_id", "34");
            then.status(403);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/markets/10000002/history").query_param("type_id", "35");
            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(serde_json::json!([
                    {
                        "date": "2026-07-26",
                        "average": 2.5,
                        "volume": 500,
                        "highest": 2.6,
                        "lowest": 2.4,
                        "order_count": 10
                    }
                ]));
        })
        .await;

    let esi = esi_config(&server.base_url());
    let results = fetch_history_fanout(&esi, 10_000_002, &[34, 35]).await.unwrap();

    let forbidden = results.iter().find(|r| r.type_id == 34).unwrap();
    assert!(forbidden.data.is_empty(), "permanent 403 yields empty data, not an error");

    let ok = results.iter().find(|r| r.type_id == 35).unwrap();
    assert_eq!(ok.data.len(), 1);
    assert_eq!(ok.data[0].volume, 500);
}

// Scenario 5: an upsert whose actual row count diverges from what was
// requested rolls back entirely, leaving the prior snapshot intact.
#[test]
fn scenario_upsert_row_count_mismatch_rolls_back_prior_snapshot() {
    let mut conn = Connection::open_in_memory().unwrap();
    create_market_tables(&conn).unwrap();

    // Seed a prior, already-committed snapshot.
    conn.execute(
        "INSERT INTO marketstats VALUES (34, 'Tritanium', 18, 'Minerals', 4, 'Material', 300, 5.0, 5.0, 5.0, 10.0, 30.0, '2026-07-26T00:00:00+00:00')",
        [],
    )
    .unwrap();

    // A trigger simulates a fault that silently drops one inserted row
    // before the upsert engine's final count check runs.
    conn.execute_batch(
        "CREATE TRIGGER drop_sentinel AFTER INSERT ON marketstats
         WHEN NEW.type_id = 999
         BEGIN DELETE FROM marketstats WHERE type_id = 999; END;",
    )
    .unwrap();

    let faulty_rows: Vec<Row> = vec![
        vec![
            Box::new(35i64),
            Box::new("Pyerite".to_string()),
            Box::new(18i64),
            Box::new("Minerals".to_string()),
            Box::new(4i64),
            Box::new("Material".to_string()),
            Box::new(100i64),
            Box::new(2.0f64),
            Box::new(2.0f64),
            Box::new(2.0f64),
            Box::new(5.0f64),
            Box::new(20.0f64),
            Box::new("2026-07-27T00:00:00+00:00".to_string()),
        ],
        vec![
            Box::new(999i64),
            Box::new("Ghost".to_string()),
            Box::new(18i64),
            Box::new("Minerals".to_string()),
            Box::new(4i64),
            Box::new("Material".to_string()),
            Box::new(1i64),
            Box::new(1.0f64),
            Box::new(1.0f64),
            Box::new(1.0f64),
            Box::new(1.0f64),
            Box::new(1.0f64),
            Box::new("2026-07-27T00:00:00+00:00".to_string()),
        ],
    ];

    let err = upsert(&mut conn, &MARKET_STATS, faulty_rows).unwrap_err();
    assert!(matches!(err, mkts_core::error::UpsertError::RowCountMismatch { .. }));

    // Wipe-and-replace issues DELETE then INSERT inside one transaction;
    // a failed count check rolls the whole transaction back, so the prior
    // snapshot (type_id 34) must still be exactly what it was before.
    let count: i64 = conn.query_row("SELECT count(*) FROM marketstats", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 1, "rollback must restore the pre-upsert snapshot exactly");
    let surviving_type: i64 = conn
        .query_row("SELECT type_id FROM marketstats", [], |r| r.get(0))
        .unwrap();
    assert_eq!(surviving_type, 34);
}

// Scenario 6: rebuilding a fit with a changed component list rebuilds its
// doctrine rows to match exactly, and watchlists any newly introduced
// component.
#[tokio::test]
async fn scenario_doctrine_rebuild_after_fit_change_adds_new_component_to_watchlist() {
    let cat = FixtureSde::new()
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
        .with_type(InvType {
            type_id: 101,
            type_name: "Drone Damage Amplifier II".into(),
            group_id: 3,
            group_name: "Rig".into(),
            category_id: 7,
            category_name: "Module".into(),
        });

    let mut fittings_conn = Connection::open_in_memory().unwrap();
    let mut market_conn = Connection::open_in_memory().unwrap();
    create_market_tables(&market_conn).unwrap();
    fit::create_fit_tables(&fittings_conn, &market_conn).unwrap();

    let metadata = FitMetadata {
        description: "test fit".into(),
        name: "Test Fit".into(),
        fit_id: 494,
        doctrine_id: 1,
        ship_target: 10,
    };

    let original_fit = "[Hurricane Fleet Issue, Test]\n425mm AutoCannon II x2";
    fit::update_fit(
        &mut fittings_conn,
        &mut market_conn,
        &cat,
        original_fit,
        &metadata,
        watchlist::Target::Local,
        true,
        false,
    )
    .await
    .unwrap();

    let updated_fit = "[Hurricane Fleet Issue, Test]\nDrone Damage Amplifier II x1";
    let outcome = fit::update_fit(
        &mut fittings_conn,
        &mut market_conn,
        &cat,
        updated_fit,
        &metadata,
        watchlist::Target::Local,
        true,
        false,
    )
    .await
    .unwrap();

    let doctrine_type_ids: HashSet<i64> = market_conn
        .prepare("SELECT type_id FROM doctrines WHERE fit_id = 494")
        .unwrap()
        .query_map([], |r| r.get::<_, i64>(0))
        .unwrap()
        .filter_map(|r| r.ok())
        .collect();
    assert_eq!(doctrine_type_ids, HashSet::from([101]), "doctrines must match only the new component set");

    assert!(
        outcome.watchlist_additions.contains(&101),
        "newly introduced component must be added to the watchlist"
    );

    let doctrine_count: i64 = market_conn
        .query_row("SELECT count(*) FROM doctrines WHERE fit_id = 494", [], |r| r.get(0))
        .unwrap();
    assert_eq!(doctrine_count, 1, "stale rows for the dropped component must be gone");

    // DOCTRINES is also exercised through the generic wipe-and-replace engine
    // in the cycle; confirm its strategy still matches the allow-list.
    assert_eq!(DOCTRINES.strategy, mkts_core::store::schema::UpsertStrategy::WipeAndReplace);
}

// Sanity check that chaining add_to_watchlist twice stays idempotent,
// complementing scenario 6's doctrine-rebuild path.
#[tokio::test]
async fn watchlist_additions_are_idempotent_across_repeated_calls() {
    let conn_guard = Connection::open_in_memory().unwrap();
    create_market_tables(&conn_guard).unwrap();
    let mut conn = conn_guard;
    let cat = FixtureSde::new().with_type(InvType {
        type_id: 34,
        type_name: "Tritanium".into(),
        group_id: 18,
        group_name: "Minerals".into(),
        category_id: 4,
        category_name: "Material".into(),
    });
    let ids: HashSet<i64> = [34].into_iter().collect();

    watchlist::add_to_watchlist(&mut conn, &cat, &ids, watchlist::Target::Local)
        .await
        .unwrap();
    let second = watchlist::add_to_watchlist(&mut conn, &cat, &ids, watchlist::Target::Local)
        .await
        .unwrap();

    assert!(second.added.is_empty());
    assert_eq!(second.already_present, vec![34]);
    let count: i64 = conn.query_row("SELECT count(*) FROM watchlist", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 1);
}

// Completeness invariant: after upserting computed stats, every watchlisted
// type_id has exactly one marketstats row (ties scenario 1 to the upsert
// engine rather than just the derivation function).
#[test]
fn completeness_invariant_one_marketstats_row_per_watchlisted_type() {
    let mut conn = Connection::open_in_memory().unwrap();
    create_market_tables(&conn).unwrap();
    conn.execute_batch(
        "INSERT INTO watchlist VALUES (34, 'Tritanium', 18, 'Minerals', 4, 'Material');
         INSERT INTO watchlist VALUES (35, 'Pyerite', 18, 'Minerals', 4, 'Material');
         INSERT INTO watchlist VALUES (36, 'Mexallon', 18, 'Minerals', 4, 'Material');",
    )
    .unwrap();

    let stats = derive::calculate_market_stats(&conn, Utc::now()).unwrap();
    let rows: Vec<Row> = stats.iter().map(stat_row).collect();
    upsert(&mut conn, &MARKET_STATS, rows).unwrap();

    let count: i64 = conn.query_row("SELECT count(*) FROM marketstats", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 3);
}
