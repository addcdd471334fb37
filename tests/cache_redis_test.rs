//! End to end cache semantics against a real backend. These need a
//! redis at redis://127.0.0.1:6379 and use database 15 as scratch
//! space, so they are ignored by default:
//!
//! ```text
//! cargo test -- --ignored
//! ```

use std::collections::HashMap;

use mysql_cdc::cache::{PositionStore, Rcache, Row, ACTION_COLUMN, TS_COLUMN};

const SCRATCH_URL: &str = "redis://127.0.0.1:6379/15";
const SERVER_ID: u32 = 42;

fn scratch_cache() -> Rcache {
    let mut cache = Rcache::from_url(SCRATCH_URL, SERVER_ID).unwrap();
    cache.clear().unwrap();
    cache
}

fn row(action: &str, ts: u64, pairs: &[(&str, &str)]) -> Row {
    let mut row = Row::new();
    row.insert(ACTION_COLUMN.to_string(), action.to_string());
    row.insert(TS_COLUMN.to_string(), ts.to_string());
    for (k, v) in pairs {
        row.insert(k.to_string(), v.to_string());
    }
    row
}

fn keys(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

#[test]
#[ignore]
fn insert_then_delete_leaves_nothing() {
    let mut cache = scratch_cache();
    cache
        .save("db.t", &keys(&["id"]), &[row("insert", 10, &[("id", "1")])])
        .unwrap();
    cache
        .save("db.t", &keys(&["id"]), &[row("delete", 11, &[("id", "1")])])
        .unwrap();
    assert!(cache.tables().unwrap().is_empty());
}

#[test]
#[ignore]
fn merge_keeps_net_effect_per_rid() {
    let mut cache = scratch_cache();
    cache
        .save(
            "db.t",
            &keys(&["id"]),
            &[row("insert", 10, &[("id", "1"), ("x", "a")])],
        )
        .unwrap();
    cache
        .save(
            "db.t",
            &keys(&["id"]),
            &[row("update", 11, &[("id", "1"), ("x", "b")])],
        )
        .unwrap();

    let mut dumped: Vec<(String, Row)> = Vec::new();
    cache
        .dump_by_row(|table, row| {
            dumped.push((table.to_string(), row));
            Ok(())
        })
        .unwrap();
    assert_eq!(dumped.len(), 1);
    let (table, merged) = &dumped[0];
    assert_eq!(table, "db.t");
    assert_eq!(merged.get(ACTION_COLUMN).unwrap(), "insert");
    assert_eq!(merged.get("x").unwrap(), "b");
    assert_eq!(merged.get(TS_COLUMN).unwrap(), "11");

    // dump_by_row cleared everything
    assert!(cache.tables().unwrap().is_empty());
}

#[test]
#[ignore]
fn composite_rid_joins_with_ampersand() {
    let mut cache = scratch_cache();
    cache
        .save(
            "db.t",
            &keys(&["a", "b"]),
            &[row("insert", 10, &[("a", "1"), ("b", "2")])],
        )
        .unwrap();
    let mut seen = Vec::new();
    cache
        .dump_by_row(|_, row| {
            seen.push(row);
            Ok(())
        })
        .unwrap();
    assert_eq!(seen.len(), 1);

    // the payload key carries the derived rid
    let mut fresh = scratch_cache();
    fresh
        .save(
            "db.t",
            &keys(&["a", "b"]),
            &[row("insert", 10, &[("a", "1"), ("b", "2")])],
        )
        .unwrap();
    let client = redis::Client::open(SCRATCH_URL).unwrap();
    let mut conn = client.get_connection().unwrap();
    let payload: HashMap<String, String> =
        redis::Commands::hgetall(&mut conn, format!("{}#db.t.1&2", SERVER_ID)).unwrap();
    assert!(!payload.is_empty());
}

#[test]
#[ignore]
fn save_ignore_reports_but_keeps_good_rows() {
    let mut cache = scratch_cache();
    let rows = vec![
        row("insert", 10, &[("id", "1")]),
        row("insert", 10, &[("other", "x")]), // no id column
    ];
    let err = cache.save("db.t", &keys(&["id"]), &rows).unwrap_err();
    assert!(err.to_string().contains("ignored"));
    // the well formed row was still merged
    assert_eq!(cache.tables().unwrap(), vec!["db.t".to_string()]);
}

#[test]
#[ignore]
fn dump_by_table_batches_and_clears() {
    let mut cache = scratch_cache();
    let rows: Vec<Row> = (0..5)
        .map(|i| row("insert", 10, &[("id", &i.to_string())]))
        .collect();
    cache.save("db.t", &keys(&["id"]), &rows).unwrap();

    let mut batches: Vec<usize> = Vec::new();
    let mut total = 0usize;
    cache
        .dump_by_table(
            |table, rows| {
                assert_eq!(table, "db.t");
                batches.push(rows.len());
                total += rows.len();
                Ok(())
            },
            2,
            None,
        )
        .unwrap();
    assert_eq!(total, 5);
    assert!(batches.iter().all(|b| *b <= 2));
    assert!(cache.tables().unwrap().is_empty());
}

#[test]
#[ignore]
fn corrupted_position_surfaces_instead_of_resuming() {
    let client = redis::Client::open(SCRATCH_URL).unwrap();
    let mut conn = client.get_connection().unwrap();
    let _: () = redis::Commands::set(&mut conn, "log_file", "mysql-bin.000004").unwrap();
    let _: () = redis::Commands::set(&mut conn, "log_pos", "not-a-number").unwrap();

    let mut store = PositionStore::from_url(SCRATCH_URL).unwrap();
    assert!(store.get().is_err());

    let _: () = redis::Commands::set(&mut conn, "log_pos", "1572").unwrap();
    assert_eq!(
        store.get().unwrap(),
        Some(("mysql-bin.000004".to_string(), 1572))
    );
}

#[test]
#[ignore]
fn failing_callback_leaves_the_table_pending() {
    let mut cache = scratch_cache();
    cache
        .save("db.t", &keys(&["id"]), &[row("insert", 10, &[("id", "1")])])
        .unwrap();
    let result = cache.dump_by_table(
        |_, _| Err(mysql_cdc::error::CdcError::Config("disk full".into())),
        0,
        None,
    );
    assert!(result.is_err());
    // nothing was cleared, the next cycle retries
    assert_eq!(cache.tables().unwrap(), vec!["db.t".to_string()]);
}
