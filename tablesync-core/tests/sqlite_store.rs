//! Integration tests for the SQLite storage adapter.

use chrono::NaiveDate;
use polars::prelude::DataFrame;
use rusqlite::Connection;
use std::time::Duration;
use tablesync_core::storage::{database_path, SqliteStore};
use tablesync_core::{
    frame_from_rows, Catalog, ColumnKind, ColumnSpec, StorageError, TableStore, Watermark,
};

fn daily_rows(rows: &[(&str, &str, &str)]) -> DataFrame {
    let cells: Vec<Vec<&str>> = rows
        .iter()
        .map(|(ticker, date, cap)| vec![*ticker, *date, *date, *cap])
        .collect();
    frame_from_rows(
        &[
            ColumnSpec::text("ticker"),
            ColumnSpec::new("date", ColumnKind::Date),
            ColumnSpec::new("lastupdated", ColumnKind::Date),
            ColumnSpec::new("marketcap", ColumnKind::Real),
        ],
        &cells,
    )
    .unwrap()
}

fn text_rows(names: &[&str], rows: &[Vec<&str>]) -> DataFrame {
    let columns: Vec<ColumnSpec> = names.iter().map(|n| ColumnSpec::text(*n)).collect();
    frame_from_rows(&columns, rows).unwrap()
}

fn row_count(store: &SqliteStore, table: &str) -> i64 {
    let conn = Connection::open(store.path()).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn first_write_creates_database_and_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = database_path(&dir.path().join("data"), Some("mytest"));
    let store = SqliteStore::new(&path);
    let daily = Catalog::sharadar().lookup("DAILY").unwrap().clone();

    assert_eq!(store.read_watermark(&daily).unwrap(), Watermark::TableAbsent);

    let written = store
        .merge_and_persist(&daily, daily_rows(&[("AAPL", "2020-01-31", "1350000.5")]))
        .unwrap();
    assert_eq!(written, 1);
    assert!(path.exists());
    assert_eq!(
        store.read_watermark(&daily).unwrap(),
        Watermark::At(NaiveDate::from_ymd_opt(2020, 1, 31).unwrap())
    );

    let conn = Connection::open(&path).unwrap();
    let (date, cap): (String, f64) = conn
        .query_row("SELECT date, marketcap FROM DAILY", [], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap();
    assert_eq!(date, "2020-01-31");
    assert_eq!(cap, 1350000.5);
}

#[test]
fn merges_only_append() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("sharadar.db"));
    let daily = Catalog::sharadar().lookup("DAILY").unwrap().clone();

    store
        .merge_and_persist(&daily, daily_rows(&[("AAPL", "2020-01-30", "1"), ("MSFT", "2020-01-30", "2")]))
        .unwrap();
    store
        .merge_and_persist(&daily, daily_rows(&[("AAPL", "2020-01-31", "3")]))
        .unwrap();

    assert_eq!(row_count(&store, "DAILY"), 3);
    assert_eq!(
        store.distinct_tickers(&daily).unwrap(),
        Some(vec!["AAPL".to_string(), "MSFT".to_string()])
    );
}

#[test]
fn unknown_columns_are_dropped_not_migrated() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("sharadar.db"));
    let daily = Catalog::sharadar().lookup("DAILY").unwrap().clone();

    store
        .merge_and_persist(&daily, daily_rows(&[("AAPL", "2020-01-30", "1")]))
        .unwrap();

    let wider = text_rows(
        &["ticker", "date", "lastupdated", "marketcap", "ev"],
        &[vec!["AAPL", "2020-01-31", "2020-01-31", "2", "99"]],
    );
    assert_eq!(store.merge_and_persist(&daily, wider).unwrap(), 1);

    let conn = Connection::open(store.path()).unwrap();
    let has_ev: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('DAILY') WHERE name = 'ev'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(has_ev, 0);
}

#[test]
fn rows_without_the_watermark_column_are_rejected_before_insert() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("sharadar.db"));
    let events = Catalog::sharadar().lookup("EVENTS").unwrap().clone();

    store
        .merge_and_persist(&events, text_rows(&["ticker", "date"], &[vec!["AAPL", "2020-01-28"]]))
        .unwrap();

    let renamed = text_rows(&["symbol"], &[vec!["AAPL"]]);
    let err = store.merge_and_persist(&events, renamed).unwrap_err();
    assert!(matches!(err, StorageError::SchemaMismatch { .. }), "got {err:?}");
    assert_eq!(row_count(&store, "EVENTS"), 1);
}

#[test]
fn no_shared_columns_is_a_schema_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("sharadar.db"));
    let events = Catalog::sharadar().lookup("EVENTS").unwrap().clone();

    let conn = Connection::open(store.path()).unwrap();
    conn.execute_batch("CREATE TABLE EVENTS (symbol TEXT, eventdate TEXT)")
        .unwrap();
    drop(conn);

    let rows = text_rows(&["ticker", "date"], &[vec!["AAPL", "2020-01-28"]]);
    let err = store.merge_and_persist(&events, rows).unwrap_err();
    match err {
        StorageError::SchemaMismatch { table, reason } => {
            assert_eq!(table, "EVENTS");
            assert!(reason.contains("none of the incoming columns"), "{reason}");
        }
        other => panic!("expected schema mismatch, got {other:?}"),
    }
    assert_eq!(row_count(&store, "EVENTS"), 0);
}

#[test]
fn database_locked_by_another_writer_is_locked() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("sharadar.db"))
        .with_busy_timeout(Duration::from_millis(50));
    let daily = Catalog::sharadar().lookup("DAILY").unwrap().clone();
    store
        .merge_and_persist(&daily, daily_rows(&[("AAPL", "2020-01-30", "1")]))
        .unwrap();

    let holder = Connection::open(store.path()).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let err = store
        .merge_and_persist(&daily, daily_rows(&[("AAPL", "2020-01-31", "2")]))
        .unwrap_err();
    assert!(matches!(err, StorageError::Locked { .. }), "got {err:?}");
    let err = store.read_watermark(&daily).unwrap_err();
    assert!(matches!(err, StorageError::Locked { .. }), "got {err:?}");

    holder.execute_batch("ROLLBACK").unwrap();
    assert_eq!(row_count(&store, "DAILY"), 1);
}

#[test]
fn table_absent_in_existing_database() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("sharadar.db"));
    let catalog = Catalog::sharadar();
    store
        .merge_and_persist(
            catalog.lookup("DAILY").unwrap(),
            daily_rows(&[("AAPL", "2020-01-30", "1")]),
        )
        .unwrap();

    let sep = catalog.lookup("SEP").unwrap();
    assert_eq!(store.read_watermark(sep).unwrap(), Watermark::TableAbsent);
    assert_eq!(store.distinct_tickers(sep).unwrap(), None);
}
