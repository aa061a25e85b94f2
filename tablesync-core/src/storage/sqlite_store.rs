//! SQLite backend.
//!
//! One relational table per catalog table, created from the vendor's column
//! list on first write. Rows are only ever appended, inside one transaction
//! per merge; nothing is updated or deleted.

use super::{require_watermark_column, StorageError, TableStore, Watermark};
use crate::catalog::{TableDescriptor, TICKER_COLUMN};
use crate::frame::{column_specs, date_from_days, parse_date};
use polars::prelude::{AnyValue, DataFrame};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a statement waits on another connection's lock before the store
/// reports [`StorageError::Locked`].
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Override how long to wait on a database locked by another connection.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only handle, or `None` if the database file does not exist yet.
    fn open_existing(&self) -> Result<Option<Connection>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| self.map_err(e))?;
        conn.busy_timeout(self.busy_timeout).map_err(|e| self.map_err(e))?;
        Ok(Some(conn))
    }

    /// Read-write handle, creating the parent directory and database file.
    fn open_for_write(&self) -> Result<Connection, StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StorageError::unavailable(parent, e))?;
        }
        let conn = Connection::open(&self.path).map_err(|e| self.map_err(e))?;
        conn.busy_timeout(self.busy_timeout).map_err(|e| self.map_err(e))?;
        Ok(conn)
    }

    fn map_err(&self, e: rusqlite::Error) -> StorageError {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StorageError::Locked {
                    path: self.path.clone(),
                }
            }
            _ => StorageError::Sqlite(e),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_exists(conn: &Connection, table_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn table_columns(conn: &Connection, table_id: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table_id)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(names)
}

/// SQL value for one frame cell. Dates are stored as `YYYY-MM-DD` text.
fn sql_value(cell: AnyValue<'_>) -> Value {
    match cell {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Integer(i64::from(b)),
        AnyValue::Int32(v) => Value::Integer(i64::from(v)),
        AnyValue::Int64(v) => Value::Integer(v),
        AnyValue::UInt32(v) => Value::Integer(i64::from(v)),
        AnyValue::Float32(v) => Value::Real(f64::from(v)),
        AnyValue::Float64(v) => Value::Real(v),
        AnyValue::String(s) => Value::Text(s.to_string()),
        AnyValue::StringOwned(s) => Value::Text(s.to_string()),
        AnyValue::Date(days) => match date_from_days(days) {
            Some(date) => Value::Text(date.to_string()),
            None => Value::Null,
        },
        other => Value::Text(other.to_string()),
    }
}

impl TableStore for SqliteStore {
    fn describe(&self) -> String {
        format!("sqlite database {}", self.path.display())
    }

    fn read_watermark(&self, table: &TableDescriptor) -> Result<Watermark, StorageError> {
        let Some(conn) = self.open_existing()? else {
            return Ok(Watermark::TableAbsent);
        };
        if !table_exists(&conn, &table.id).map_err(|e| self.map_err(e))? {
            return Ok(Watermark::TableAbsent);
        }

        let sql = format!(
            "SELECT MAX({}) FROM {}",
            quote_ident(table.watermark.as_str()),
            quote_ident(&table.id)
        );
        let max: Option<String> = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| self.map_err(e))?;

        match max {
            None => Ok(Watermark::Empty),
            Some(value) => parse_date(&value)
                .map(Watermark::At)
                .ok_or_else(|| StorageError::Corrupt {
                    table: table.id.clone(),
                    reason: format!("MAX({}) is not a date: '{value}'", table.watermark),
                }),
        }
    }

    fn distinct_tickers(&self, table: &TableDescriptor) -> Result<Option<Vec<String>>, StorageError> {
        let Some(conn) = self.open_existing()? else {
            return Ok(None);
        };
        if !table_exists(&conn, &table.id).map_err(|e| self.map_err(e))? {
            return Ok(None);
        }

        let col = quote_ident(TICKER_COLUMN);
        let sql = format!(
            "SELECT DISTINCT {col} FROM {} WHERE {col} IS NOT NULL AND {col} <> '' ORDER BY {col}",
            quote_ident(&table.id)
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| self.map_err(e))?;
        let tickers = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| self.map_err(e))?;
        Ok(Some(tickers))
    }

    fn merge_and_persist(
        &self,
        table: &TableDescriptor,
        new_rows: DataFrame,
    ) -> Result<usize, StorageError> {
        if new_rows.height() == 0 {
            return Ok(0);
        }
        require_watermark_column(table, &new_rows)?;

        let mut conn = self.open_for_write()?;
        let tx = conn.transaction().map_err(|e| self.map_err(e))?;

        if !table_exists(&tx, &table.id).map_err(|e| self.map_err(e))? {
            let defs: Vec<String> = column_specs(&new_rows)
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
                .collect();
            let ddl = format!("CREATE TABLE {} ({})", quote_ident(&table.id), defs.join(", "));
            tx.execute(&ddl, []).map_err(|e| self.map_err(e))?;
            tracing::info!(table = %table.id, columns = defs.len(), "created relational table");
        }

        let existing = table_columns(&tx, &table.id).map_err(|e| self.map_err(e))?;
        let (kept, dropped): (Vec<_>, Vec<_>) = new_rows
            .get_columns()
            .iter()
            .partition(|c| existing.contains(c.name().as_str()));

        if kept.is_empty() {
            return Err(StorageError::SchemaMismatch {
                table: table.id.clone(),
                reason: "none of the incoming columns exist in the stored table".into(),
            });
        }
        if !existing.contains(table.watermark.as_str()) {
            return Err(StorageError::SchemaMismatch {
                table: table.id.clone(),
                reason: format!("stored table has no '{}' column", table.watermark),
            });
        }
        if !dropped.is_empty() {
            let names: Vec<&str> = dropped.iter().map(|c| c.name().as_str()).collect();
            tracing::warn!(
                table = %table.id,
                columns = ?names,
                "dropping columns the stored table does not have"
            );
        }

        let names: Vec<String> = kept.iter().map(|c| quote_ident(c.name())).collect();
        let placeholders: Vec<String> = (1..=kept.len()).map(|i| format!("?{i}")).collect();
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&table.id),
            names.join(", "),
            placeholders.join(", ")
        );

        let mut stmt = tx.prepare(&insert).map_err(|e| self.map_err(e))?;
        let mut count = 0;
        for row in 0..new_rows.height() {
            let values = kept
                .iter()
                .map(|c| c.get(row).map(sql_value))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Corrupt {
                    table: table.id.clone(),
                    reason: e.to_string(),
                })?;
            stmt.execute(params_from_iter(values))
                .map_err(|e| self.map_err(e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit().map_err(|e| self.map_err(e))?;

        tracing::debug!(table = %table.id, rows = count, "appended rows");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_double_quotes() {
        assert_eq!(quote_ident("date"), "\"date\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn cells_keep_their_type() {
        assert_eq!(sql_value(AnyValue::Null), Value::Null);
        assert_eq!(sql_value(AnyValue::Int64(42)), Value::Integer(42));
        assert_eq!(sql_value(AnyValue::Float64(1.5)), Value::Real(1.5));
        assert_eq!(sql_value(AnyValue::String("n/a")), Value::Text("n/a".into()));
        assert_eq!(sql_value(AnyValue::Date(18292)), Value::Text("2020-01-31".into()));
    }

    #[test]
    fn missing_database_file_is_table_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sharadar.db"));
        let table = crate::catalog::Catalog::sharadar().lookup("SF1").unwrap().clone();
        assert_eq!(store.read_watermark(&table).unwrap(), Watermark::TableAbsent);
        assert!(!store.path().exists());
    }
}
