//! CSV backend.
//!
//! Layout: `{directory}/{prefix}_{ID}.csv` (or `{directory}/{ID}.csv`).
//!
//! A merge holds an advisory lock on `{file}.lock` for its whole duration. It
//! reads the stored file, appends the new rows, re-sorts and writes the result
//! to `{file}.tmp` before renaming it into place, so a crash never leaves a
//! half-written table behind. A `.tmp` found while holding the lock was left
//! by a writer that died and is removed.

use super::{require_watermark_column, StorageError, TableStore, Watermark};
use crate::catalog::{TableDescriptor, TICKER_COLUMN};
use crate::frame::{self, FrameError};
use fd_lock::RwLock;
use polars::prelude::DataFrame;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

pub struct CsvStore {
    directory: PathBuf,
    name_prefix: Option<String>,
}

impl CsvStore {
    pub fn new(directory: impl Into<PathBuf>, name_prefix: Option<String>) -> Self {
        Self {
            directory: directory.into(),
            name_prefix,
        }
    }

    /// Directory holding the table files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File holding one table.
    pub fn table_path(&self, table_id: &str) -> PathBuf {
        let file_name = match &self.name_prefix {
            Some(prefix) => format!("{prefix}_{table_id}.csv"),
            None => format!("{table_id}.csv"),
        };
        self.directory.join(file_name)
    }

    /// Advisory lock file guarding merges into one table.
    pub fn lock_path(&self, table_id: &str) -> PathBuf {
        self.table_path(table_id).with_extension("csv.lock")
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("csv.tmp")
    }

    /// Load a stored table with every column as text; `None` when no file
    /// exists yet.
    pub fn load(&self, table_id: &str) -> Result<Option<DataFrame>, StorageError> {
        let path = self.table_path(table_id);
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::unavailable(&path, e)),
        };
        if len == 0 {
            return Ok(Some(DataFrame::empty()));
        }
        frame::read_csv(&path, None)
            .map(Some)
            .map_err(|source| StorageError::Csv { path, source })
    }

    /// Take the table's write lock without blocking.
    fn lock_file(&self, table_id: &str) -> Result<RwLock<File>, StorageError> {
        let path = self.lock_path(table_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::unavailable(&path, e))?;
        Ok(RwLock::new(file))
    }

    /// Remove a `.tmp` left by a writer that no longer holds the lock.
    fn clear_stale_tmp(path: &Path) -> Result<(), StorageError> {
        let tmp_path = Self::tmp_path(path);
        match fs::remove_file(&tmp_path) {
            Ok(()) => {
                tracing::warn!(path = %tmp_path.display(), "removed stale temp file from an interrupted write");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::unavailable(&tmp_path, e)),
        }
    }

    fn write_atomic(&self, path: &Path, frame: &mut DataFrame) -> Result<(), StorageError> {
        let tmp_path = Self::tmp_path(path);
        let file = File::create(&tmp_path).map_err(|e| StorageError::unavailable(&tmp_path, e))?;

        let mut writer = BufWriter::new(file);
        let written = frame::write_csv(frame, &mut writer)
            .map_err(|source| StorageError::Csv {
                path: tmp_path.clone(),
                source,
            })
            .and_then(|()| {
                writer
                    .flush()
                    .and_then(|()| writer.get_ref().sync_all())
                    .map_err(|e| StorageError::unavailable(&tmp_path, e))
            });
        drop(writer);

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StorageError::unavailable(path, e)
        })
    }
}

fn corrupt(table: &TableDescriptor, err: FrameError) -> StorageError {
    StorageError::Corrupt {
        table: table.id.clone(),
        reason: err.to_string(),
    }
}

impl TableStore for CsvStore {
    fn describe(&self) -> String {
        format!("csv files in {}", self.directory.display())
    }

    fn read_watermark(&self, table: &TableDescriptor) -> Result<Watermark, StorageError> {
        let Some(stored) = self.load(&table.id)? else {
            return Ok(Watermark::TableAbsent);
        };
        if stored.height() == 0 {
            return Ok(Watermark::Empty);
        }
        let max = frame::max_date(&stored, table.watermark.as_str()).map_err(|e| corrupt(table, e))?;
        Ok(max.map_or(Watermark::Empty, Watermark::At))
    }

    fn distinct_tickers(&self, table: &TableDescriptor) -> Result<Option<Vec<String>>, StorageError> {
        match self.load(&table.id)? {
            None => Ok(None),
            Some(stored) if stored.width() == 0 => Ok(Some(Vec::new())),
            Some(stored) => frame::distinct_strings(&stored, TICKER_COLUMN)
                .map(Some)
                .map_err(|e| corrupt(table, e)),
        }
    }

    fn merge_and_persist(
        &self,
        table: &TableDescriptor,
        new_rows: DataFrame,
    ) -> Result<usize, StorageError> {
        let added = new_rows.height();
        if added == 0 {
            return Ok(0);
        }
        require_watermark_column(table, &new_rows)?;

        fs::create_dir_all(&self.directory)
            .map_err(|e| StorageError::unavailable(&self.directory, e))?;

        let mut lock = self.lock_file(&table.id)?;
        let _guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(StorageError::Locked {
                    path: self.lock_path(&table.id),
                });
            }
            Err(e) => return Err(StorageError::unavailable(&self.lock_path(&table.id), e)),
        };

        let path = self.table_path(&table.id);
        Self::clear_stale_tmp(&path)?;

        let stored = self.load(&table.id)?;
        let ticker = table.ticker_keyed.then_some(TICKER_COLUMN);
        let mut merged = frame::merge_frames(stored, new_rows)
            .and_then(|merged| frame::sort_for_storage(merged, table.watermark.as_str(), ticker))
            .map_err(|e| corrupt(table, e))?;

        self.write_atomic(&path, &mut merged)?;

        tracing::debug!(
            table = %table.id,
            added,
            total = merged.height(),
            path = %path.display(),
            "csv table rewritten"
        );
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::frame::{frame_from_rows, ColumnSpec};

    fn event_rows() -> DataFrame {
        frame_from_rows(
            &[ColumnSpec::text("ticker"), ColumnSpec::text("date")],
            &[vec!["A", "2020-01-02"]],
        )
        .unwrap()
    }

    #[test]
    fn file_names_follow_prefix() {
        let plain = CsvStore::new("data", None);
        assert_eq!(plain.table_path("SEP"), PathBuf::from("data/SEP.csv"));
        assert_eq!(plain.lock_path("SEP"), PathBuf::from("data/SEP.csv.lock"));

        let named = CsvStore::new("data", Some("mytest".into()));
        assert_eq!(named.table_path("SEP"), PathBuf::from("data/mytest_SEP.csv"));
    }

    #[test]
    fn absent_file_is_table_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path(), None);
        let table = Catalog::sharadar().lookup("EVENTS").unwrap().clone();
        assert_eq!(store.read_watermark(&table).unwrap(), Watermark::TableAbsent);
        assert_eq!(store.distinct_tickers(&table).unwrap(), None);
    }

    #[test]
    fn zero_byte_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("EVENTS.csv"), "").unwrap();
        let store = CsvStore::new(dir.path(), None);
        let table = Catalog::sharadar().lookup("EVENTS").unwrap().clone();
        assert_eq!(store.read_watermark(&table).unwrap(), Watermark::Empty);
    }

    #[test]
    fn empty_merge_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("nested"), None);
        let table = Catalog::sharadar().lookup("EVENTS").unwrap().clone();
        assert_eq!(store.merge_and_persist(&table, DataFrame::empty()).unwrap(), 0);
        assert!(!dir.path().join("nested").exists());
    }

    #[test]
    fn stale_tmp_file_is_removed_and_merge_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path(), None);
        let table = Catalog::sharadar().lookup("EVENTS").unwrap().clone();
        fs::write(dir.path().join("EVENTS.csv.tmp"), "partial").unwrap();

        assert_eq!(store.merge_and_persist(&table, event_rows()).unwrap(), 1);
        assert!(dir.path().join("EVENTS.csv").exists());
        assert!(!dir.path().join("EVENTS.csv.tmp").exists());
    }

    #[test]
    fn live_writer_lock_means_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path(), None);
        let table = Catalog::sharadar().lookup("EVENTS").unwrap().clone();

        let mut held = RwLock::new(File::create(store.lock_path("EVENTS")).unwrap());
        let _writer = held.try_write().unwrap();

        let err = store.merge_and_persist(&table, event_rows()).unwrap_err();
        assert!(matches!(err, StorageError::Locked { .. }), "got {err:?}");
        assert!(!dir.path().join("EVENTS.csv").exists());
    }

    #[test]
    fn rows_without_watermark_column_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path(), None);
        let table = Catalog::sharadar().lookup("EVENTS").unwrap().clone();
        let rows = frame_from_rows(&[ColumnSpec::text("ticker")], &[vec!["A"]]).unwrap();

        let err = store.merge_and_persist(&table, rows).unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch { .. }), "got {err:?}");
        assert!(!dir.path().join("EVENTS.csv").exists());
    }
}
