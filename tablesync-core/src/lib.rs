//! tablesync core: catalog, sync windows, storage adapters, partitioning, vendor client.
//!
//! This crate holds every piece of the incremental sync that does not drive
//! a run on its own:
//! - Table catalog with typed descriptors
//! - Date range resolver producing minimal sync windows
//! - Polars frame helpers for vendor batches
//! - CSV and SQLite storage adapters behind one trait
//! - Ticker partitioner for large tables
//! - Nasdaq Data Link client with retries and a circuit breaker

pub mod catalog;
pub mod frame;
pub mod partition;
pub mod storage;
pub mod vendor;
pub mod window;

pub use catalog::{Catalog, CatalogError, TableDescriptor, WatermarkColumn};
pub use frame::{frame_from_rows, ColumnKind, ColumnSpec, FrameError};
pub use partition::TickerPartitioner;
pub use storage::{open_store, StorageError, StorageKind, TableStore, Watermark};
pub use vendor::{FetchFilter, Vendor, VendorError};
pub use window::{DateOverrides, DateRangeResolver, EndPolicy, SyncWindow, WindowError};
