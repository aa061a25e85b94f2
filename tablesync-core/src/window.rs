//! Sync windows and the date range resolver.
//!
//! The resolver turns (table, user overrides, stored watermark, today) into
//! the minimal `[start, end]` range that still needs fetching. `today` is
//! always passed in so resolution is deterministic and testable.

use crate::catalog::TableDescriptor;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Inclusive date range to request from the vendor. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl SyncWindow {
    /// Window from `start` to `end`; an inverted pair is [`WindowError::InvalidRange`].
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First requested date.
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Last requested date.
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of calendar days covered, both ends inclusive.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    /// The stored data already reaches the end of the window.
    #[error("already up to date (stored through {watermark})")]
    UpToDate { watermark: NaiveDate },
}

/// Which day a sync runs up to when the user gives no `to_date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndPolicy {
    #[default]
    Today,
    /// Vendor data lags by one day.
    Yesterday,
}

/// Explicit user-supplied bounds. Either side may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverrides {
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
}

/// Computes sync windows from overrides and stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRangeResolver {
    pub end_policy: EndPolicy,
    /// First date requested for a small table that has never been synced.
    pub epoch_floor: NaiveDate,
    /// First fetch of a large table only goes this many days back from the end.
    pub first_run_lookback_days: u32,
}

impl Default for DateRangeResolver {
    fn default() -> Self {
        Self {
            end_policy: EndPolicy::Today,
            epoch_floor: default_epoch_floor(),
            first_run_lookback_days: 7,
        }
    }
}

/// 2000-01-01, the earliest date the vendor tables cover.
pub fn default_epoch_floor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

impl DateRangeResolver {
    /// Resolve the window for one table.
    ///
    /// - end: `to_date`, else today/yesterday per [`EndPolicy`]
    /// - start: `from_date`, else `watermark + 1`, else the first-run default
    ///
    /// A watermark-derived start that has reached the end yields
    /// [`WindowError::UpToDate`]; any other inverted range is
    /// [`WindowError::InvalidRange`].
    pub fn resolve(
        &self,
        table: &TableDescriptor,
        overrides: &DateOverrides,
        watermark: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<SyncWindow, WindowError> {
        let end = overrides.to_date.unwrap_or(match self.end_policy {
            EndPolicy::Today => today,
            EndPolicy::Yesterday => today - Duration::days(1),
        });

        let start = match (overrides.from_date, watermark) {
            (Some(from), _) => from,
            (None, Some(wm)) => {
                let next = wm + Duration::days(1);
                if next >= end {
                    return Err(WindowError::UpToDate { watermark: wm });
                }
                next
            }
            (None, None) if table.is_large() => {
                end - Duration::days(i64::from(self.first_run_lookback_days))
            }
            (None, None) => self.epoch_floor,
        };

        SyncWindow::new(start, end)
    }
}
