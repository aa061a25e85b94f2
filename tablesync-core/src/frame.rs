//! Vendor batches as polars [`DataFrame`]s.
//!
//! Vendor tables have different schemas, so a batch carries whatever columns
//! the vendor declared, typed by their [`ColumnKind`]. The helpers here are
//! the frame operations storage and staging share: CSV I/O, diagonal merges,
//! the storage sort order, the watermark maximum and distinct tickers.

use chrono::{Datelike, NaiveDate};
use polars::functions::concat_df_diagonal;
use polars::prelude::{
    col, AnyValue, Column, CsvReadOptions, CsvWriter, DataFrame, DataType, Field, IntoLazy,
    PolarsError, Schema, SerReader, SerWriter, SortMultipleOptions, UniqueKeepStrategy,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// 1970-01-01 counted from 0001-01-01; polars stores dates as days since it.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Logical type of a column, used to declare frame and relational column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    #[default]
    Text,
    Integer,
    Real,
    Date,
}

impl ColumnKind {
    /// Map a vendor type name (`String`, `Date`, `Integer`, `double`,
    /// `BigDecimal(34,12)`, ...) to a kind.
    pub fn from_vendor_type(type_name: &str) -> Self {
        let t = type_name.trim().to_ascii_lowercase();
        if t == "date" || t == "datetime" {
            ColumnKind::Date
        } else if t == "integer" || t == "int" || t == "long" {
            ColumnKind::Integer
        } else if t == "double" || t == "float" || t.starts_with("bigdecimal") || t == "decimal" {
            ColumnKind::Real
        } else {
            ColumnKind::Text
        }
    }

    /// Kind of an existing polars column.
    pub fn from_dtype(dtype: &DataType) -> Self {
        match dtype {
            DataType::Date => ColumnKind::Date,
            d if d.is_integer() => ColumnKind::Integer,
            d if d.is_float() => ColumnKind::Real,
            _ => ColumnKind::Text,
        }
    }

    /// Polars dtype a column of this kind is built with.
    pub fn dtype(self) -> DataType {
        match self {
            ColumnKind::Text => DataType::String,
            ColumnKind::Integer => DataType::Int64,
            ColumnKind::Real => DataType::Float64,
            ColumnKind::Date => DataType::Date,
        }
    }

    /// SQLite column affinity for this kind.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text | ColumnKind::Date => "TEXT",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
        }
    }
}

/// Name and kind of one vendor column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Shorthand for a [`ColumnKind::Text`] column.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("row has {got} cells, expected {expected}")]
    RowWidth { expected: usize, got: usize },

    #[error("missing column '{0}'")]
    MissingColumn(String),

    #[error("column '{column}' holds a value that is not {kind:?}: '{value}'")]
    BadCell {
        column: String,
        kind: ColumnKind,
        value: String,
    },

    #[error("column '{0}' holds values that are not dates")]
    BadDate(String),

    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),
}

/// Build a typed frame from rows of text cells. An empty cell is a null.
pub fn frame_from_rows<S: AsRef<str>>(
    columns: &[ColumnSpec],
    rows: &[Vec<S>],
) -> Result<DataFrame, FrameError> {
    if let Some(row) = rows.iter().find(|r| r.len() != columns.len()) {
        return Err(FrameError::RowWidth {
            expected: columns.len(),
            got: row.len(),
        });
    }

    let built = columns
        .iter()
        .enumerate()
        .map(|(i, spec)| typed_column(spec, rows.iter().map(|r| r[i].as_ref())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DataFrame::new(built)?)
}

fn typed_column<'a>(
    spec: &ColumnSpec,
    cells: impl Iterator<Item = &'a str>,
) -> Result<Column, FrameError> {
    let name = spec.name.as_str().into();
    match spec.kind {
        ColumnKind::Text => {
            let values: Vec<Option<String>> = cells
                .map(|c| (!c.is_empty()).then(|| c.to_string()))
                .collect();
            Ok(Column::new(name, values))
        }
        ColumnKind::Integer => {
            let values = cells
                .map(|c| parse_cell(spec, c, parse_integer))
                .collect::<Result<Vec<Option<i64>>, _>>()?;
            Ok(Column::new(name, values))
        }
        ColumnKind::Real => {
            let values = cells
                .map(|c| parse_cell(spec, c, |v| v.parse::<f64>().ok()))
                .collect::<Result<Vec<Option<f64>>, _>>()?;
            Ok(Column::new(name, values))
        }
        ColumnKind::Date => {
            let days = cells
                .map(|c| parse_cell(spec, c, |v| parse_date(v).map(days_from_date)))
                .collect::<Result<Vec<Option<i32>>, _>>()?;
            Ok(Column::new(name, days).cast(&DataType::Date)?)
        }
    }
}

fn parse_cell<T>(
    spec: &ColumnSpec,
    cell: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, FrameError> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    parse(cell).map(Some).ok_or_else(|| FrameError::BadCell {
        column: spec.name.clone(),
        kind: spec.kind,
        value: cell.to_string(),
    })
}

fn parse_integer(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|f| f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

/// Name and kind of every column, in order.
pub fn column_specs(frame: &DataFrame) -> Vec<ColumnSpec> {
    frame
        .get_columns()
        .iter()
        .map(|c| ColumnSpec::new(c.name().as_str(), ColumnKind::from_dtype(c.dtype())))
        .collect()
}

/// Polars schema matching a column list.
pub fn schema_for(columns: &[ColumnSpec]) -> Schema {
    Schema::from_iter(
        columns
            .iter()
            .map(|c| Field::new(c.name.as_str().into(), c.kind.dtype())),
    )
}

/// Read a headed CSV file.
///
/// With a schema, cells are parsed to its dtypes. Without one every column is
/// read as text, so stored cells come back exactly as written.
pub fn read_csv(path: &Path, schema: Option<Schema>) -> Result<DataFrame, FrameError> {
    let options = CsvReadOptions::default().with_has_header(true);
    let options = match schema {
        Some(schema) => options.with_schema(Some(Arc::new(schema))),
        None => options.with_infer_schema_length(Some(0)),
    };
    let frame = options
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(frame)
}

/// Write a headed CSV. Nulls become empty cells, dates `YYYY-MM-DD`.
pub fn write_csv<W: Write>(frame: &mut DataFrame, writer: W) -> Result<(), FrameError> {
    CsvWriter::new(writer).include_header(true).finish(frame)?;
    Ok(())
}

/// Append `incoming` below `stored`, matching columns by name.
///
/// Stored columns that `incoming` also has are cast to the incoming dtype.
/// Columns only one side has are kept and filled with nulls on the other.
pub fn merge_frames(stored: Option<DataFrame>, incoming: DataFrame) -> Result<DataFrame, FrameError> {
    let Some(stored) = stored.filter(|s| s.width() > 0) else {
        return Ok(incoming);
    };
    let stored = conform(stored, &incoming)?;
    Ok(concat_df_diagonal(&[stored, incoming])?)
}

fn conform(mut stored: DataFrame, incoming: &DataFrame) -> Result<DataFrame, FrameError> {
    for column in incoming.get_columns() {
        let Ok(existing) = stored.column(column.name().as_str()) else {
            continue;
        };
        if existing.dtype() != column.dtype() {
            let cast = existing.cast(column.dtype())?;
            stored.with_column(cast)?;
        }
    }
    Ok(stored)
}

fn require_column(frame: &DataFrame, name: &str) -> Result<(), FrameError> {
    if frame.column(name).is_err() {
        return Err(FrameError::MissingColumn(name.to_string()));
    }
    Ok(())
}

/// Storage order: date column descending, then ticker ascending when a
/// ticker column is given. Ties keep their input order; nulls go last.
pub fn sort_for_storage(
    frame: DataFrame,
    date_column: &str,
    ticker_column: Option<&str>,
) -> Result<DataFrame, FrameError> {
    let mut by = vec![date_column];
    let mut descending = vec![true];
    if let Some(ticker) = ticker_column {
        by.push(ticker);
        descending.push(false);
    }
    for name in &by {
        require_column(&frame, name)?;
    }

    let sorted = frame.sort(
        by,
        SortMultipleOptions::default()
            .with_order_descending_multi(descending)
            .with_maintain_order(true)
            .with_nulls_last(true),
    )?;
    Ok(sorted)
}

/// Latest date in a column, `None` when it holds no dates. Text columns are
/// cast first; a value that is not a date is an error.
pub fn max_date(frame: &DataFrame, column: &str) -> Result<Option<NaiveDate>, FrameError> {
    let values = frame
        .column(column)
        .map_err(|_| FrameError::MissingColumn(column.to_string()))?;
    let dates = values
        .as_materialized_series()
        .strict_cast(&DataType::Date)
        .map_err(|_| FrameError::BadDate(column.to_string()))?;

    match dates.max_reduce()?.value() {
        AnyValue::Date(days) => Ok(date_from_days(*days)),
        AnyValue::Null => Ok(None),
        _ => Err(FrameError::BadDate(column.to_string())),
    }
}

/// Sorted distinct non-empty values of a column, as text.
pub fn distinct_strings(frame: &DataFrame, column: &str) -> Result<Vec<String>, FrameError> {
    require_column(frame, column)?;
    let unique = frame
        .clone()
        .lazy()
        .select([col(column).cast(DataType::String)])
        .unique_stable(Some(vec![column.into()]), UniqueKeepStrategy::First)
        .collect()?;

    let mut values: Vec<String> = unique
        .column(column)?
        .str()?
        .into_iter()
        .flatten()
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect();
    values.sort();
    Ok(values)
}

/// Parse the `YYYY-MM-DD` prefix of a cell.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let prefix = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Date of a polars physical date value (days since 1970-01-01).
pub fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

/// Polars physical value of a date.
pub fn days_from_date(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}
