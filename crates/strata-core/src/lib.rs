//! Core domain model for the layered pipeline: cell values, record batches and job descriptors.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Column that carries the load marker of every ingested row.
pub const LOAD_MARKER_COLUMN: &str = "load_ts";

/// Rendering used for timestamps in landing files and in the relational stores.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Types a raw flat-file cell. Empty cells are null.
    pub fn from_cell(cell: &str) -> Self {
        if cell.is_empty() {
            return Value::Null;
        }
        if let Ok(v) = cell.parse::<i64>() {
            return Value::Integer(v);
        }
        if cell.bytes().any(|b| b.is_ascii_digit()) {
            if let Ok(v) = cell.parse::<f64>() {
                return Value::Real(v);
            }
        }
        match cell {
            "true" | "True" | "TRUE" => Value::Boolean(true),
            "false" | "False" | "FALSE" => Value::Boolean(false),
            _ => Value::Text(cell.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Real(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
        }
    }

    /// Total order over values: `Null < Boolean < numbers < Timestamp < Text`.
    /// Integers and reals compare numerically with each other.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.rank().cmp(&b.rank()),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(v) => write!(f, "{v}"),
            // keep a trailing `.0` so whole reals read back as reals
            Value::Real(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 => {
                write!(f, "{v:.1}")
            }
            Value::Real(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{}", v.format(TIMESTAMP_FORMAT)),
        }
    }
}

/// Parses the timestamp shapes seen in open-data feeds and landing files.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts);
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    #[error("row has {found} cells but the batch has {expected} columns")]
    RowWidth { expected: usize, found: usize },
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    #[error("column `{column}`: cannot read `{value}` as a timestamp")]
    InvalidTimestamp { column: String, value: String },
}

/// Ordered rows sharing one column set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RecordBatch {
    pub fn new(columns: Vec<String>) -> Result<Self, BatchError> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].contains(column) {
                return Err(BatchError::DuplicateColumn(column.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, BatchError> {
        let mut batch = Self::new(columns)?;
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Builds a batch from keyed records; the column set is the union of all keys
    /// in first-seen order and absent keys become nulls.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Vec<(String, Value)>>,
    {
        let records: Vec<_> = records.into_iter().collect();
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for (name, _) in record {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let mut row = vec![Value::Null; columns.len()];
            for (name, value) in record {
                if let Some(idx) = columns.iter().position(|c| *c == name) {
                    row[idx] = value;
                }
            }
            rows.push(row);
        }
        Self { columns, rows }
    }

    /// Concatenates batches, unioning their column sets in first-seen order.
    pub fn concat<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = RecordBatch>,
    {
        let batches: Vec<_> = batches.into_iter().collect();
        let mut columns: Vec<String> = Vec::new();
        for batch in &batches {
            for column in &batch.columns {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        let total = batches.iter().map(RecordBatch::len).sum();
        let mut out = Self {
            columns,
            rows: Vec::with_capacity(total),
        };
        for batch in batches {
            let mapping: Vec<Option<usize>> = out
                .columns
                .iter()
                .map(|c| batch.column_index(c))
                .collect();
            for mut row in batch.rows {
                let aligned = mapping
                    .iter()
                    .map(|idx| match idx {
                        Some(i) => std::mem::replace(&mut row[*i], Value::Null),
                        None => Value::Null,
                    })
                    .collect();
                out.rows.push(aligned);
            }
        }
        out
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, BatchError> {
        self.column_index(name)
            .ok_or_else(|| BatchError::UnknownColumn(name.to_string()))
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), BatchError> {
        if row.len() != self.columns.len() {
            return Err(BatchError::RowWidth {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_values<'a>(
        &'a self,
        name: &str,
    ) -> Result<impl Iterator<Item = &'a Value> + 'a, BatchError> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Sets `name` to `value` on every row, adding the column when absent.
    pub fn fill_column(&mut self, name: &str, value: Value) {
        match self.column_index(name) {
            Some(idx) => {
                for row in &mut self.rows {
                    row[idx] = value.clone();
                }
            }
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            }
        }
    }

    /// Tags every row with the load marker of the batch it came from.
    pub fn with_load_marker(mut self, marker: &str) -> Self {
        self.fill_column(LOAD_MARKER_COLUMN, Value::Text(marker.to_string()));
        self
    }

    /// Converts a text column to timestamps in place, returning how many cells changed.
    pub fn coerce_timestamps(&mut self, column: &str) -> Result<usize, BatchError> {
        let idx = self.require_column(column)?;
        let mut converted = 0;
        for row in &mut self.rows {
            let cell = &mut row[idx];
            let parsed = match cell {
                Value::Null | Value::Timestamp(_) => continue,
                Value::Text(text) => parse_timestamp(text),
                _ => None,
            };
            match parsed {
                Some(ts) => {
                    *cell = Value::Timestamp(ts);
                    converted += 1;
                }
                None => {
                    return Err(BatchError::InvalidTimestamp {
                        column: column.to_string(),
                        value: cell.to_string(),
                    })
                }
            }
        }
        Ok(converted)
    }
}

/// Merge behaviour requested for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    #[serde(alias = "insert")]
    Append,
    Upsert,
}

/// Which physical store family is addressed; passed explicitly to every store constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    #[serde(rename = "PROD")]
    Production,
    #[serde(rename = "TEST")]
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "PROD",
            Environment::Test => "TEST",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROD" | "PRODUCTION" => Ok(Environment::Production),
            "TEST" => Ok(Environment::Test),
            _ => Err(ConfigError::UnknownEnvironment(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Bronze => "sourcing",
            Layer::Silver => "ingestion",
            Layer::Gold => "modelled",
        }
    }

    /// File name of this layer's relational store, e.g. `ingestion_PROD.db`.
    pub fn store_file_name(&self, environment: Environment) -> String {
        format!("{}_{}.db", self.as_str(), environment)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{namespace}/{dataset}: missing required field `{field}`")]
    MissingField {
        namespace: String,
        dataset: String,
        field: &'static str,
    },
    #[error("{namespace}/{dataset}: {message}")]
    Invalid {
        namespace: String,
        dataset: String,
        message: String,
    },
    #[error("unknown environment `{0}` (expected PROD or TEST)")]
    UnknownEnvironment(String),
}

/// Dataset entry as written in the job config; validated into a [`JobDescriptor`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    pub table_name: Option<String>,
    pub primary_key: Option<String>,
    pub load_type: Option<LoadType>,
    pub date_column: Option<String>,
    pub lookback: Option<bool>,
    pub lookback_days: Option<u32>,
    pub source_date_column: Option<String>,
    pub overwrite_sourced: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Lookback {
    Disabled,
    Days {
        days: u32,
        source_date_column: String,
    },
}

/// Resolved, immutable per-dataset job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    pub namespace: String,
    pub dataset: String,
    pub table_name: String,
    pub primary_key: Option<String>,
    pub load_type: LoadType,
    pub date_column: String,
    pub lookback: Lookback,
    pub overwrite_sourced: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl JobDescriptor {
    pub fn from_spec(namespace: &str, dataset: &str, spec: JobSpec) -> Result<Self, ConfigError> {
        let missing = |field: &'static str| ConfigError::MissingField {
            namespace: namespace.to_string(),
            dataset: dataset.to_string(),
            field,
        };

        let table_name = non_empty(spec.table_name).ok_or_else(|| missing("table_name"))?;
        let load_type = spec.load_type.ok_or_else(|| missing("load_type"))?;
        let date_column = non_empty(spec.date_column).ok_or_else(|| missing("date_column"))?;
        let lookback_enabled = spec.lookback.ok_or_else(|| missing("lookback"))?;
        let overwrite_sourced = spec
            .overwrite_sourced
            .ok_or_else(|| missing("overwrite_sourced"))?;

        let lookback = if lookback_enabled {
            Lookback::Days {
                days: spec.lookback_days.ok_or_else(|| missing("lookback_days"))?,
                source_date_column: non_empty(spec.source_date_column)
                    .ok_or_else(|| missing("source_date_column"))?,
            }
        } else {
            Lookback::Disabled
        };

        Ok(Self {
            namespace: namespace.to_string(),
            dataset: dataset.to_string(),
            table_name,
            primary_key: non_empty(spec.primary_key),
            load_type,
            date_column,
            lookback,
            overwrite_sourced,
        })
    }
}

/// Gold-layer transform entry as written in the model config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelSpec {
    pub table_name: Option<String>,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub namespace: String,
    pub model: String,
    pub table_name: String,
    pub sql: String,
}

impl ModelDescriptor {
    pub fn from_spec(namespace: &str, model: &str, spec: ModelSpec) -> Result<Self, ConfigError> {
        let missing = |field: &'static str| ConfigError::MissingField {
            namespace: namespace.to_string(),
            dataset: model.to_string(),
            field,
        };
        Ok(Self {
            namespace: namespace.to_string(),
            model: model.to_string(),
            table_name: non_empty(spec.table_name).ok_or_else(|| missing("table_name"))?,
            sql: non_empty(spec.sql).ok_or_else(|| missing("sql"))?,
        })
    }
}
