// src/sink/mod.rs

//! Idempotent upsert sinks.
//!
//! A sink keeps rows per table, identified by the table's natural key
//! columns. Upserting a row whose key already exists updates the table's
//! mutable columns; anything else is inserted. Applying the same batch twice
//! leaves the table exactly as applying it once.
//!
//! - [`memory`] keeps tables in process memory.
//! - [`file`] keeps one JSON file per table.
//! - [`task`] adapts a sink into task logic that loads rows published by an
//!   upstream task.

pub mod file;
pub mod memory;
pub mod task;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::exec::TaskError;

pub use file::JsonFileSink;
pub use memory::MemorySink;
pub use task::SinkTask;

/// One record: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Rows of one table keyed by their encoded natural key.
pub(crate) type TableRows = BTreeMap<String, Row>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("row {row} for table '{table}' is missing key column '{column}'")]
    MissingKeyColumn {
        table: String,
        row: usize,
        column: String,
    },

    #[error("key columns {given:?} do not match key {expected:?} of table '{table}'")]
    KeyMismatch {
        table: String,
        expected: Vec<String>,
        given: Vec<String>,
    },

    /// The backing store could not be reached; worth retrying.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("stored data for table '{table}' is unreadable: {reason}")]
    Corrupt { table: String, reason: String },
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

impl From<SinkError> for TaskError {
    fn from(err: SinkError) -> Self {
        if err.is_retryable() {
            TaskError::Retryable(err.to_string())
        } else {
            TaskError::Fatal(err.to_string())
        }
    }
}

/// Declared shape of a table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSchema {
    /// Natural key; at least one column.
    pub key_columns: Vec<String>,
    /// Columns overwritten when a row with an existing key is upserted.
    #[serde(default)]
    pub mutable_columns: Vec<String>,
}

impl TableSchema {
    pub fn new<K, M>(key_columns: K, mutable_columns: M) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Self {
            key_columns: key_columns.into_iter().map(Into::into).collect(),
            mutable_columns: mutable_columns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Idempotent row store.
pub trait Sink: Send + Sync {
    /// Insert-or-update `rows` into `table`, matching on `key_columns`.
    ///
    /// Either the whole batch is applied or none of it.
    fn upsert(
        &self,
        table: &str,
        key_columns: &[String],
        rows: &[Row],
    ) -> Result<UpsertReport, SinkError>;
}

/// Validate a batch against the schema, then apply it to `data`.
///
/// Nothing is written unless every row is valid.
pub(crate) fn apply_batch(
    table: &str,
    schema: &TableSchema,
    data: &mut TableRows,
    key_columns: &[String],
    rows: &[Row],
) -> Result<UpsertReport, SinkError> {
    let mut expected = schema.key_columns.clone();
    let mut given = key_columns.to_vec();
    expected.sort();
    given.sort();
    if expected != given || given.is_empty() {
        return Err(SinkError::KeyMismatch {
            table: table.to_string(),
            expected: schema.key_columns.clone(),
            given: key_columns.to_vec(),
        });
    }

    let mut keyed = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        keyed.push((natural_key(table, &schema.key_columns, idx, row)?, row));
    }

    let mut report = UpsertReport::default();
    for (key, row) in keyed {
        match data.get_mut(&key) {
            Some(existing) => {
                for column in &schema.mutable_columns {
                    if let Some(value) = row.get(column) {
                        existing.insert(column.clone(), value.clone());
                    }
                }
                report.updated += 1;
            }
            None => {
                data.insert(key, row.clone());
                report.inserted += 1;
            }
        }
    }

    Ok(report)
}

/// Encode the key columns of a row, in schema order.
fn natural_key(
    table: &str,
    key_columns: &[String],
    idx: usize,
    row: &Row,
) -> Result<String, SinkError> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        match row.get(column) {
            Some(value) if !value.is_null() => parts.push(value.clone()),
            _ => {
                return Err(SinkError::MissingKeyColumn {
                    table: table.to_string(),
                    row: idx,
                    column: column.clone(),
                });
            }
        }
    }
    Ok(Value::Array(parts).to_string())
}
