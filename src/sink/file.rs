// src/sink/file.rs

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::info;

use super::{Row, Sink, SinkError, TableRows, TableSchema, UpsertReport, apply_batch};

/// Sink storing each table as a JSON array in `<root>/<table>.json`.
///
/// Files are replaced atomically (write to a temp file, then rename), so a
/// crash mid-batch leaves the previous contents in place.
#[derive(Debug)]
pub struct JsonFileSink {
    root: PathBuf,
    schemas: HashMap<String, TableSchema>,
    write_lock: Mutex<()>,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            schemas: HashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_table(mut self, name: impl Into<String>, schema: TableSchema) -> Self {
        self.schemas.insert(name.into(), schema);
        self
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.json"))
    }

    /// Current rows of a table, ordered by natural key.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, SinkError> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| SinkError::UnknownTable(table.to_string()))?;
        Ok(self.load(table, schema)?.into_values().collect())
    }

    fn load(&self, table: &str, schema: &TableSchema) -> Result<TableRows, SinkError> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(TableRows::new());
        }

        let text = fs::read_to_string(&path).map_err(|e| unavailable(&path, e))?;
        let stored: Vec<Row> = serde_json::from_str(&text).map_err(|e| SinkError::Corrupt {
            table: table.to_string(),
            reason: e.to_string(),
        })?;

        let mut data = TableRows::new();
        apply_batch(table, schema, &mut data, &schema.key_columns, &stored).map_err(|e| {
            SinkError::Corrupt {
                table: table.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(data)
    }

    fn store(&self, table: &str, data: &TableRows) -> Result<(), SinkError> {
        fs::create_dir_all(&self.root).map_err(|e| unavailable(&self.root, e))?;

        let rows: Vec<Value> = data.values().cloned().map(Value::Object).collect();
        let text = serde_json::to_string_pretty(&rows).map_err(|e| SinkError::Corrupt {
            table: table.to_string(),
            reason: e.to_string(),
        })?;

        let path = self.table_path(table);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| unavailable(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| unavailable(&path, e))?;
        Ok(())
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> SinkError {
    SinkError::Unavailable(format!("{}: {err}", path.display()))
}

impl Sink for JsonFileSink {
    fn upsert(
        &self,
        table: &str,
        key_columns: &[String],
        rows: &[Row],
    ) -> Result<UpsertReport, SinkError> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| SinkError::UnknownTable(table.to_string()))?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut data = self.load(table, schema)?;
        let report = apply_batch(table, schema, &mut data, key_columns, rows)?;
        self.store(table, &data)?;

        info!(
            table,
            path = %self.table_path(table).display(),
            inserted = report.inserted,
            updated = report.updated,
            "upserted rows (file)"
        );
        Ok(report)
    }
}
