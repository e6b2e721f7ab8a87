// src/sink/memory.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use super::{Row, Sink, SinkError, TableRows, TableSchema, UpsertReport, apply_batch};

#[derive(Debug, Default)]
struct Tables {
    schemas: HashMap<String, TableSchema>,
    rows: HashMap<String, TableRows>,
    /// Number of upcoming upserts that fail with `Unavailable`.
    outages: u32,
}

/// Sink keeping tables in memory. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Tables>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: impl Into<String>, schema: TableSchema) -> Self {
        self.lock().schemas.insert(name.into(), schema);
        self
    }

    /// Make the next `count` upserts fail as if the store were down.
    pub fn fail_next(&self, count: u32) {
        self.lock().outages = count;
    }

    /// Current rows of a table, ordered by natural key.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .rows
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sink for MemorySink {
    fn upsert(
        &self,
        table: &str,
        key_columns: &[String],
        rows: &[Row],
    ) -> Result<UpsertReport, SinkError> {
        let mut tables = self.lock();

        if tables.outages > 0 {
            tables.outages -= 1;
            return Err(SinkError::Unavailable("memory sink outage".into()));
        }

        let schema = tables
            .schemas
            .get(table)
            .cloned()
            .ok_or_else(|| SinkError::UnknownTable(table.to_string()))?;

        let data = tables.rows.entry(table.to_string()).or_default();
        let report = apply_batch(table, &schema, data, key_columns, rows)?;

        info!(
            table,
            inserted = report.inserted,
            updated = report.updated,
            "upserted rows (memory)"
        );
        Ok(report)
    }
}
