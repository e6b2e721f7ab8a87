// src/persist.rs

//! Durable run records.
//!
//! A [`RunRecord`] is saved after every scheduler step that changed a run,
//! so an interrupted process can resume where it stopped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dag::{RunStatus, TaskInstance};
use crate::engine::{Params, RunId, TaskName};
use crate::exchange::ExchangeEntry;

/// Directory (relative to the state dir) holding one JSON file per run.
pub const RUNS_DIR: &str = "runs";

/// Persisted snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Name of the pipeline the run belongs to.
    pub graph: String,
    #[serde(default)]
    pub params: Params,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub instances: BTreeMap<TaskName, TaskInstance>,
    #[serde(default)]
    pub exchange: Vec<ExchangeEntry>,
}

impl RunRecord {
    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Abstract storage for run records.
pub trait RunStore: Send {
    fn load(&self, run_id: &str) -> Result<Option<RunRecord>>;
    fn save(&mut self, record: &RunRecord) -> Result<()>;
    /// All records, oldest first.
    fn list(&self) -> Result<Vec<RunRecord>>;

    /// Records of runs that did not finish, oldest first.
    fn list_unfinished(&self) -> Result<Vec<RunRecord>> {
        Ok(self.list()?.into_iter().filter(|r| !r.is_finished()).collect())
    }
}

/// Stores records as `<state_dir>/runs/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join(RUNS_DIR),
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(run_id)))
    }
}

/// Escape a run id into a file name. ASCII letters, digits and `-` are kept;
/// every other byte becomes `_XX` (hex), so distinct ids never share a file.
fn file_stem(run_id: &str) -> String {
    let mut stem = String::with_capacity(run_id.len());
    for byte in run_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02X}"));
        }
    }
    stem
}

fn read_record(path: &Path) -> Result<RunRecord> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading run record at {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing run record at {:?}", path))
}

impl RunStore for FileRunStore {
    fn load(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    fn save(&mut self, record: &RunRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating run state directory at {:?}", self.dir))?;

        let path = self.path_for(&record.run_id);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(record).context("serializing run record")?;
        fs::write(&tmp, text).with_context(|| format!("writing run record at {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing run record at {:?}", path))?;

        debug!(run_id = %record.run_id, status = %record.status, "stored run record (file)");
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("listing run records in {:?}", self.dir))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = ?path, error = %err, "skipping unreadable run record"),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.run_id.cmp(&b.run_id)));
        Ok(records)
    }
}

/// Keeps records in memory only. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    records: Arc<Mutex<BTreeMap<RunId, RunRecord>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, record: RunRecord) -> Self {
        self.lock().insert(record.run_id.clone(), record);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<RunId, RunRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunStore for MemoryRunStore {
    fn load(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.lock().get(run_id).cloned())
    }

    fn save(&mut self, record: &RunRecord) -> Result<()> {
        self.lock().insert(record.run_id.clone(), record.clone());
        debug!(run_id = %record.run_id, status = %record.status, "stored run record (memory)");
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunRecord>> {
        let mut records: Vec<RunRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.run_id.cmp(&b.run_id)));
        Ok(records)
    }
}
