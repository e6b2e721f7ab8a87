// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (graph correctness, etc.). Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config = RawConfigFile::from_toml_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks limits, durations, sensor and sink settings, unknown `after`
///   references and cycles.
///
/// A relative `[pipeline].state_dir`, task `workdir` or `external_state_dir`
/// is resolved against the directory of the config file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let raw_config = load_from_path(path)?;
    let mut config = ConfigFile::try_from(raw_config)?;

    let root = config_root_dir(path);
    if config.pipeline.state_dir.is_relative() {
        config.pipeline.state_dir = root.join(&config.pipeline.state_dir);
    }
    for task in config.task.values_mut() {
        if let Some(workdir) = task.workdir.as_mut().filter(|w| w.is_relative()) {
            *workdir = root.join(&*workdir);
        }
        if let Some(dir) = task.external_state_dir.as_mut().filter(|d| d.is_relative()) {
            *dir = root.join(&*dir);
        }
    }
    Ok(config)
}

/// Default config location: `Pipeline.toml` in the current directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Pipeline.toml")
}

/// Directory holding the config file, or `.` for a bare file name.
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
