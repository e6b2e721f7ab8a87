// src/config/mod.rs

//! Configuration loading and validation for dagflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate limits, durations and graph correctness (`validate.rs`).
//! - Bind tasks to operators and sinks (`build.rs`).

pub mod build;
pub mod loader;
pub mod model;
pub mod validate;

pub use build::{build_registry, build_sink};
pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, DefaultSection, GroupConfig, PipelineSection, RawConfigFile, TaskConfig};
pub use validate::{parse_duration, validate_config};
