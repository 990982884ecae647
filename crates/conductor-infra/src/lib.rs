//! Infrastructure layer for Conductor.
//!
//! Implements the ports defined in `conductor-core` against the local
//! filesystem: `FsWorkflowSource` reads workflow YAML files and `load_config`
//! reads `conductor.toml`.

pub mod config;
pub mod workflow;

pub use config::{ConfigError, load_config, read_config};
pub use workflow::FsWorkflowSource;
