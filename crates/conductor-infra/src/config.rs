//! Orchestrator configuration loading.
//!
//! `conductor.toml` lives in a configuration directory. Relative paths in it
//! are resolved against that directory, and values the engines cannot run
//! with are raised to the nearest usable setting.

use std::path::{Path, PathBuf};

use conductor_types::config::OrchestratorConfig;
use thiserror::Error;

/// File name looked up inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "conductor.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Read and settle `{config_dir}/conductor.toml`.
///
/// Returns `Ok(None)` when the file does not exist.
pub async fn read_config(config_dir: &Path) -> Result<Option<OrchestratorConfig>, ConfigError> {
    let path = config_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    let config = toml::from_str::<OrchestratorConfig>(&content)
        .map_err(|source| ConfigError::Parse { path, source })?;
    Ok(Some(settle(config, config_dir)))
}

/// Load configuration from `{config_dir}/conductor.toml`, never failing.
///
/// A missing file gives the defaults. An unreadable or malformed file is
/// logged and also gives the defaults. Either way the result is settled
/// against `config_dir`.
pub async fn load_config(config_dir: &Path) -> OrchestratorConfig {
    match read_config(config_dir).await {
        Ok(Some(config)) => {
            tracing::debug!(config_dir = %config_dir.display(), "configuration loaded");
            config
        }
        Ok(None) => {
            tracing::debug!(
                config_dir = %config_dir.display(),
                "no {CONFIG_FILE_NAME} found, using defaults"
            );
            settle(OrchestratorConfig::default(), config_dir)
        }
        Err(err) => {
            tracing::warn!(error = %err, "using default configuration");
            settle(OrchestratorConfig::default(), config_dir)
        }
    }
}

/// Resolve paths against `config_dir` and repair unusable values.
fn settle(mut config: OrchestratorConfig, config_dir: &Path) -> OrchestratorConfig {
    if config.workflows_dir.is_relative() {
        config.workflows_dir = config_dir.join(&config.workflows_dir);
    }

    if config.event_bus_capacity == 0 {
        tracing::warn!("event_bus_capacity 0 raised to 1");
        config.event_bus_capacity = 1;
    }

    let hooks = &mut config.hooks;
    if hooks.budget_sweep_interval_secs == 0 {
        tracing::warn!("hooks.budget_sweep_interval_secs 0 raised to 1");
        hooks.budget_sweep_interval_secs = 1;
    }
    if hooks.max_backoff_ms < hooks.base_backoff_ms {
        tracing::warn!(
            base_backoff_ms = hooks.base_backoff_ms,
            max_backoff_ms = hooks.max_backoff_ms,
            "hooks.max_backoff_ms below base_backoff_ms, using base as cap"
        );
        hooks.max_backoff_ms = hooks.base_backoff_ms;
    }

    config
}
