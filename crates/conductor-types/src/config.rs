//! Configuration types for Conductor.
//!
//! `OrchestratorConfig` represents the top-level `conductor.toml`. Every field
//! has a serde default, so an empty file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding `<workflow_id>.yaml` definitions.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,

    /// How long terminal runs stay queryable before `prune_finished_runs`
    /// drops them.
    #[serde(default = "default_run_retention_secs")]
    pub run_retention_secs: u64,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// When a dependent domain counts as runnable.
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,

    #[serde(default)]
    pub hooks: HookEngineConfig,
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_run_retention_secs() -> u64 {
    3600
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            run_retention_secs: default_run_retention_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            dependency_policy: DependencyPolicy::default(),
            hooks: HookEngineConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }
}

/// Dependency satisfaction rule for dependent domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Every dependency must have produced a successful result.
    #[default]
    Succeeded,
    /// Every dependency must have run, whether it succeeded or failed.
    Settled,
}

/// What a hook's `max_concurrent_executions` is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// Running executions of the same hook name.
    #[default]
    PerHook,
    /// All running hook executions in the engine.
    Global,
}

/// Hook engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEngineConfig {
    /// Records kept by `cleanup_history`.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Interval of the background budget window sweep.
    #[serde(default = "default_budget_sweep_interval_secs")]
    pub budget_sweep_interval_secs: u64,

    /// Backoff before the second attempt; doubled per attempt.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound of the retry backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default)]
    pub concurrency_scope: ConcurrencyScope,
}

fn default_history_limit() -> usize {
    1000
}

fn default_budget_sweep_interval_secs() -> u64 {
    300
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for HookEngineConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            budget_sweep_interval_secs: default_budget_sweep_interval_secs(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            concurrency_scope: ConcurrencyScope::default(),
        }
    }
}

impl HookEngineConfig {
    pub fn budget_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.budget_sweep_interval_secs)
    }
}
