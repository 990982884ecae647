//! Hook domain types: event types, priorities, budgets, results and the
//! audit records kept by the hook engine.
//!
//! The handler itself is an async closure and lives with the engine in
//! `conductor-core`; everything here is plain data and serializable.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Lifecycle event a hook can be registered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookEventType {
    OnWorkflowStart,
    OnWorkflowComplete,
    OnWorkflowError,
    OnStepStart,
    OnStepComplete,
    OnStepError,
    OnWorkflowGatePassed,
    OnWorkflowGateFailed,
    OnDomainComplete,
    /// Any caller-defined event name.
    #[serde(untagged)]
    Custom(String),
}

impl HookEventType {
    pub fn as_str(&self) -> &str {
        match self {
            HookEventType::OnWorkflowStart => "onWorkflowStart",
            HookEventType::OnWorkflowComplete => "onWorkflowComplete",
            HookEventType::OnWorkflowError => "onWorkflowError",
            HookEventType::OnStepStart => "onStepStart",
            HookEventType::OnStepComplete => "onStepComplete",
            HookEventType::OnStepError => "onStepError",
            HookEventType::OnWorkflowGatePassed => "onWorkflowGatePassed",
            HookEventType::OnWorkflowGateFailed => "onWorkflowGateFailed",
            HookEventType::OnDomainComplete => "onDomainComplete",
            HookEventType::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for HookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEventType {
    type Err = std::convert::Infallible;

    /// Known names map to their variant; anything else becomes `Custom`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "onWorkflowStart" => HookEventType::OnWorkflowStart,
            "onWorkflowComplete" => HookEventType::OnWorkflowComplete,
            "onWorkflowError" => HookEventType::OnWorkflowError,
            "onStepStart" => HookEventType::OnStepStart,
            "onStepComplete" => HookEventType::OnStepComplete,
            "onStepError" => HookEventType::OnStepError,
            "onWorkflowGatePassed" => HookEventType::OnWorkflowGatePassed,
            "onWorkflowGateFailed" => HookEventType::OnWorkflowGateFailed,
            "onDomainComplete" => HookEventType::OnDomainComplete,
            other => HookEventType::Custom(other.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Execution priority. Lower numeric value runs first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HookPriority {
    Critical = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Resource ceiling applied to one hook.
///
/// Execution time and concurrency are enforced. Memory and CPU are advisory:
/// they are reported in the budget snapshot and logged when exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookBudget {
    /// Cumulative handler time allowed per window.
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    /// Length of the rolling usage window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
}

fn default_max_execution_time_ms() -> u64 {
    5 * 60 * 1000
}

fn default_window_ms() -> u64 {
    60 * 60 * 1000
}

fn default_max_concurrent_executions() -> usize {
    10
}

impl Default for HookBudget {
    fn default() -> Self {
        Self {
            max_execution_time_ms: default_max_execution_time_ms(),
            window_ms: default_window_ms(),
            max_concurrent_executions: default_max_concurrent_executions(),
            max_memory_bytes: None,
            max_cpu_percent: None,
        }
    }
}

impl HookBudget {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Point-in-time view of a hook's budget, handed to the handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_execution_time_ms: u64,
    pub used_execution_time_ms: u64,
    pub max_concurrent_executions: usize,
    pub running_executions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// Resource accounting
// ---------------------------------------------------------------------------

/// What the engine measures around a handler invocation.
///
/// `MemoryDelta` samples process memory and CPU time before and after the
/// call. It is accounting only; handlers share the engine's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAccountingMode {
    #[default]
    Off,
    MemoryDelta,
}

/// Resources consumed by one handler execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resident memory delta in bytes (may be negative).
    pub memory_bytes: i64,
    /// CPU time as a percentage of wall time.
    pub cpu_percent: f64,
}

// ---------------------------------------------------------------------------
// Context and metadata
// ---------------------------------------------------------------------------

/// Caller-supplied metadata for an `execute_hooks` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Everything a handler sees for one event firing.
///
/// Built once per `execute_hooks` call; the budget snapshot and `retry_count`
/// are updated per handler attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEventType,
    pub payload: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    /// Shared by every handler of this firing.
    pub execution_id: Uuid,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub trace_id: String,
    pub budget: BudgetSnapshot,
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Results and audit records
// ---------------------------------------------------------------------------

/// Status of a hook execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
}

impl HookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HookStatus::Pending => "pending",
            HookStatus::Running => "running",
            HookStatus::Success => "success",
            HookStatus::Failed => "failed",
            HookStatus::Timeout => "timeout",
            HookStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of one handler for one event firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub hook_name: String,
    /// Key for `get_execution_status`.
    pub execution_id: Uuid,
    pub status: HookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

/// Audit record of a handler execution, kept in the engine's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookExecution {
    pub id: Uuid,
    pub hook_name: String,
    pub event: HookEventType,
    pub status: HookStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Index of the final attempt (0 when the first attempt settled it).
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<HookResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksStats {
    pub total_hooks: usize,
    pub total_executions: usize,
    pub running_executions: usize,
    /// Successful share of recorded executions, 0.0 to 1.0.
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
