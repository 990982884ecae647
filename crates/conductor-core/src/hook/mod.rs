//! Lifecycle hooks: registration, prioritized execution, retries, timeouts,
//! budgets and metrics.

pub mod budget;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod resource;
pub mod retry;

pub use budget::{BudgetDecision, BudgetLedger};
pub use config::{DEFAULT_HOOK_TIMEOUT, HookCondition, HookConfig, HookError, HookHandler, HookOutcome};
pub use engine::HookEngine;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use resource::{ProcSampler, ResourceSampler, ResourceSample};
pub use retry::RetryPolicy;
