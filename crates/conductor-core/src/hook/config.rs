//! Hook registration: handler type, conditions and per-hook settings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conductor_types::hook::{HookBudget, HookContext, HookPriority, ResourceAccountingMode};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default per-attempt timeout.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// What a hook handler produces: optional data or error text.
pub type HookOutcome = Result<Option<Value>, String>;

/// Async hook handler. The token is cancelled when the attempt times out.
pub type HookHandler =
    Arc<dyn Fn(HookContext, CancellationToken) -> BoxFuture<'static, HookOutcome> + Send + Sync>;

/// Async predicate gating a hook. `Err` counts as not met.
pub type ConditionPredicate =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

/// Why a handler did not succeed. Rendered into `HookResult::error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("budget exceeded for hook '{hook}': {reason}")]
    BudgetExceeded { hook: String, reason: String },

    #[error("hook '{hook}' timed out after {timeout_ms}ms")]
    Timeout { hook: String, timeout_ms: u64 },

    #[error("{0}")]
    Handler(String),

    #[error("hook panicked: {0}")]
    Panicked(String),

    #[error("condition '{condition}' not met for hook '{hook}'")]
    ConditionFailed { hook: String, condition: String },
}

/// A named condition that must hold for a hook to run.
#[derive(Clone)]
pub struct HookCondition {
    pub name: String,
    pub(crate) predicate: ConditionPredicate,
}

impl HookCondition {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(move |ctx: HookContext| f(ctx).boxed()),
        }
    }
}

impl std::fmt::Debug for HookCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A hook as registered with the engine.
///
/// Built with `HookConfig::new` and the `with_*` methods:
///
/// ```ignore
/// let hook = HookConfig::new("audit", |ctx, _token| async move { Ok(None) })
///     .with_priority(HookPriority::High)
///     .with_timeout(Duration::from_secs(10))
///     .with_retries(2);
/// ```
#[derive(Clone)]
pub struct HookConfig {
    /// Unique per event type; registering the same name replaces the entry.
    pub name: String,
    pub priority: HookPriority,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Extra attempts after a failure or timeout.
    pub retries: u32,
    pub budget: HookBudget,
    pub accounting: ResourceAccountingMode,
    pub conditions: Vec<HookCondition>,
    pub(crate) handler: HookHandler,
}

impl HookConfig {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(HookContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookOutcome> + Send + 'static,
    {
        Self::from_handler(
            name,
            Arc::new(move |ctx: HookContext, token: CancellationToken| f(ctx, token).boxed()),
        )
    }

    pub fn from_handler(name: impl Into<String>, handler: HookHandler) -> Self {
        Self {
            name: name.into(),
            priority: HookPriority::default(),
            timeout: DEFAULT_HOOK_TIMEOUT,
            retries: 0,
            budget: HookBudget::default(),
            accounting: ResourceAccountingMode::default(),
            conditions: Vec::new(),
            handler,
        }
    }

    pub fn with_priority(mut self, priority: HookPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_budget(mut self, budget: HookBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Measure memory and CPU around each execution.
    pub fn with_accounting(mut self, accounting: ResourceAccountingMode) -> Self {
        self.accounting = accounting;
        self
    }

    pub fn with_condition(mut self, condition: HookCondition) -> Self {
        self.conditions.push(condition);
        self
    }
}

impl std::fmt::Debug for HookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("budget", &self.budget)
            .field("accounting", &self.accounting)
            .field("conditions", &self.conditions)
            .finish_non_exhaustive()
    }
}
