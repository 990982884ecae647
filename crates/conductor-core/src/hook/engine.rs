//! Hook execution engine.
//!
//! Callers register named handlers against lifecycle events. When an event
//! fires, its handlers run one after another in priority order. For each
//! handler the engine:
//!
//! 1. Checks its conditions (a false or erroring condition skips it).
//! 2. Checks its budget: concurrency per `ConcurrencyScope`, then cumulative
//!    handler time in the current window. A rejection is final, no retry.
//! 3. Runs it with a per-attempt timeout and a per-attempt cancellation
//!    token, retrying with exponential backoff while retries remain.
//! 4. Records a `HookExecution` in the history and reports metrics.
//!
//! A failing handler never prevents the next one from running.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::config::{ConcurrencyScope, HookEngineConfig};
use conductor_types::hook::{
    HookBudget, HookContext, HookEventType, HookExecution, HookMetadata, HookResult, HookStatus,
    HooksStats, ResourceAccountingMode, ResourceUsage,
};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::budget::{BudgetDecision, BudgetLedger};
use super::config::{HookConfig, HookError};
use super::metrics::{
    HOOK_BUDGET_REJECTIONS_TOTAL, HOOK_DURATION_MS, HOOK_ERRORS_TOTAL, HOOK_EXECUTIONS_TOTAL,
    HOOK_TIMEOUTS_TOTAL, MetricsSink, NoopMetrics,
};
use super::resource::{ProcSampler, ResourceSampler, usage_between};
use super::retry::RetryPolicy;
use crate::workflow::action::panic_message;

/// An execution that has passed its budget check and not yet settled.
#[derive(Debug, Clone)]
struct RunningExecution {
    hook_name: String,
    event: HookEventType,
    start_time: DateTime<Utc>,
    retry_count: u32,
}

/// Everything needed to settle one handler execution.
struct Completion {
    execution_id: Uuid,
    start_time: DateTime<Utc>,
    duration: Duration,
    retry_count: u32,
    status: HookStatus,
    outcome: Result<Option<Value>, HookError>,
    resource_usage: Option<ResourceUsage>,
}

/// Event-driven hook dispatcher.
pub struct HookEngine {
    hooks: DashMap<HookEventType, Vec<Arc<HookConfig>>>,
    running: DashMap<Uuid, RunningExecution>,
    history: DashMap<Uuid, HookExecution>,
    budgets: BudgetLedger,
    /// Serializes the budget check with the insert into `running`.
    admission: Mutex<()>,
    metrics: Arc<dyn MetricsSink>,
    sampler: Arc<dyn ResourceSampler>,
    config: HookEngineConfig,
    timeouts: AtomicU64,
}

impl HookEngine {
    pub fn new(config: HookEngineConfig) -> Self {
        Self {
            hooks: DashMap::new(),
            running: DashMap::new(),
            history: DashMap::new(),
            budgets: BudgetLedger::new(),
            admission: Mutex::new(()),
            metrics: Arc::new(NoopMetrics),
            sampler: Arc::new(ProcSampler),
            config,
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &HookEngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register `config` for `event`.
    ///
    /// A hook with the same name on the same event is replaced. Handlers are
    /// kept sorted by priority; equal priorities keep registration order.
    pub fn register_hook(&self, event: HookEventType, config: HookConfig) {
        let mut hooks = self.hooks.entry(event.clone()).or_default();
        if let Some(pos) = hooks.iter().position(|h| h.name == config.name) {
            tracing::warn!(
                hook = config.name.as_str(),
                event = %event,
                "hook already registered, replacing"
            );
            hooks.remove(pos);
        }
        tracing::debug!(
            hook = config.name.as_str(),
            event = %event,
            priority = ?config.priority,
            "hook registered"
        );
        hooks.push(Arc::new(config));
        hooks.sort_by_key(|h| h.priority);
    }

    /// Remove the hook named `name` from `event`.
    pub fn unregister_hook(&self, event: &HookEventType, name: &str) -> bool {
        let removed = match self.hooks.get_mut(event) {
            Some(mut hooks) => {
                let before = hooks.len();
                hooks.retain(|h| h.name != name);
                hooks.len() != before
            }
            None => false,
        };
        self.hooks.remove_if(event, |_, hooks| hooks.is_empty());

        if removed {
            tracing::debug!(hook = name, event = %event, "hook unregistered");
            let still_registered = self
                .hooks
                .iter()
                .any(|entry| entry.value().iter().any(|h| h.name == name));
            if !still_registered {
                self.budgets.remove(name);
            }
        }
        removed
    }

    /// Names of the hooks registered for `event`, in execution order.
    pub fn list_hooks(&self, event: &HookEventType) -> Vec<String> {
        self.hooks
            .get(event)
            .map(|hooks| hooks.iter().map(|h| h.name.clone()).collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Fire `event`, running every registered handler in priority order.
    ///
    /// Returns one result per handler, in the order they ran.
    pub async fn execute_hooks(
        &self,
        event: HookEventType,
        payload: HashMap<String, Value>,
        metadata: HookMetadata,
    ) -> Vec<HookResult> {
        let hooks: Vec<Arc<HookConfig>> = self
            .hooks
            .get(&event)
            .map(|hooks| hooks.value().clone())
            .unwrap_or_default();
        if hooks.is_empty() {
            tracing::debug!(event = %event, "no hooks registered");
            return Vec::new();
        }

        let mut ctx = HookContext {
            event,
            payload,
            timestamp: Utc::now(),
            execution_id: Uuid::now_v7(),
            user_id: metadata.user_id,
            project_id: metadata.project_id,
            trace_id: metadata
                .trace_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            budget: Default::default(),
            retry_count: 0,
        };

        let span = tracing::info_span!(
            "execute_hooks",
            event = %ctx.event,
            trace_id = ctx.trace_id.as_str(),
            hooks = hooks.len()
        );

        let mut results = Vec::with_capacity(hooks.len());
        async {
            for hook in &hooks {
                results.push(self.execute_hook(hook, &mut ctx).await);
            }
        }
        .instrument(span)
        .await;
        results
    }

    async fn execute_hook(&self, hook: &HookConfig, ctx: &mut HookContext) -> HookResult {
        let execution_id = Uuid::now_v7();
        let start_time = Utc::now();
        let started = Instant::now();
        let event = ctx.event.clone();
        ctx.retry_count = 0;

        if let Some(condition) = self.first_unmet_condition(hook, ctx).await {
            tracing::debug!(
                hook = hook.name.as_str(),
                condition = condition.as_str(),
                "hook skipped"
            );
            return self.complete(
                hook,
                &event,
                Completion {
                    execution_id,
                    start_time,
                    duration: started.elapsed(),
                    retry_count: 0,
                    status: HookStatus::Skipped,
                    outcome: Err(HookError::ConditionFailed {
                        hook: hook.name.clone(),
                        condition,
                    }),
                    resource_usage: None,
                },
            );
        }

        let (running, decision) = self.admit(hook, &event, execution_id, start_time);
        if let Some(reason) = decision.reason() {
            tracing::warn!(hook = hook.name.as_str(), reason = reason.as_str(), "hook budget exceeded");
            self.metrics.record(
                HOOK_BUDGET_REJECTIONS_TOTAL,
                &[("hook", hook.name.as_str()), ("event", event.as_str())],
                1.0,
            );
            return self.complete(
                hook,
                &event,
                Completion {
                    execution_id,
                    start_time,
                    duration: started.elapsed(),
                    retry_count: 0,
                    status: HookStatus::Failed,
                    outcome: Err(HookError::BudgetExceeded {
                        hook: hook.name.clone(),
                        reason,
                    }),
                    resource_usage: None,
                },
            );
        }
        ctx.budget = self.budgets.snapshot(&hook.name, &hook.budget, running);

        let before = (hook.accounting == ResourceAccountingMode::MemoryDelta)
            .then(|| self.sampler.sample());

        let policy = RetryPolicy::from_config(hook.retries, &self.config);
        let mut handler_time = Duration::ZERO;
        let mut attempt = 0u32;
        let outcome = loop {
            let attempt_started = Instant::now();
            let result = self.attempt(hook, ctx.clone()).await;
            handler_time += attempt_started.elapsed();

            let err = match result {
                Ok(data) => break Ok(data),
                Err(err) => err,
            };
            if matches!(err, HookError::Timeout { .. }) {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.record(
                    HOOK_TIMEOUTS_TOTAL,
                    &[("hook", hook.name.as_str()), ("event", event.as_str())],
                    1.0,
                );
            }
            if !policy.should_retry(attempt) {
                break Err(err);
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                hook = hook.name.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "hook attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            ctx.retry_count += 1;
            if let Some(mut entry) = self.running.get_mut(&execution_id) {
                entry.retry_count = attempt;
            }
        };

        let duration = started.elapsed();
        self.running.remove(&execution_id);
        self.budgets
            .record_usage(&hook.name, handler_time, Instant::now());

        let resource_usage = before.map(|b| usage_between(b, self.sampler.sample(), duration));
        if let Some(usage) = &resource_usage {
            self.warn_on_advisory_limits(hook, usage);
        }

        let status = match &outcome {
            Ok(_) => HookStatus::Success,
            Err(HookError::Timeout { .. }) => HookStatus::Timeout,
            Err(_) => HookStatus::Failed,
        };
        match &outcome {
            Ok(_) => tracing::debug!(hook = hook.name.as_str(), attempts = attempt + 1, "hook succeeded"),
            Err(err) => tracing::warn!(
                hook = hook.name.as_str(),
                attempts = attempt + 1,
                error = %err,
                "hook failed"
            ),
        }

        self.complete(
            hook,
            &event,
            Completion {
                execution_id,
                start_time,
                duration,
                retry_count: attempt,
                status,
                outcome,
                resource_usage,
            },
        )
    }

    /// One handler invocation raced against the hook's timeout.
    async fn attempt(&self, hook: &HookConfig, ctx: HookContext) -> Result<Option<Value>, HookError> {
        let token = CancellationToken::new();
        let handler = Arc::clone(&hook.handler);
        let handler_token = token.clone();
        let call = AssertUnwindSafe(async move { handler(ctx, handler_token).await }).catch_unwind();

        match tokio::time::timeout(hook.timeout, call).await {
            Err(_) => {
                token.cancel();
                Err(HookError::Timeout {
                    hook: hook.name.clone(),
                    timeout_ms: hook.timeout.as_millis() as u64,
                })
            }
            Ok(Err(payload)) => Err(HookError::Panicked(panic_message(payload))),
            Ok(Ok(Err(error))) => Err(HookError::Handler(error)),
            Ok(Ok(Ok(data))) => Ok(data),
        }
    }

    /// Name of the first condition that is false, errors or panics.
    async fn first_unmet_condition(&self, hook: &HookConfig, ctx: &HookContext) -> Option<String> {
        for condition in &hook.conditions {
            let predicate = Arc::clone(&condition.predicate);
            let condition_ctx = ctx.clone();
            let outcome = AssertUnwindSafe(async move { predicate(condition_ctx).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Some(condition.name.clone()),
                Ok(Err(error)) => {
                    tracing::warn!(
                        hook = hook.name.as_str(),
                        condition = condition.name.as_str(),
                        error = error.as_str(),
                        "hook condition errored"
                    );
                    return Some(condition.name.clone());
                }
                Err(payload) => {
                    tracing::warn!(
                        hook = hook.name.as_str(),
                        condition = condition.name.as_str(),
                        panic = panic_message(payload).as_str(),
                        "hook condition panicked"
                    );
                    return Some(condition.name.clone());
                }
            }
        }
        None
    }

    /// Check the budget and, when allowed, register the execution as running.
    ///
    /// Both happen under `admission`, so concurrent firings cannot all pass a
    /// concurrency limit they would exceed together. Returns the running count
    /// seen before this execution.
    fn admit(
        &self,
        hook: &HookConfig,
        event: &HookEventType,
        execution_id: Uuid,
        start_time: DateTime<Utc>,
    ) -> (usize, BudgetDecision) {
        let _guard = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        let running = self.running_count(&hook.name);
        let decision = self
            .budgets
            .check(&hook.name, &hook.budget, running, Instant::now());
        if decision.is_allowed() {
            self.running.insert(
                execution_id,
                RunningExecution {
                    hook_name: hook.name.clone(),
                    event: event.clone(),
                    start_time,
                    retry_count: 0,
                },
            );
        }
        (running, decision)
    }

    fn running_count(&self, hook_name: &str) -> usize {
        match self.config.concurrency_scope {
            ConcurrencyScope::PerHook => self
                .running
                .iter()
                .filter(|entry| entry.hook_name == hook_name)
                .count(),
            ConcurrencyScope::Global => self.running.len(),
        }
    }

    fn warn_on_advisory_limits(&self, hook: &HookConfig, usage: &ResourceUsage) {
        if let Some(max) = hook.budget.max_memory_bytes {
            if usage.memory_bytes > 0 && usage.memory_bytes as u64 > max {
                tracing::warn!(
                    hook = hook.name.as_str(),
                    memory_bytes = usage.memory_bytes,
                    max_memory_bytes = max,
                    "hook exceeded advisory memory budget"
                );
            }
        }
        if let Some(max) = hook.budget.max_cpu_percent {
            if usage.cpu_percent > max {
                tracing::warn!(
                    hook = hook.name.as_str(),
                    cpu_percent = usage.cpu_percent,
                    max_cpu_percent = max,
                    "hook exceeded advisory CPU budget"
                );
            }
        }
    }

    /// Build the result, store the history record and report metrics.
    fn complete(&self, hook: &HookConfig, event: &HookEventType, c: Completion) -> HookResult {
        let duration_ms = c.duration.as_millis() as u64;
        let (data, error) = match c.outcome {
            Ok(data) => (data, None),
            Err(err) => (None, Some(err.to_string())),
        };
        let result = HookResult {
            hook_name: hook.name.clone(),
            execution_id: c.execution_id,
            status: c.status,
            data,
            error,
            duration_ms,
            resource_usage: c.resource_usage,
        };

        self.history.insert(
            c.execution_id,
            HookExecution {
                id: c.execution_id,
                hook_name: hook.name.clone(),
                event: event.clone(),
                status: c.status,
                start_time: c.start_time,
                end_time: Some(Utc::now()),
                duration_ms,
                retry_count: c.retry_count,
                result: Some(result.clone()),
                resource_usage: c.resource_usage,
            },
        );

        let labels = [
            ("hook", hook.name.as_str()),
            ("event", event.as_str()),
            ("status", c.status.as_str()),
        ];
        self.metrics.record(HOOK_EXECUTIONS_TOTAL, &labels, 1.0);
        if matches!(c.status, HookStatus::Failed | HookStatus::Timeout) {
            self.metrics.record(HOOK_ERRORS_TOTAL, &labels, 1.0);
        }
        self.metrics
            .record(HOOK_DURATION_MS, &labels, duration_ms as f64);

        result
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Look up an execution by the id in its `HookResult`.
    ///
    /// Executions still in flight are reported with `HookStatus::Running`.
    pub fn get_execution_status(&self, execution_id: Uuid) -> Option<HookExecution> {
        if let Some(running) = self.running.get(&execution_id) {
            let elapsed = Utc::now() - running.start_time;
            return Some(HookExecution {
                id: execution_id,
                hook_name: running.hook_name.clone(),
                event: running.event.clone(),
                status: HookStatus::Running,
                start_time: running.start_time,
                end_time: None,
                duration_ms: elapsed.num_milliseconds().max(0) as u64,
                retry_count: running.retry_count,
                result: None,
                resource_usage: None,
            });
        }
        self.history.get(&execution_id).map(|e| e.value().clone())
    }

    /// Aggregate statistics over registrations and recorded history.
    pub fn get_hooks_stats(&self) -> HooksStats {
        let total_hooks = self.hooks.iter().map(|entry| entry.value().len()).sum();
        let total_executions = self.history.len();
        let (successes, total_duration) = self.history.iter().fold((0usize, 0u64), |acc, e| {
            let success = usize::from(e.status == HookStatus::Success);
            (acc.0 + success, acc.1 + e.duration_ms)
        });
        let (success_rate, average_duration_ms) = if total_executions == 0 {
            (0.0, 0.0)
        } else {
            (
                successes as f64 / total_executions as f64,
                total_duration as f64 / total_executions as f64,
            )
        };

        HooksStats {
            total_hooks,
            total_executions,
            running_executions: self.running.len(),
            success_rate,
            average_duration_ms,
        }
    }

    /// Number of handler attempts that timed out since the engine started.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Handler time used by `hook_name` in its current budget window.
    pub fn budget_usage(&self, hook_name: &str) -> Duration {
        self.budgets.usage(hook_name)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Trim the history to the most recent `history_limit` records by start
    /// time. Returns how many records were dropped.
    pub fn cleanup_history(&self) -> usize {
        let limit = self.config.history_limit;
        if self.history.len() <= limit {
            return 0;
        }

        let mut records: Vec<(DateTime<Utc>, Uuid)> = self
            .history
            .iter()
            .map(|e| (e.start_time, e.id))
            .collect();
        records.sort_unstable_by(|a, b| b.cmp(a));

        let stale = records.split_off(limit);
        for (_, id) in &stale {
            self.history.remove(id);
        }
        tracing::debug!(removed = stale.len(), kept = limit, "hook history trimmed");
        stale.len()
    }

    /// Reset budget windows that have expired. Returns how many were reset.
    pub fn reset_expired_budgets(&self) -> usize {
        let windows: HashMap<String, Duration> = self
            .hooks
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|h| (h.name.clone(), h.budget.window()))
                    .collect::<Vec<_>>()
            })
            .collect();
        let default_window = HookBudget::default().window();

        self.budgets.reset_expired(
            |name| windows.get(name).copied().unwrap_or(default_window),
            Instant::now(),
        )
    }

    /// Run `reset_expired_budgets` every `budget_sweep_interval_secs` until
    /// `shutdown` is cancelled or the engine is dropped.
    pub fn spawn_budget_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.budget_sweep_interval().max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        let reset = engine.reset_expired_budgets();
                        if reset > 0 {
                            tracing::debug!(reset, "budget windows reset");
                        }
                    }
                }
            }
            tracing::debug!("budget sweeper stopped");
        })
    }
}

impl std::fmt::Debug for HookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEngine")
            .field("events", &self.hooks.len())
            .field("running", &self.running.len())
            .field("history", &self.history.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use conductor_types::hook::HookPriority;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::hook::config::HookCondition;
    use crate::hook::metrics::InMemoryMetrics;
    use crate::hook::resource::ResourceSample;

    fn engine() -> HookEngine {
        HookEngine::new(HookEngineConfig::default())
    }

    fn event() -> HookEventType {
        HookEventType::OnStepComplete
    }

    fn ok_hook(name: &str) -> HookConfig {
        HookConfig::new(name, |_, _| async { Ok(Some(json!("ok"))) })
    }

    fn counting_hook(name: &str, counter: Arc<AtomicU32>) -> HookConfig {
        HookConfig::new(name, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
    }

    async fn fire(engine: &HookEngine, event: HookEventType) -> Vec<HookResult> {
        engine
            .execute_hooks(event, HashMap::new(), HookMetadata::default())
            .await
    }

    fn names(results: &[HookResult]) -> Vec<&str> {
        results.iter().map(|r| r.hook_name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_handlers_run_in_priority_order() {
        let engine = engine();
        engine.register_hook(event(), ok_hook("cleanup").with_priority(HookPriority::Low));
        engine.register_hook(event(), ok_hook("guard").with_priority(HookPriority::Critical));
        engine.register_hook(event(), ok_hook("audit"));

        let results = fire(&engine, event()).await;
        assert_eq!(names(&results), vec!["guard", "audit", "cleanup"]);
        assert_eq!(engine.list_hooks(&event()), vec!["guard", "audit", "cleanup"]);
        assert!(results.iter().all(|r| r.status == HookStatus::Success));
    }

    #[tokio::test]
    async fn test_equal_priorities_keep_registration_order() {
        let engine = engine();
        engine.register_hook(event(), ok_hook("first").with_priority(HookPriority::High));
        engine.register_hook(event(), ok_hook("second").with_priority(HookPriority::High));

        let results = fire(&engine, event()).await;
        assert_eq!(names(&results), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_reregistering_replaces_handler() {
        let engine = engine();
        let old = Arc::new(AtomicU32::new(0));
        let new = Arc::new(AtomicU32::new(0));
        engine.register_hook(event(), counting_hook("audit", Arc::clone(&old)));
        engine.register_hook(event(), counting_hook("audit", Arc::clone(&new)));

        let results = fire(&engine, event()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
        assert_eq!(engine.list_hooks(&event()), vec!["audit"]);
    }

    #[tokio::test]
    async fn test_unregister_hook() {
        let engine = engine();
        engine.register_hook(event(), ok_hook("audit"));

        assert!(engine.unregister_hook(&event(), "audit"));
        assert!(!engine.unregister_hook(&event(), "audit"));
        assert!(fire(&engine, event()).await.is_empty());
        assert_eq!(engine.get_hooks_stats().total_hooks, 0);
    }

    #[tokio::test]
    async fn test_hooks_are_scoped_to_their_event() {
        let engine = engine();
        engine.register_hook(HookEventType::OnWorkflowStart, ok_hook("start"));
        engine.register_hook(HookEventType::Custom("deploy".to_string()), ok_hook("deploy"));

        let results = fire(&engine, HookEventType::Custom("deploy".to_string())).await;
        assert_eq!(names(&results), vec!["deploy"]);
        assert!(fire(&engine, HookEventType::OnWorkflowError).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_marks_failed() {
        let engine = engine();
        let attempts = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&attempts);
        engine.register_hook(
            event(),
            HookConfig::new("flaky", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .with_retries(2),
        );

        let started = Instant::now();
        let results = fire(&engine, event()).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(results[0].status, HookStatus::Failed);
        assert_eq!(results[0].error.as_deref(), Some("nope"));
        // Backoff of 1s then 2s between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(3000));

        let record = engine.get_execution_status(results[0].execution_id).unwrap();
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.status, HookStatus::Failed);
        assert_eq!(engine.timeout_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let engine = engine();
        let attempts = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&attempts);
        engine.register_hook(
            event(),
            HookConfig::new("eventually", move |_, _| {
                let attempt = counted.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err("first try fails".to_string())
                    } else {
                        Ok(Some(json!({"attempt": attempt})))
                    }
                }
            })
            .with_retries(3),
        );

        let results = fire(&engine, event()).await;
        assert_eq!(results[0].status, HookStatus::Success);
        assert_eq!(results[0].data, Some(json!({"attempt": 1})));
        assert!(results[0].error.is_none());

        let record = engine.get_execution_status(results[0].execution_id).unwrap();
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_retries() {
        let engine = engine();
        engine.register_hook(
            event(),
            HookConfig::new("slow", |_, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(None)
            })
            .with_timeout(Duration::from_millis(50)),
        );

        let results = fire(&engine, event()).await;
        assert_eq!(results[0].status, HookStatus::Timeout);
        let msg = results[0].error.as_deref().unwrap();
        assert!(msg.contains("timed out after 50ms"), "got: {msg}");
        assert_eq!(engine.timeout_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let engine = engine();
        let attempts = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&attempts);
        engine.register_hook(
            event(),
            HookConfig::new("slow-then-fast", move |_, _| {
                let attempt = counted.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(Some(json!("done")))
                }
            })
            .with_timeout(Duration::from_millis(100))
            .with_retries(1),
        );

        let results = fire(&engine, event()).await;
        assert_eq!(results[0].status, HookStatus::Success);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(engine.timeout_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_attempt_token() {
        let engine = engine();
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        engine.register_hook(
            event(),
            HookConfig::new("stuck", move |_, token| {
                *slot.lock().unwrap() = Some(token);
                async {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
            })
            .with_timeout(Duration::from_millis(10)),
        );

        fire(&engine, event()).await;
        let token = seen.lock().unwrap().clone().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_condition_skips_hook() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        engine.register_hook(
            event(),
            counting_hook("prod-only", Arc::clone(&calls))
                .with_priority(HookPriority::High)
                .with_condition(HookCondition::new("is-production", |ctx: HookContext| async move {
                    Ok(ctx.payload.get("environment") == Some(&json!("production")))
                })),
        );
        engine.register_hook(
            event(),
            counting_hook("broken-condition", Arc::clone(&calls)).with_condition(
                HookCondition::new("errors", |_| async { Err("lookup failed".to_string()) }),
            ),
        );
        engine.register_hook(event(), ok_hook("always").with_priority(HookPriority::Low));

        let payload = HashMap::from([("environment".to_string(), json!("staging"))]);
        let results = engine
            .execute_hooks(event(), payload, HookMetadata::default())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(results[0].status, HookStatus::Skipped);
        assert!(results[0].error.as_deref().unwrap().contains("is-production"));
        assert_eq!(results[1].status, HookStatus::Skipped);
        assert_eq!(results[2].status, HookStatus::Success);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_hooks() {
        let engine = engine();
        engine.register_hook(
            event(),
            HookConfig::new("fails", |_, _| async { Err("bad input".to_string()) })
                .with_priority(HookPriority::Critical),
        );
        engine.register_hook(
            event(),
            HookConfig::new("panics", |_, _| async {
                let outcome: Result<Option<Value>, String> = Err(String::new());
                if outcome.is_err() {
                    panic!("handler blew up");
                }
                outcome
            })
            .with_priority(HookPriority::High),
        );
        engine.register_hook(event(), ok_hook("survivor"));

        let results = fire(&engine, event()).await;
        assert_eq!(results[0].status, HookStatus::Failed);
        assert_eq!(results[1].status, HookStatus::Failed);
        assert!(results[1].error.as_deref().unwrap().contains("handler blew up"));
        assert_eq!(results[2].status, HookStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_rejects_until_window_expires() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        engine.register_hook(
            event(),
            HookConfig::new("heavy", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(None)
                }
            })
            .with_budget(HookBudget {
                max_execution_time_ms: 100,
                window_ms: 1000,
                ..HookBudget::default()
            }),
        );

        assert_eq!(fire(&engine, event()).await[0].status, HookStatus::Success);
        assert!(engine.budget_usage("heavy") >= Duration::from_millis(150));

        let rejected = fire(&engine, event()).await;
        assert_eq!(rejected[0].status, HookStatus::Failed);
        let msg = rejected[0].error.as_deref().unwrap();
        assert!(msg.contains("budget exceeded"), "got: {msg}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Lazy reset once the window has passed.
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(fire(&engine, event()).await[0].status, HookStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Sweep reset.
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(engine.reset_expired_budgets(), 1);
        assert_eq!(engine.budget_usage("heavy"), Duration::ZERO);
    }

    /// Runs `limited` (max 1 concurrent) while `blocker` is in flight.
    async fn status_while_other_hook_runs(scope: ConcurrencyScope) -> HookStatus {
        let engine = Arc::new(HookEngine::new(HookEngineConfig {
            concurrency_scope: scope,
            ..HookEngineConfig::default()
        }));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        engine.register_hook(
            HookEventType::Custom("long".to_string()),
            HookConfig::new("blocker", move |_, _| {
                let (s, r) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    s.notify_one();
                    r.notified().await;
                    Ok(None)
                }
            }),
        );
        engine.register_hook(
            HookEventType::Custom("sampled".to_string()),
            ok_hook("limited").with_budget(HookBudget {
                max_concurrent_executions: 1,
                ..HookBudget::default()
            }),
        );

        let background = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { fire(&engine, HookEventType::Custom("long".to_string())).await })
        };
        started.notified().await;
        assert_eq!(engine.get_hooks_stats().running_executions, 1);

        let results = fire(&engine, HookEventType::Custom("sampled".to_string())).await;
        release.notify_one();
        background.await.unwrap();
        results[0].status
    }

    #[tokio::test]
    async fn test_per_hook_concurrency_ignores_other_hooks() {
        assert_eq!(
            status_while_other_hook_runs(ConcurrencyScope::PerHook).await,
            HookStatus::Success
        );
    }

    #[tokio::test]
    async fn test_global_concurrency_counts_all_hooks() {
        assert_eq!(
            status_while_other_hook_runs(ConcurrencyScope::Global).await,
            HookStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_per_hook_concurrency_limit_applies_to_same_hook() {
        let engine = Arc::new(engine());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let (s, r, n) = (
            Arc::clone(&started),
            Arc::clone(&release),
            Arc::clone(&invocations),
        );
        engine.register_hook(
            event(),
            HookConfig::new("exclusive", move |_, _| {
                n.fetch_add(1, Ordering::SeqCst);
                let (s, r) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    s.notify_one();
                    r.notified().await;
                    Ok(None)
                }
            })
            .with_budget(HookBudget {
                max_concurrent_executions: 1,
                ..HookBudget::default()
            }),
        );

        let background = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { fire(&engine, event()).await })
        };
        started.notified().await;

        let results = fire(&engine, event()).await;
        assert_eq!(results[0].status, HookStatus::Failed);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        release.notify_one();
        let first = background.await.unwrap();
        assert_eq!(first[0].status, HookStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_limit_holds_across_threads() {
        let engine = Arc::new(engine());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (current, max) = (Arc::clone(&in_flight), Arc::clone(&peak));
        engine.register_hook(
            event(),
            HookConfig::new("exclusive", move |_, _| {
                let (current, max) = (Arc::clone(&current), Arc::clone(&max));
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .with_budget(HookBudget {
                max_concurrent_executions: 1,
                ..HookBudget::default()
            }),
        );

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let firings: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    fire(&engine, event()).await
                })
            })
            .collect();

        let mut succeeded = 0;
        for firing in firings {
            let results = firing.await.unwrap();
            match results[0].status {
                HookStatus::Success => succeeded += 1,
                HookStatus::Failed => {
                    let error = results[0].error.as_deref().unwrap();
                    assert!(error.contains("budget exceeded"), "got: {error}");
                }
                other => panic!("unexpected status: {other:?}"),
            }
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(succeeded >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_is_shared_within_one_firing() {
        let engine = engine();
        let seen: Arc<Mutex<Vec<(Uuid, String, u32)>>> = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let attempts = Arc::new(AtomicU32::new(0));
        engine.register_hook(
            event(),
            HookConfig::new("retrying", move |ctx: HookContext, _| {
                log.lock()
                    .unwrap()
                    .push((ctx.execution_id, ctx.trace_id.clone(), ctx.retry_count));
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err("again".to_string())
                    } else {
                        Ok(None)
                    }
                }
            })
            .with_priority(HookPriority::High)
            .with_retries(1),
        );
        let log = Arc::clone(&seen);
        engine.register_hook(
            event(),
            HookConfig::new("observer", move |ctx: HookContext, _| {
                log.lock()
                    .unwrap()
                    .push((ctx.execution_id, ctx.trace_id.clone(), ctx.retry_count));
                async { Ok(None) }
            }),
        );

        let metadata = HookMetadata {
            trace_id: Some("trace-1".to_string()),
            ..HookMetadata::default()
        };
        engine.execute_hooks(event(), HashMap::new(), metadata).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(id, trace, _)| *id == seen[0].0 && trace == "trace-1"));
        // The count restarts for each handler.
        let retries: Vec<u32> = seen.iter().map(|(_, _, r)| *r).collect();
        assert_eq!(retries, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_trace_id_generated_when_absent() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(String::new()));
        let slot = Arc::clone(&seen);
        engine.register_hook(
            event(),
            HookConfig::new("tracer", move |ctx: HookContext, _| {
                *slot.lock().unwrap() = ctx.trace_id.clone();
                async { Ok(None) }
            }),
        );

        fire(&engine, event()).await;
        assert!(!seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_and_stats() {
        let engine = engine();
        engine.register_hook(event(), ok_hook("a"));
        engine.register_hook(event(), ok_hook("b"));
        engine.register_hook(
            event(),
            HookConfig::new("c", |_, _| async { Err("broken".to_string()) }),
        );

        let results = fire(&engine, event()).await;
        for result in &results {
            let record = engine.get_execution_status(result.execution_id).unwrap();
            assert_eq!(record.hook_name, result.hook_name);
            assert_eq!(record.status, result.status);
            assert_eq!(record.event, event());
            assert!(record.end_time.is_some());
            assert_eq!(record.result.as_ref(), Some(result));
        }
        assert!(engine.get_execution_status(Uuid::now_v7()).is_none());

        let stats = engine.get_hooks_stats();
        assert_eq!(stats.total_hooks, 3);
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.running_executions, 0);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(stats.average_duration_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_stats_on_empty_engine() {
        let stats = engine().get_hooks_stats();
        assert_eq!(stats, HooksStats::default());
    }

    #[tokio::test]
    async fn test_cleanup_history_keeps_most_recent() {
        let engine = HookEngine::new(HookEngineConfig {
            history_limit: 2,
            ..HookEngineConfig::default()
        });
        engine.register_hook(event(), ok_hook("audit"));

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(fire(&engine, event()).await[0].execution_id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(engine.cleanup_history(), 1);
        assert!(engine.get_execution_status(ids[0]).is_none());
        assert!(engine.get_execution_status(ids[1]).is_some());
        assert!(engine.get_execution_status(ids[2]).is_some());
        assert_eq!(engine.cleanup_history(), 0);
    }

    struct SteppingSampler {
        samples: AtomicU64,
    }

    impl ResourceSampler for SteppingSampler {
        fn sample(&self) -> ResourceSample {
            let n = self.samples.fetch_add(1, Ordering::SeqCst);
            ResourceSample {
                resident_bytes: 10_000 + n * 4096,
                cpu_time: Duration::ZERO,
            }
        }
    }

    #[tokio::test]
    async fn test_memory_delta_accounting() {
        let engine = engine().with_sampler(Arc::new(SteppingSampler {
            samples: AtomicU64::new(0),
        }));
        engine.register_hook(
            event(),
            ok_hook("measured")
                .with_priority(HookPriority::High)
                .with_accounting(ResourceAccountingMode::MemoryDelta)
                .with_budget(HookBudget {
                    max_memory_bytes: Some(1024),
                    ..HookBudget::default()
                }),
        );
        engine.register_hook(event(), ok_hook("unmeasured"));

        let results = fire(&engine, event()).await;
        let usage = results[0].resource_usage.unwrap();
        assert_eq!(usage.memory_bytes, 4096);
        assert!(results[1].resource_usage.is_none());

        let record = engine.get_execution_status(results[0].execution_id).unwrap();
        assert_eq!(record.resource_usage, Some(usage));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_are_reported() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let engine = engine().with_metrics(metrics.clone());
        engine.register_hook(event(), ok_hook("good"));
        engine.register_hook(
            event(),
            HookConfig::new("bad", |_, _| async { Err("x".to_string()) }),
        );
        engine.register_hook(
            event(),
            HookConfig::new("slow", |_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(None)
            })
            .with_timeout(Duration::from_millis(10)),
        );

        fire(&engine, event()).await;

        assert_eq!(metrics.count(HOOK_EXECUTIONS_TOTAL), 3);
        assert_eq!(metrics.count(HOOK_ERRORS_TOTAL), 2);
        assert_eq!(metrics.count(HOOK_TIMEOUTS_TOTAL), 1);
        assert_eq!(metrics.count(HOOK_DURATION_MS), 3);
        assert!(metrics
            .series(
                HOOK_EXECUTIONS_TOTAL,
                &[("hook", "good"), ("event", "onStepComplete"), ("status", "success")]
            )
            .is_some());
    }

    #[tokio::test]
    async fn test_gate_passed_end_to_end() {
        let engine = engine();
        engine.register_hook(
            HookEventType::OnWorkflowGatePassed,
            HookConfig::new("validation-hook", |ctx: HookContext, _| async move {
                Ok(Some(json!({"validated": ctx.payload["environment"]})))
            })
            .with_priority(HookPriority::High)
            .with_timeout(Duration::from_millis(10_000))
            .with_retries(2),
        );
        engine.register_hook(
            HookEventType::OnWorkflowGatePassed,
            HookConfig::new("gate-hook", |_, _| async { Ok(Some(json!({"gate": "open"}))) })
                .with_priority(HookPriority::Critical)
                .with_timeout(Duration::from_millis(15_000))
                .with_retries(3),
        );

        let payload = HashMap::from([("environment".to_string(), json!("staging"))]);
        let results = engine
            .execute_hooks(HookEventType::OnWorkflowGatePassed, payload, HookMetadata::default())
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(names(&results), vec!["gate-hook", "validation-hook"]);
        assert!(results.iter().all(|r| r.status == HookStatus::Success));
        assert_eq!(results[1].data, Some(json!({"validated": "staging"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_sweeper_resets_windows() {
        let engine = Arc::new(HookEngine::new(HookEngineConfig {
            budget_sweep_interval_secs: 1,
            ..HookEngineConfig::default()
        }));
        engine.register_hook(
            event(),
            HookConfig::new("timed", |_, _| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(None)
            })
            .with_budget(HookBudget {
                window_ms: 500,
                ..HookBudget::default()
            }),
        );
        fire(&engine, event()).await;
        assert!(engine.budget_usage("timed") > Duration::ZERO);

        let shutdown = CancellationToken::new();
        let sweeper = engine.spawn_budget_sweeper(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(engine.budget_usage("timed"), Duration::ZERO);

        shutdown.cancel();
        sweeper.await.unwrap();
    }
}
