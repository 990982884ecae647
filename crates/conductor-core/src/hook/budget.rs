//! Per-hook execution budgets.
//!
//! `BudgetLedger` tracks how much handler time each hook name has used in
//! its current window. A window resets lazily when a check finds it expired,
//! or when the periodic sweep runs, and never before it expired.

use std::time::Duration;

use conductor_types::hook::{BudgetSnapshot, HookBudget};
use dashmap::DashMap;
use tokio::time::Instant;

/// Usage of one hook name within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetTracker {
    pub used: Duration,
    pub window_start: Instant,
}

impl BudgetTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            used: Duration::ZERO,
            window_start: now,
        }
    }

    pub fn is_expired(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    fn reset(&mut self, now: Instant) {
        self.used = Duration::ZERO;
        self.window_start = now;
    }
}

/// Result of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Allowed,
    ConcurrencyExceeded { running: usize, max: usize },
    TimeExceeded { used: Duration, max: Duration },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allowed)
    }

    /// Human-readable reason for a rejection.
    pub fn reason(&self) -> Option<String> {
        match self {
            BudgetDecision::Allowed => None,
            BudgetDecision::ConcurrencyExceeded { running, max } => Some(format!(
                "{running} running executions reached the limit of {max}"
            )),
            BudgetDecision::TimeExceeded { used, max } => Some(format!(
                "{}ms of execution time used of {}ms in the current window",
                used.as_millis(),
                max.as_millis()
            )),
        }
    }
}

/// Budget trackers keyed by hook name.
#[derive(Debug, Default)]
pub struct BudgetLedger {
    trackers: DashMap<String, BudgetTracker>,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `hook` may start another execution.
    ///
    /// `running` is the concurrency count the caller measured for the
    /// configured scope.
    pub fn check(&self, hook: &str, budget: &HookBudget, running: usize, now: Instant) -> BudgetDecision {
        if running >= budget.max_concurrent_executions {
            return BudgetDecision::ConcurrencyExceeded {
                running,
                max: budget.max_concurrent_executions,
            };
        }

        let mut tracker = self
            .trackers
            .entry(hook.to_string())
            .or_insert_with(|| BudgetTracker::new(now));
        if tracker.is_expired(budget.window(), now) {
            tracing::debug!(hook, "budget window expired, resetting");
            tracker.reset(now);
        }

        let max = budget.max_execution_time();
        if tracker.used >= max {
            return BudgetDecision::TimeExceeded {
                used: tracker.used,
                max,
            };
        }

        BudgetDecision::Allowed
    }

    /// Add handler time to the hook's current window.
    pub fn record_usage(&self, hook: &str, elapsed: Duration, now: Instant) {
        let mut tracker = self
            .trackers
            .entry(hook.to_string())
            .or_insert_with(|| BudgetTracker::new(now));
        tracker.used = tracker.used.saturating_add(elapsed);
    }

    /// Usage in the current window (zero for unknown hooks).
    pub fn usage(&self, hook: &str) -> Duration {
        self.trackers
            .get(hook)
            .map(|t| t.used)
            .unwrap_or(Duration::ZERO)
    }

    /// Reset every tracker whose window has expired. Returns the reset count.
    pub fn reset_expired(&self, window_of: impl Fn(&str) -> Duration, now: Instant) -> usize {
        let mut reset = 0;
        for mut entry in self.trackers.iter_mut() {
            let window = window_of(entry.key());
            if entry.is_expired(window, now) {
                entry.reset(now);
                reset += 1;
            }
        }
        reset
    }

    /// Drop the tracker of a hook that is no longer registered.
    pub fn remove(&self, hook: &str) {
        self.trackers.remove(hook);
    }

    /// Snapshot handed to handlers through `HookContext::budget`.
    pub fn snapshot(&self, hook: &str, budget: &HookBudget, running: usize) -> BudgetSnapshot {
        BudgetSnapshot {
            max_execution_time_ms: budget.max_execution_time_ms,
            used_execution_time_ms: u64::try_from(self.usage(hook).as_millis()).unwrap_or(u64::MAX),
            max_concurrent_executions: budget.max_concurrent_executions,
            running_executions: running,
            max_memory_bytes: budget.max_memory_bytes,
            max_cpu_percent: budget.max_cpu_percent,
        }
    }
}
