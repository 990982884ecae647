//! Parallel domain coordinator.
//!
//! Schedules named units of work ("domains") with dependency edges:
//!
//! 1. Duplicate ids and dependency cycles are structural errors that abort
//!    the call before anything runs.
//! 2. Domains without dependencies run concurrently in a `JoinSet`; each one
//!    settles on its own and a panic is captured as that domain's error.
//! 3. Dependent domains run one at a time in topological order, once their
//!    dependencies satisfy the configured `DependencyPolicy`.
//!
//! Per-domain failures never fail the call: every input domain ends up in
//! exactly one of `CoordinationResult::results` or `CoordinationResult::errors`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use conductor_types::config::DependencyPolicy;
use conductor_types::event::OrchestratorEvent;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::action::{TaskHandler, TaskOutcome, panic_message, task_handler};
use super::context::WorkflowContext;
use super::dag::{DependencyNode, dependency_order};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural problems that abort a coordination call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error("cycle detected involving domain '{domain_id}'")]
    CycleDetected { domain_id: String },

    #[error("duplicate domain id: '{0}'")]
    DuplicateDomain(String),
}

/// Why a single domain produced no result. Rendered into the `errors` map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("dependencies not satisfied: {}", .missing.join(", "))]
    DependenciesNotSatisfied { missing: Vec<String> },

    #[error("{0}")]
    Failed(String),

    #[error("domain panicked: {0}")]
    Panicked(String),

    #[error("domain cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// A schedulable unit of work.
pub struct Domain {
    pub id: String,
    pub depends_on: Vec<String>,
    handler: TaskHandler,
}

impl Domain {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<WorkflowContext>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        Self::from_handler(id, task_handler(f))
    }

    pub fn from_handler(id: impl Into<String>, handler: TaskHandler) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            handler,
        }
    }

    /// Add dependencies on other domains of the same coordination call.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

impl DependencyNode for Domain {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CoordinationResult
// ---------------------------------------------------------------------------

/// Outcome of a coordination call, keyed by domain id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinationResult {
    pub results: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
    /// Wall time of each domain whose handler ran.
    pub durations_ms: HashMap<String, u64>,
}

impl CoordinationResult {
    /// Whether every domain succeeded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of domains accounted for.
    pub fn len(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&mut self, domain_id: String, outcome: Result<Value, DomainError>) {
        match outcome {
            Ok(value) => {
                self.results.insert(domain_id, value);
            }
            Err(err) => {
                self.errors.insert(domain_id, err.to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DomainCoordinator
// ---------------------------------------------------------------------------

/// One executing domain. Keyed by a per-execution id so that concurrent
/// calls reusing a domain id keep separate entries.
#[derive(Debug, Clone)]
struct ActiveDomain {
    domain_id: String,
    token: CancellationToken,
}

/// Runs domain batches and tracks the domains currently executing.
#[derive(Debug, Clone)]
pub struct DomainCoordinator {
    event_bus: EventBus,
    policy: DependencyPolicy,
    active: Arc<DashMap<Uuid, ActiveDomain>>,
}

impl DomainCoordinator {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            event_bus,
            policy: DependencyPolicy::default(),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: DependencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> DependencyPolicy {
        self.policy
    }

    /// Run `domains` against `ctx`.
    pub async fn coordinate_domains(
        &self,
        domains: Vec<Domain>,
        ctx: Arc<WorkflowContext>,
    ) -> Result<CoordinationResult, CoordinationError> {
        self.coordinate_with_token(domains, ctx, &CancellationToken::new())
            .await
    }

    /// Run `domains` with per-domain tokens derived from `parent`.
    ///
    /// Cancelling `parent` cancels every domain of this call.
    pub async fn coordinate_with_token(
        &self,
        domains: Vec<Domain>,
        ctx: Arc<WorkflowContext>,
        parent: &CancellationToken,
    ) -> Result<CoordinationResult, CoordinationError> {
        let mut seen = HashSet::new();
        for domain in &domains {
            if !seen.insert(domain.id.as_str()) {
                return Err(CoordinationError::DuplicateDomain(domain.id.clone()));
            }
        }

        let order = dependency_order(&domains).map_err(|e| CoordinationError::CycleDetected {
            domain_id: e.node,
        })?;

        let domain_count = domains.len();
        tracing::info!(domains = domain_count, policy = ?self.policy, "coordinating domains");
        self.event_bus
            .publish(OrchestratorEvent::CoordinationStarted { domain_count });

        let mut slots: Vec<Option<Domain>> = domains.into_iter().map(Some).collect();
        let (independent, dependent): (Vec<usize>, Vec<usize>) = order
            .into_iter()
            .partition(|&idx| slots[idx].as_ref().is_some_and(|d| d.depends_on.is_empty()));

        let mut result = CoordinationResult::default();

        // Independent domains: all at once.
        let mut join_set = JoinSet::new();
        let mut spawned = Vec::with_capacity(independent.len());
        for idx in independent {
            let Some(domain) = slots[idx].take() else {
                continue;
            };
            let (key, token) = self.track(&domain.id, parent);
            spawned.push((domain.id.clone(), key));
            join_set.spawn(self.run_domain(key, domain.id, domain.handler, Arc::clone(&ctx), token));
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((domain_id, outcome, elapsed_ms)) => {
                    result.durations_ms.insert(domain_id.clone(), elapsed_ms);
                    result.record(domain_id, outcome);
                }
                Err(e) => {
                    tracing::error!(error = %e, "domain task failed to join");
                }
            }
        }

        // A task that failed to join still has to be accounted for.
        for (domain_id, key) in spawned {
            if !result.results.contains_key(&domain_id) && !result.errors.contains_key(&domain_id) {
                self.active.remove(&key);
                result.record(domain_id, Err(DomainError::Panicked("task aborted".to_string())));
            }
        }

        // Dependent domains: one at a time, in dependency order.
        for idx in dependent {
            let Some(domain) = slots[idx].take() else {
                continue;
            };

            let missing: Vec<String> = domain
                .depends_on
                .iter()
                .filter(|dep| !self.dependency_satisfied(dep, &result))
                .cloned()
                .collect();

            if !missing.is_empty() {
                tracing::warn!(
                    domain_id = domain.id.as_str(),
                    missing = ?missing,
                    "domain dependencies not satisfied, skipping"
                );
                let err = DomainError::DependenciesNotSatisfied { missing };
                self.event_bus.publish(OrchestratorEvent::DomainFailed {
                    domain_id: domain.id.clone(),
                    error: err.to_string(),
                });
                result.record(domain.id, Err(err));
                continue;
            }

            let (key, token) = self.track(&domain.id, parent);
            let (domain_id, outcome, elapsed_ms) = self
                .run_domain(key, domain.id, domain.handler, Arc::clone(&ctx), token)
                .await;
            result.durations_ms.insert(domain_id.clone(), elapsed_ms);
            result.record(domain_id, outcome);
        }

        tracing::info!(
            succeeded = result.results.len(),
            failed = result.errors.len(),
            "coordination completed"
        );
        self.event_bus
            .publish(OrchestratorEvent::CoordinationCompleted {
                succeeded: result.results.len(),
                failed: result.errors.len(),
            });

        Ok(result)
    }

    /// Cancel every executing domain with this id, across all calls.
    ///
    /// Removes the entries from the active registry and fires their tokens.
    /// Handlers are expected to observe the token; they are not stopped
    /// forcibly. Returns whether anything was cancelled.
    pub fn cancel_domain(&self, domain_id: &str) -> bool {
        let keys: Vec<Uuid> = self
            .active
            .iter()
            .filter(|e| e.value().domain_id == domain_id)
            .map(|e| *e.key())
            .collect();
        keys.into_iter().filter(|key| self.cancel_entry(key)).count() > 0
    }

    /// Cancel every executing domain. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<Uuid> = self.active.iter().map(|e| *e.key()).collect();
        keys.iter().filter(|key| self.cancel_entry(key)).count()
    }

    /// Ids of the domains currently executing, sorted. An id appears once per
    /// call executing it.
    pub fn active_domains(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .iter()
            .map(|e| e.value().domain_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn cancel_entry(&self, key: &Uuid) -> bool {
        // The entry may have settled between collecting keys and removing it.
        let Some((_, entry)) = self.active.remove(key) else {
            return false;
        };
        entry.token.cancel();
        tracing::info!(domain_id = entry.domain_id.as_str(), "domain cancelled");
        self.event_bus.publish(OrchestratorEvent::DomainCancelled {
            domain_id: entry.domain_id,
        });
        true
    }

    fn track(&self, domain_id: &str, parent: &CancellationToken) -> (Uuid, CancellationToken) {
        let key = Uuid::now_v7();
        let token = parent.child_token();
        self.active.insert(
            key,
            ActiveDomain {
                domain_id: domain_id.to_string(),
                token: token.clone(),
            },
        );
        (key, token)
    }

    fn dependency_satisfied(&self, dep: &str, result: &CoordinationResult) -> bool {
        match self.policy {
            DependencyPolicy::Succeeded => result.results.contains_key(dep),
            DependencyPolicy::Settled => {
                result.results.contains_key(dep) || result.errors.contains_key(dep)
            }
        }
    }

    /// Execute one domain handler and settle its outcome.
    ///
    /// A domain whose token was cancelled is reported as cancelled whatever
    /// its handler returned.
    fn run_domain(
        &self,
        key: Uuid,
        domain_id: String,
        handler: TaskHandler,
        ctx: Arc<WorkflowContext>,
        token: CancellationToken,
    ) -> impl Future<Output = (String, Result<Value, DomainError>, u64)> + Send + 'static {
        let bus = self.event_bus.clone();
        let active = Arc::clone(&self.active);

        async move {
            if token.is_cancelled() {
                active.remove(&key);
                bus.publish(OrchestratorEvent::DomainCancelled {
                    domain_id: domain_id.clone(),
                });
                return (domain_id, Err(DomainError::Cancelled), 0);
            }

            bus.publish(OrchestratorEvent::DomainStarted {
                domain_id: domain_id.clone(),
            });
            tracing::debug!(domain_id = domain_id.as_str(), "domain started");

            let start = Instant::now();
            let handler_token = token.clone();
            let caught = AssertUnwindSafe(async move { handler(ctx, handler_token).await })
                .catch_unwind()
                .await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            active.remove(&key);

            let outcome = if token.is_cancelled() {
                Err(DomainError::Cancelled)
            } else {
                match caught {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(DomainError::Failed(error)),
                    Err(payload) => Err(DomainError::Panicked(panic_message(payload))),
                }
            };

            match &outcome {
                Ok(_) => {
                    tracing::debug!(domain_id = domain_id.as_str(), elapsed_ms, "domain completed");
                    bus.publish(OrchestratorEvent::DomainCompleted {
                        domain_id: domain_id.clone(),
                        duration_ms: elapsed_ms,
                    });
                }
                Err(DomainError::Cancelled) => {
                    tracing::debug!(domain_id = domain_id.as_str(), "domain settled after cancellation");
                }
                Err(err) => {
                    tracing::warn!(domain_id = domain_id.as_str(), error = %err, "domain failed");
                    bus.publish(OrchestratorEvent::DomainFailed {
                        domain_id: domain_id.clone(),
                        error: err.to_string(),
                    });
                }
            }

            (domain_id, outcome, elapsed_ms)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
