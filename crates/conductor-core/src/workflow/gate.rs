//! Validation gates: named async predicates checked before a run completes.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;

use super::action::panic_message;
use super::context::WorkflowContext;

/// Predicate deciding whether a gate passes. `Err` counts as not passed.
pub type GatePredicate =
    Arc<dyn Fn(Arc<WorkflowContext>) -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

/// A named check against a run's context.
#[derive(Clone)]
pub struct ValidationGate {
    pub id: String,
    /// Reported when the predicate returns `false`.
    pub message: Option<String>,
    predicate: GatePredicate,
}

impl ValidationGate {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, String>> + Send + 'static,
    {
        Self {
            id: id.into(),
            message: None,
            predicate: Arc::new(move |ctx: Arc<WorkflowContext>| f(ctx).boxed()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("id", &self.id)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// A gate that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedGate {
    pub id: String,
    pub message: String,
}

/// Outcome of `validate_gates`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub failed_gates: Vec<FailedGate>,
}

impl ValidationResult {
    pub fn failed_ids(&self) -> Vec<String> {
        self.failed_gates.iter().map(|g| g.id.clone()).collect()
    }
}

/// Evaluate `gates` in order against `ctx`.
///
/// Every gate is evaluated; a predicate that errors or panics fails closed.
pub async fn validate_gates(gates: &[ValidationGate], ctx: Arc<WorkflowContext>) -> ValidationResult {
    let mut failed_gates = Vec::new();

    for gate in gates {
        let predicate = Arc::clone(&gate.predicate);
        let gate_ctx = Arc::clone(&ctx);
        let outcome = AssertUnwindSafe(async move { predicate(gate_ctx).await })
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(
                gate.message
                    .clone()
                    .unwrap_or_else(|| format!("gate '{}' did not pass", gate.id)),
            ),
            Ok(Err(error)) => Some(format!("gate '{}' errored: {error}", gate.id)),
            Err(payload) => Some(format!(
                "gate '{}' panicked: {}",
                gate.id,
                panic_message(payload)
            )),
        };

        match failure {
            None => tracing::debug!(gate = gate.id.as_str(), "gate passed"),
            Some(message) => {
                tracing::warn!(gate = gate.id.as_str(), message = message.as_str(), "gate failed");
                failed_gates.push(FailedGate {
                    id: gate.id.clone(),
                    message,
                });
            }
        }
    }

    ValidationResult {
        passed: failed_gates.is_empty(),
        failed_gates,
    }
}

// ---------------------------------------------------------------------------
// GateRegistry
// ---------------------------------------------------------------------------

/// Gates available to workflow definitions, keyed by id.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: DashMap<String, ValidationGate>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, gate: ValidationGate) {
        self.gates.insert(gate.id.clone(), gate);
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.gates.remove(id).is_some()
    }

    /// Resolve gate ids to gates.
    ///
    /// Ids with no registered gate resolve to a gate that always fails, so an
    /// unknown gate blocks completion.
    pub fn resolve(&self, ids: &[String]) -> Vec<ValidationGate> {
        ids.iter()
            .map(|id| match self.gates.get(id) {
                Some(gate) => gate.value().clone(),
                None => {
                    tracing::warn!(gate = id.as_str(), "unknown validation gate");
                    ValidationGate::new(id.clone(), |_| async { Ok(false) })
                        .with_message(format!("gate '{id}' is not registered"))
                }
            })
            .collect()
    }
}
