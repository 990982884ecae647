//! Workflow executor: the run state machine.
//!
//! A run moves through `Running`, `Paused` and one of the terminal states
//! `Completed`, `Failed` or `Cancelled`. The driver executes steps in
//! definition order:
//!
//! 1. A sequential step runs its registered action. A failure fails the run.
//! 2. Each maximal run of consecutive parallel steps becomes one
//!    `DomainCoordinator` batch. Any failed domain fails the run once every
//!    result of the batch has been recorded.
//! 3. After the last step the definition's validation gates are checked.
//!
//! Run state lives in a `DashMap`. The driver never holds a map guard across
//! an await: it snapshots what the next step needs, runs it, then merges the
//! results back under a short lock. Pausing only flips the status; the driver
//! notices before starting the next step.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use conductor_types::config::OrchestratorConfig;
use conductor_types::event::OrchestratorEvent;
use conductor_types::hook::{HookEventType, HookMetadata, HookStatus};
use conductor_types::workflow::{
    StepKind, StepResult, StepStatus, WorkflowDefinition, WorkflowStatus, WorkflowStep,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::event::EventBus;
use crate::hook::HookEngine;

use super::action::{ActionRegistry, TaskHandler, panic_message, task_handler};
use super::context::WorkflowContext;
use super::coordinator::{Domain, DomainCoordinator};
use super::definition::{WorkflowError, parse_workflow_yaml, validate_definition};
use super::gate::{GateRegistry, validate_gates};
use super::source::WorkflowSource;
use super::state::WorkflowState;

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors from the workflow executor.
///
/// `StepFailed` and `GatesFailed` describe why a run failed; the run itself
/// stays queryable through `get_workflow_state` until it is acknowledged or
/// pruned.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("step '{step_id}' failed: {error}")]
    StepFailed { step_id: String, error: String },

    #[error("validation gates failed: {}", gates.join(", "))]
    GatesFailed { gates: Vec<String> },

    #[error("workflow '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no run found for workflow '{0}'")]
    RunNotFound(String),

    #[error("cannot {action} workflow '{workflow_id}' while it is {status:?}")]
    InvalidTransition {
        workflow_id: String,
        status: WorkflowStatus,
        action: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunEntry {
    state: WorkflowState,
    /// Handed to every step and domain of the run; fired by `cancel_workflow`.
    cancel: CancellationToken,
    /// Whether a driver task is currently advancing this run.
    driving: bool,
}

/// What the driver does next, captured under the run lock.
enum NextWork {
    Steps {
        steps: Vec<WorkflowStep>,
        ctx: Arc<WorkflowContext>,
        token: CancellationToken,
    },
    Gates {
        gate_ids: Vec<String>,
        ctx: Arc<WorkflowContext>,
    },
}

impl NextWork {
    fn for_run(entry: &RunEntry) -> Self {
        let state = &entry.state;
        let ctx = Arc::new(state.context.clone());
        let steps = &state.definition.steps;
        let next = state.step_results.len();

        let Some(step) = steps.get(next) else {
            return NextWork::Gates {
                gate_ids: state.definition.validation_gates.clone(),
                ctx,
            };
        };

        let batch: Vec<WorkflowStep> = match step.kind {
            StepKind::Sequential => vec![step.clone()],
            StepKind::Parallel => steps[next..]
                .iter()
                .take_while(|s| s.kind == StepKind::Parallel)
                .cloned()
                .collect(),
        };
        NextWork::Steps {
            steps: batch,
            ctx,
            token: entry.cancel.clone(),
        }
    }
}

fn hook_payload<const N: usize>(pairs: [(&str, Value); N]) -> HashMap<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn missing_action(action: &str) -> TaskHandler {
    let message = format!("no action registered for '{action}'");
    task_handler(move |_: Arc<WorkflowContext>, _: CancellationToken| {
        let message = message.clone();
        async move { Err(message) }
    })
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Loads workflow definitions and drives their runs.
///
/// Generic over `S: WorkflowSource` so the definition store can be swapped
/// (filesystem in production, in-memory in tests).
pub struct WorkflowExecutor<S: WorkflowSource> {
    source: S,
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    runs: DashMap<String, RunEntry>,
    actions: ActionRegistry,
    gates: GateRegistry,
    coordinator: DomainCoordinator,
    event_bus: EventBus,
    hooks: Option<Arc<HookEngine>>,
    run_retention: Duration,
}

impl<S: WorkflowSource> WorkflowExecutor<S> {
    pub fn new(source: S, event_bus: EventBus) -> Self {
        Self {
            source,
            definitions: DashMap::new(),
            runs: DashMap::new(),
            actions: ActionRegistry::new(),
            gates: GateRegistry::new(),
            coordinator: DomainCoordinator::new(event_bus.clone()),
            event_bus,
            hooks: None,
            run_retention: OrchestratorConfig::default().run_retention(),
        }
    }

    /// Executor with its own event bus, dependency policy and run retention
    /// taken from `config`.
    pub fn from_config(source: S, config: &OrchestratorConfig) -> Self {
        let event_bus = EventBus::from_config(config);
        let mut executor = Self::new(source, event_bus);
        executor.coordinator = executor.coordinator.with_policy(config.dependency_policy);
        executor.run_retention = config.run_retention();
        executor
    }

    /// Fire lifecycle hooks into `hooks` as runs progress.
    pub fn with_hooks(mut self, hooks: Arc<HookEngine>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_run_retention(mut self, retention: Duration) -> Self {
        self.run_retention = retention;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn gates(&self) -> &GateRegistry {
        &self.gates
    }

    pub fn coordinator(&self) -> &DomainCoordinator {
        &self.coordinator
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn hooks(&self) -> Option<&Arc<HookEngine>> {
        self.hooks.as_ref()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Return the definition for `workflow_id`, fetching and caching it on
    /// first use.
    ///
    /// A source with no entry for the id yields an empty definition, which is
    /// not cached. Any other source failure and any parse failure is returned.
    pub async fn load_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        if let Some(cached) = self.definitions.get(workflow_id) {
            return Ok(Arc::clone(cached.value()));
        }

        let yaml = match self.source.fetch(workflow_id).await {
            Ok(yaml) => yaml,
            Err(e) if e.is_not_found() => {
                tracing::warn!(workflow_id, "workflow definition not found, using empty default");
                return Ok(Arc::new(WorkflowDefinition::empty(workflow_id)));
            }
            Err(e) => return Err(e.into()),
        };

        let definition = parse_workflow_yaml(&yaml)?;
        if definition.id != workflow_id {
            return Err(WorkflowError::Validation(format!(
                "definition declares workflow_id '{}' but was loaded as '{workflow_id}'",
                definition.id
            )));
        }

        let definition = Arc::new(definition);
        self.definitions
            .insert(workflow_id.to_string(), Arc::clone(&definition));
        tracing::debug!(
            workflow_id,
            steps = definition.steps.len(),
            "workflow definition loaded"
        );
        Ok(definition)
    }

    /// Cache a programmatically built definition, replacing any cached one.
    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        validate_definition(&definition)?;
        let definition = Arc::new(definition);
        self.definitions
            .insert(definition.id.clone(), Arc::clone(&definition));
        Ok(definition)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Start a run of `workflow_id` and drive it until it pauses or ends.
    ///
    /// Rejected with `AlreadyRunning` while a previous run of the same id is
    /// `Running` or `Paused`; a terminal run is replaced.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        mut context: WorkflowContext,
    ) -> Result<WorkflowStatus, ExecutorError> {
        if self.is_active(workflow_id) {
            return Err(ExecutorError::AlreadyRunning(workflow_id.to_string()));
        }

        let definition = self.load_workflow(workflow_id).await?;
        if context.workflow_id != workflow_id {
            context.workflow_id = workflow_id.to_string();
        }
        let run = RunEntry {
            state: WorkflowState::new(Arc::clone(&definition), context.clone()),
            cancel: CancellationToken::new(),
            driving: true,
        };

        match self.runs.entry(workflow_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().state.is_terminal() {
                    return Err(ExecutorError::AlreadyRunning(workflow_id.to_string()));
                }
                occupied.insert(run);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(run);
            }
        }

        tracing::info!(
            workflow_id,
            name = definition.name.as_str(),
            steps = definition.steps.len(),
            "workflow started"
        );
        self.event_bus.publish(OrchestratorEvent::WorkflowStarted {
            workflow_id: workflow_id.to_string(),
            workflow_name: definition.name.clone(),
            step_count: definition.steps.len(),
        });
        self.fire_hooks(
            HookEventType::OnWorkflowStart,
            &context,
            hook_payload([
                ("workflow_name", json!(definition.name)),
                ("step_count", json!(definition.steps.len())),
            ]),
        )
        .await;

        self.drive(workflow_id).await
    }

    /// `start_workflow` on a spawned task.
    pub fn spawn_workflow(
        self: &Arc<Self>,
        workflow_id: impl Into<String>,
        context: WorkflowContext,
    ) -> JoinHandle<Result<WorkflowStatus, ExecutorError>>
    where
        S: 'static,
    {
        let executor = Arc::clone(self);
        let workflow_id = workflow_id.into();
        tokio::spawn(async move { executor.start_workflow(&workflow_id, context).await })
    }

    /// Mark a running workflow as paused.
    ///
    /// The step in flight finishes and is recorded; the next one does not
    /// start until `resume_workflow`.
    pub fn pause_workflow(&self, workflow_id: &str) -> Result<(), ExecutorError> {
        let current_step = {
            let mut entry = self.run_mut(workflow_id)?;
            if entry.state.status != WorkflowStatus::Running {
                return Err(invalid_transition(workflow_id, entry.state.status, "pause"));
            }
            entry.state.transition(WorkflowStatus::Paused);
            entry.state.current_step
        };

        tracing::info!(workflow_id, current_step, "workflow paused");
        self.event_bus.publish(OrchestratorEvent::WorkflowPaused {
            workflow_id: workflow_id.to_string(),
            current_step,
        });
        Ok(())
    }

    /// Resume a paused workflow from the step after its last result.
    ///
    /// If the original driver has not stopped yet it simply carries on and
    /// this returns `Running`; otherwise the run is driven here until it
    /// pauses or ends.
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<WorkflowStatus, ExecutorError> {
        let (current_step, already_driving) = {
            let mut entry = self.run_mut(workflow_id)?;
            if entry.state.status != WorkflowStatus::Paused {
                return Err(invalid_transition(workflow_id, entry.state.status, "resume"));
            }
            entry.state.transition(WorkflowStatus::Running);
            let already_driving = entry.driving;
            entry.driving = true;
            (entry.state.current_step, already_driving)
        };

        tracing::info!(workflow_id, current_step, "workflow resumed");
        self.event_bus.publish(OrchestratorEvent::WorkflowResumed {
            workflow_id: workflow_id.to_string(),
            current_step,
        });

        if already_driving {
            return Ok(WorkflowStatus::Running);
        }
        self.drive(workflow_id).await
    }

    /// Cancel a running or paused workflow and fire its cancellation token.
    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<(), ExecutorError> {
        {
            let mut entry = self.run_mut(workflow_id)?;
            if entry.state.is_terminal() {
                return Err(invalid_transition(workflow_id, entry.state.status, "cancel"));
            }
            entry.state.transition(WorkflowStatus::Cancelled);
            entry.cancel.cancel();
        }

        tracing::info!(workflow_id, "workflow cancelled");
        self.event_bus.publish(OrchestratorEvent::WorkflowCancelled {
            workflow_id: workflow_id.to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection and retention
    // -----------------------------------------------------------------------

    pub fn get_workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.runs.get(workflow_id).map(|entry| entry.state.status)
    }

    /// Snapshot of a run's full state.
    pub fn get_workflow_state(&self, workflow_id: &str) -> Option<WorkflowState> {
        self.runs.get(workflow_id).map(|entry| entry.state.clone())
    }

    /// Ids of runs that are `Running` or `Paused`, sorted.
    pub fn list_active_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runs
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop a finished run.
    pub fn acknowledge_workflow(&self, workflow_id: &str) -> Result<(), ExecutorError> {
        if self
            .runs
            .remove_if(workflow_id, |_, entry| entry.state.is_terminal())
            .is_some()
        {
            tracing::debug!(workflow_id, "workflow run acknowledged");
            return Ok(());
        }
        match self.runs.get(workflow_id) {
            Some(entry) => Err(invalid_transition(workflow_id, entry.state.status, "acknowledge")),
            None => Err(ExecutorError::RunNotFound(workflow_id.to_string())),
        }
    }

    /// Drop terminal runs that finished at least `run_retention` ago.
    /// Returns how many were dropped.
    pub fn prune_finished_runs(&self) -> usize {
        let retention =
            chrono::Duration::from_std(self.run_retention).unwrap_or(chrono::Duration::MAX);
        let now = chrono::Utc::now();
        let mut pruned = 0;
        self.runs.retain(|_, entry| {
            let expired = entry.state.is_terminal()
                && entry
                    .state
                    .finished_at
                    .is_some_and(|finished| now - finished >= retention);
            if expired {
                pruned += 1;
            }
            !expired
        });
        if pruned > 0 {
            tracing::debug!(pruned, "finished workflow runs pruned");
        }
        pruned
    }

    fn is_active(&self, workflow_id: &str) -> bool {
        self.runs
            .get(workflow_id)
            .is_some_and(|entry| !entry.state.is_terminal())
    }

    fn run_mut(
        &self,
        workflow_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, RunEntry>, ExecutorError> {
        self.runs
            .get_mut(workflow_id)
            .ok_or_else(|| ExecutorError::RunNotFound(workflow_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn drive(&self, workflow_id: &str) -> Result<WorkflowStatus, ExecutorError> {
        loop {
            let work = {
                let mut entry = self.run_mut(workflow_id)?;
                if entry.state.status != WorkflowStatus::Running {
                    entry.driving = false;
                    tracing::debug!(workflow_id, status = ?entry.state.status, "driver stopped");
                    return Ok(entry.state.status);
                }
                NextWork::for_run(&entry)
            };

            match work {
                NextWork::Steps { steps, ctx, token } => {
                    let results = match steps.first() {
                        Some(step) if step.kind == StepKind::Sequential => {
                            vec![self.run_step(workflow_id, step, ctx, token).await]
                        }
                        _ => self.run_parallel(workflow_id, &steps, ctx, &token).await,
                    };
                    self.record_results(workflow_id, results).await?;
                }
                NextWork::Gates { gate_ids, ctx } => {
                    if let Some(status) = self.finish(workflow_id, gate_ids, ctx).await? {
                        return Ok(status);
                    }
                }
            }
        }
    }

    async fn run_step(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        ctx: Arc<WorkflowContext>,
        token: CancellationToken,
    ) -> StepResult {
        tracing::debug!(workflow_id, step_id = step.id.as_str(), "step started");
        self.event_bus.publish(OrchestratorEvent::StepStarted {
            workflow_id: workflow_id.to_string(),
            step_id: step.id.clone(),
        });

        let started = Instant::now();
        let handler = self
            .actions
            .get(&step.action)
            .unwrap_or_else(|| missing_action(&step.action));
        let step_ctx = Arc::clone(&ctx);
        let outcome = AssertUnwindSafe(async move { handler(step_ctx, token).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(format!("step panicked: {}", panic_message(payload))));
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => StepResult::success(step.id.as_str(), output, duration_ms),
            Err(error) => StepResult::failure(step.id.as_str(), error, duration_ms),
        };
        self.announce_step(workflow_id, &result, &ctx).await;
        result
    }

    /// Run consecutive parallel steps as one coordinator batch.
    ///
    /// Results come back in definition order, one per step.
    async fn run_parallel(
        &self,
        workflow_id: &str,
        steps: &[WorkflowStep],
        ctx: Arc<WorkflowContext>,
        token: &CancellationToken,
    ) -> Vec<StepResult> {
        let batch: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        let domains: Vec<Domain> = steps
            .iter()
            .map(|step| {
                self.event_bus.publish(OrchestratorEvent::StepStarted {
                    workflow_id: workflow_id.to_string(),
                    step_id: step.id.clone(),
                });
                let handler = self
                    .actions
                    .get(&step.action)
                    .unwrap_or_else(|| missing_action(&step.action));
                // Dependencies outside the batch already succeeded.
                Domain::from_handler(step.id.clone(), handler).depends_on(
                    step.depends_on
                        .iter()
                        .filter(|dep| batch.contains(dep.as_str()))
                        .cloned(),
                )
            })
            .collect();

        tracing::debug!(workflow_id, steps = steps.len(), "running parallel batch");
        let results: Vec<StepResult> = match self
            .coordinator
            .coordinate_with_token(domains, Arc::clone(&ctx), token)
            .await
        {
            Ok(mut coordination) => steps
                .iter()
                .map(|step| {
                    let duration_ms = coordination
                        .durations_ms
                        .get(&step.id)
                        .copied()
                        .unwrap_or(0);
                    match coordination.results.remove(&step.id) {
                        Some(output) => StepResult::success(step.id.as_str(), output, duration_ms),
                        None => {
                            let error = coordination
                                .errors
                                .remove(&step.id)
                                .unwrap_or_else(|| "domain produced no result".to_string());
                            StepResult::failure(step.id.as_str(), error, duration_ms)
                        }
                    }
                })
                .collect(),
            Err(e) => steps
                .iter()
                .map(|step| StepResult::failure(step.id.as_str(), e.to_string(), 0))
                .collect(),
        };

        for result in &results {
            self.announce_step(workflow_id, result, &ctx).await;
        }
        results
    }

    async fn announce_step(&self, workflow_id: &str, result: &StepResult, ctx: &WorkflowContext) {
        match result.status {
            StepStatus::Success => {
                tracing::debug!(
                    workflow_id,
                    step_id = result.step_id.as_str(),
                    duration_ms = result.duration_ms,
                    "step completed"
                );
                self.event_bus.publish(OrchestratorEvent::StepCompleted {
                    workflow_id: workflow_id.to_string(),
                    step_id: result.step_id.clone(),
                    duration_ms: result.duration_ms,
                });
                self.fire_hooks(
                    HookEventType::OnStepComplete,
                    ctx,
                    hook_payload([
                        ("step_id", json!(result.step_id)),
                        ("duration_ms", json!(result.duration_ms)),
                        ("output", result.output.clone().unwrap_or(Value::Null)),
                    ]),
                )
                .await;
            }
            StepStatus::Failure | StepStatus::Skipped => {
                let error = result.error.clone().unwrap_or_default();
                tracing::warn!(
                    workflow_id,
                    step_id = result.step_id.as_str(),
                    error = error.as_str(),
                    "step failed"
                );
                self.event_bus.publish(OrchestratorEvent::StepFailed {
                    workflow_id: workflow_id.to_string(),
                    step_id: result.step_id.clone(),
                    error: error.clone(),
                });
                self.fire_hooks(
                    HookEventType::OnStepError,
                    ctx,
                    hook_payload([("step_id", json!(result.step_id)), ("error", json!(error))]),
                )
                .await;
            }
        }
    }

    /// Append step results and merge outputs into the run's context.
    ///
    /// Fails the run on the first failed step unless it was cancelled
    /// meanwhile.
    async fn record_results(
        &self,
        workflow_id: &str,
        results: Vec<StepResult>,
    ) -> Result<(), ExecutorError> {
        let (step_id, error, context) = {
            let mut entry = self.run_mut(workflow_id)?;
            let cancelled = entry.state.status == WorkflowStatus::Cancelled;
            let mut failure: Option<(String, String)> = None;

            for mut result in results {
                match (&result.status, &result.output) {
                    (StepStatus::Success, Some(output)) if !cancelled => {
                        if let Err(e) = entry
                            .state
                            .context
                            .set_step_output(&result.step_id, output.clone())
                        {
                            // An output the context cannot hold fails its step.
                            result = StepResult::failure(
                                result.step_id.clone(),
                                e.to_string(),
                                result.duration_ms,
                            );
                            failure.get_or_insert_with(|| (result.step_id.clone(), e.to_string()));
                        }
                    }
                    (StepStatus::Success, _) => {}
                    _ => {
                        failure.get_or_insert_with(|| {
                            (
                                result.step_id.clone(),
                                result.error.clone().unwrap_or_default(),
                            )
                        });
                    }
                }
                entry.state.push_result(result);
            }

            match failure {
                Some((step_id, error)) if !cancelled => {
                    entry
                        .state
                        .fail(format!("step '{step_id}' failed: {error}"));
                    entry.driving = false;
                    (step_id, error, entry.state.context.clone())
                }
                _ => return Ok(()),
            }
        };

        self.announce_failure(workflow_id, &context, format!("step '{step_id}' failed: {error}"))
            .await;
        Err(ExecutorError::StepFailed { step_id, error })
    }

    /// Check gates and settle the run. Returns `None` when the run left
    /// `Running` while gates were evaluated.
    async fn finish(
        &self,
        workflow_id: &str,
        gate_ids: Vec<String>,
        ctx: Arc<WorkflowContext>,
    ) -> Result<Option<WorkflowStatus>, ExecutorError> {
        let validation = if gate_ids.is_empty() {
            None
        } else {
            let gates = self.gates.resolve(&gate_ids);
            Some(validate_gates(&gates, Arc::clone(&ctx)).await)
        };
        let failed_gates = validation
            .as_ref()
            .map(|v| v.failed_ids())
            .unwrap_or_default();

        let (duration_ms, steps_completed) = {
            let mut entry = self.run_mut(workflow_id)?;
            if entry.state.status != WorkflowStatus::Running {
                return Ok(None);
            }
            if failed_gates.is_empty() {
                entry.state.transition(WorkflowStatus::Completed);
            } else {
                entry
                    .state
                    .fail(format!("validation gates failed: {}", failed_gates.join(", ")));
            }
            entry.driving = false;
            (entry.state.duration_ms(), entry.state.steps_completed())
        };

        if let Some(validation) = &validation {
            let event = if validation.passed {
                HookEventType::OnWorkflowGatePassed
            } else {
                HookEventType::OnWorkflowGateFailed
            };
            self.fire_hooks(
                event,
                &ctx,
                hook_payload([
                    ("gates", json!(gate_ids)),
                    ("failed_gates", json!(validation.failed_gates)),
                ]),
            )
            .await;
        }

        if !failed_gates.is_empty() {
            self.announce_failure(
                workflow_id,
                &ctx,
                format!("validation gates failed: {}", failed_gates.join(", ")),
            )
            .await;
            return Err(ExecutorError::GatesFailed {
                gates: failed_gates,
            });
        }

        tracing::info!(workflow_id, duration_ms, steps_completed, "workflow completed");
        self.event_bus.publish(OrchestratorEvent::WorkflowCompleted {
            workflow_id: workflow_id.to_string(),
            duration_ms,
            steps_completed,
        });
        self.fire_hooks(
            HookEventType::OnWorkflowComplete,
            &ctx,
            hook_payload([
                ("duration_ms", json!(duration_ms)),
                ("steps_completed", json!(steps_completed)),
            ]),
        )
        .await;
        Ok(Some(WorkflowStatus::Completed))
    }

    async fn announce_failure(&self, workflow_id: &str, ctx: &WorkflowContext, error: String) {
        tracing::warn!(workflow_id, error = error.as_str(), "workflow failed");
        self.event_bus.publish(OrchestratorEvent::WorkflowFailed {
            workflow_id: workflow_id.to_string(),
            error: error.clone(),
        });
        self.fire_hooks(
            HookEventType::OnWorkflowError,
            ctx,
            hook_payload([("error", json!(error))]),
        )
        .await;
    }

    /// Fire `event` into the attached hook engine. Hook outcomes are logged
    /// and never affect the run.
    async fn fire_hooks(
        &self,
        event: HookEventType,
        ctx: &WorkflowContext,
        mut payload: HashMap<String, Value>,
    ) {
        let Some(hooks) = &self.hooks else {
            return;
        };
        payload.insert("workflow_id".to_string(), json!(ctx.workflow_id));

        let metadata_str =
            |key: &str| ctx.metadata.get(key).and_then(Value::as_str).map(str::to_string);
        let metadata = HookMetadata {
            user_id: (!ctx.initiator.is_empty()).then(|| ctx.initiator.clone()),
            project_id: metadata_str("project_id"),
            trace_id: metadata_str("trace_id"),
        };

        let results = hooks.execute_hooks(event.clone(), payload, metadata).await;
        let failed = results
            .iter()
            .filter(|r| matches!(r.status, HookStatus::Failed | HookStatus::Timeout))
            .count();
        if failed > 0 {
            tracing::warn!(
                workflow_id = ctx.workflow_id.as_str(),
                event = %event,
                failed,
                "workflow hooks failed"
            );
        }
    }
}

fn invalid_transition(
    workflow_id: &str,
    status: WorkflowStatus,
    action: &'static str,
) -> ExecutorError {
    ExecutorError::InvalidTransition {
        workflow_id: workflow_id.to_string(),
        status,
        action,
    }
}

impl<S: WorkflowSource> std::fmt::Debug for WorkflowExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("definitions", &self.definitions.len())
            .field("runs", &self.runs.len())
            .field("actions", &self.actions)
            .field("hooks", &self.hooks.is_some())
            .field("run_retention", &self.run_retention)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
