//! Per-run workflow state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_types::workflow::{StepResult, StepStatus, WorkflowDefinition, WorkflowStatus};
use serde::Serialize;

use super::context::WorkflowContext;

/// Snapshot of one workflow run.
///
/// `current_step` is the index of the next step to execute and always equals
/// `step_results.len()`: every attempted step appends exactly one result.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    pub definition: Arc<WorkflowDefinition>,
    pub context: WorkflowContext,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub step_results: Vec<StepResult>,
    /// First error that failed the run.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(definition: Arc<WorkflowDefinition>, context: WorkflowContext) -> Self {
        let now = Utc::now();
        Self {
            definition,
            context,
            status: WorkflowStatus::Running,
            current_step: 0,
            step_results: Vec::new(),
            error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.definition.id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Steps that finished successfully.
    pub fn steps_completed(&self) -> usize {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Success)
            .count()
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    pub(crate) fn push_result(&mut self, result: StepResult) {
        self.step_results.push(result);
        self.current_step = self.step_results.len();
        self.updated_at = Utc::now();
    }

    pub(crate) fn transition(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
        self.transition(WorkflowStatus::Failed);
    }
}
