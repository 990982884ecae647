//! Workflow domain types for Conductor.
//!
//! Defines the declarative file schema (`WorkflowFile`), the canonical
//! in-memory model the parser produces from it (`WorkflowDefinition`), and the
//! per-step execution records (`StepResult`) a run accumulates.

use serde::{Deserialize, Serialize};

/// Version assigned to definitions that do not declare one.
pub const DEFAULT_WORKFLOW_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Declarative file schema
// ---------------------------------------------------------------------------

/// The on-disk shape of a workflow definition.
///
/// ```yaml
/// workflow_id: release
/// name: Release pipeline
/// sequence: [build, test]
/// parallel: [lint, docs]
/// validation_gates: [coverage]
/// ```
///
/// Required fields are `Option` here so the parser can report which one is
/// missing instead of surfacing a raw deserializer error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step ids executed one after another.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<String>,
    /// Step ids with no implicit ordering between them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<String>,
    /// Gate ids, resolved to predicates by the executor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_gates: Vec<String>,
}

// ---------------------------------------------------------------------------
// Workflow Definition (canonical model)
// ---------------------------------------------------------------------------

/// An immutable, validated workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (also the run-map key).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Version string, `1.0.0` when the source omits it.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<WorkflowStep>,
    /// Gates checked after the last step.
    #[serde(default)]
    pub validation_gates: Vec<String>,
}

impl WorkflowDefinition {
    /// A definition with no steps, used when no source exists for `id`.
    pub fn empty(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: DEFAULT_WORKFLOW_VERSION.to_string(),
            description: None,
            steps: Vec::new(),
            validation_gates: Vec::new(),
        }
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// A single step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub kind: StepKind,
    /// Name of the registered action that implements this step.
    pub action: String,
    /// Step ids this step depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl WorkflowStep {
    pub fn sequential(id: impl Into<String>, depends_on: Option<String>) -> Self {
        let id = id.into();
        Self {
            action: id.clone(),
            id,
            kind: StepKind::Sequential,
            depends_on: depends_on.into_iter().collect(),
        }
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            action: id.clone(),
            id,
            kind: StepKind::Parallel,
            depends_on: Vec::new(),
        }
    }
}

/// How a step is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Sequential,
    Parallel,
}

// ---------------------------------------------------------------------------
// Run status and step results
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Completed, Failed and Cancelled runs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Outcome of a single executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

/// Record appended once per attempted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(step_id: impl Into<String>, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(step_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failure,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
