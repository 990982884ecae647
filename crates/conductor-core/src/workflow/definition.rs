//! Workflow definition parsing and validation.
//!
//! Converts between the declarative YAML schema (`WorkflowFile`) and the
//! canonical `WorkflowDefinition` model, and validates structural constraints
//! (required fields, unique step ids, valid dependencies).

use std::collections::HashSet;

use conductor_types::error::SourceError;
use conductor_types::workflow::{
    DEFAULT_WORKFLOW_VERSION, StepKind, WorkflowDefinition, WorkflowFile, WorkflowStep,
};
use thiserror::Error;

use super::dag::{DependencyNode, dependency_order};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or handling a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML syntax failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// A required field is missing or the structure is invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// The workflow source could not provide the definition.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Runtime failure while handling workflow data.
    #[error("execution error: {0}")]
    Execution(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// `sequence` entries become sequential steps, each depending on the one
/// before it. `parallel` entries become parallel steps with no implicit
/// dependency and follow the sequential ones.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let file: WorkflowFile =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    build_definition(file)
}

/// Build a validated `WorkflowDefinition` from an already deserialized file.
pub fn build_definition(file: WorkflowFile) -> Result<WorkflowDefinition, WorkflowError> {
    let id = required(file.workflow_id, "workflow_id")?;
    let name = required(file.name, "name")?;

    let mut steps = Vec::with_capacity(file.sequence.len() + file.parallel.len());
    let mut previous: Option<String> = None;
    for step_id in file.sequence {
        steps.push(WorkflowStep::sequential(step_id.clone(), previous.take()));
        previous = Some(step_id);
    }
    steps.extend(file.parallel.into_iter().map(WorkflowStep::parallel));

    let def = WorkflowDefinition {
        id,
        name,
        version: file
            .version
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WORKFLOW_VERSION.to_string()),
        description: file.description,
        steps,
        validation_gates: file.validation_gates,
    };
    validate_definition(&def)?;
    Ok(def)
}

fn required(value: Option<String>, field: &str) -> Result<String, WorkflowError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(WorkflowError::Validation(format!(
            "required field '{field}' must not be empty"
        ))),
        None => Err(WorkflowError::Validation(format!(
            "missing required field '{field}'"
        ))),
    }
}

/// Serialize a `WorkflowDefinition` back to the declarative YAML schema.
///
/// Sequential steps are written to `sequence` and parallel steps to
/// `parallel`, each in definition order.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    let ids_of = |kind: StepKind| {
        def.steps
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.id.clone())
            .collect::<Vec<_>>()
    };
    let file = WorkflowFile {
        workflow_id: Some(def.id.clone()),
        name: Some(def.name.clone()),
        version: Some(def.version.clone()),
        description: def.description.clone(),
        sequence: ids_of(StepKind::Sequential),
        parallel: ids_of(StepKind::Parallel),
        validation_gates: def.validation_gates.clone(),
    };
    serde_yaml_ng::to_string(&file).map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id and name are non-empty
/// - All step ids are unique across `sequence` and `parallel`
/// - All `depends_on` references point to existing step ids
/// - Step dependencies are acyclic
///
/// A definition without steps is valid and completes immediately.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::Validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    dependency_order(&def.steps).map_err(|e| WorkflowError::Validation(e.to_string()))?;

    Ok(())
}

impl DependencyNode for WorkflowStep {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
