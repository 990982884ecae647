//! Event types for the Conductor event bus.
//!
//! `OrchestratorEvent` is the unified lifecycle notification broadcast by the
//! workflow executor and the domain coordinator. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

/// Events emitted while workflows run and domains are coordinated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    // -- Workflow lifecycle --
    WorkflowStarted {
        workflow_id: String,
        workflow_name: String,
        step_count: usize,
    },

    StepStarted {
        workflow_id: String,
        step_id: String,
    },

    StepCompleted {
        workflow_id: String,
        step_id: String,
        duration_ms: u64,
    },

    StepFailed {
        workflow_id: String,
        step_id: String,
        error: String,
    },

    WorkflowPaused {
        workflow_id: String,
        /// Index of the step the run had reached when paused.
        current_step: usize,
    },

    WorkflowResumed {
        workflow_id: String,
        current_step: usize,
    },

    WorkflowCompleted {
        workflow_id: String,
        duration_ms: u64,
        steps_completed: usize,
    },

    WorkflowFailed {
        workflow_id: String,
        error: String,
    },

    WorkflowCancelled {
        workflow_id: String,
    },

    // -- Domain coordination --
    CoordinationStarted {
        domain_count: usize,
    },

    DomainStarted {
        domain_id: String,
    },

    DomainCompleted {
        domain_id: String,
        duration_ms: u64,
    },

    DomainFailed {
        domain_id: String,
        error: String,
    },

    /// A domain's bookkeeping was dropped by an explicit cancellation.
    DomainCancelled {
        domain_id: String,
    },

    CoordinationCompleted {
        succeeded: usize,
        failed: usize,
    },
}

impl OrchestratorEvent {
    /// Workflow id for workflow-scoped events, `None` for coordination events.
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::WorkflowStarted { workflow_id, .. }
            | OrchestratorEvent::StepStarted { workflow_id, .. }
            | OrchestratorEvent::StepCompleted { workflow_id, .. }
            | OrchestratorEvent::StepFailed { workflow_id, .. }
            | OrchestratorEvent::WorkflowPaused { workflow_id, .. }
            | OrchestratorEvent::WorkflowResumed { workflow_id, .. }
            | OrchestratorEvent::WorkflowCompleted { workflow_id, .. }
            | OrchestratorEvent::WorkflowFailed { workflow_id, .. }
            | OrchestratorEvent::WorkflowCancelled { workflow_id } => Some(workflow_id),
            _ => None,
        }
    }

    /// Whether this event settles its workflow run.
    pub fn ends_workflow(&self) -> bool {
        matches!(
            self,
            OrchestratorEvent::WorkflowCompleted { .. }
                | OrchestratorEvent::WorkflowFailed { .. }
                | OrchestratorEvent::WorkflowCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_settling_events_end_a_workflow() {
        let cancelled = OrchestratorEvent::WorkflowCancelled {
            workflow_id: "release".to_string(),
        };
        let paused = OrchestratorEvent::WorkflowPaused {
            workflow_id: "release".to_string(),
            current_step: 1,
        };
        assert!(cancelled.ends_workflow());
        assert!(!paused.ends_workflow());
        assert!(!OrchestratorEvent::CoordinationStarted { domain_count: 1 }.ends_workflow());
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = OrchestratorEvent::DomainFailed {
            domain_id: "docs".to_string(),
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "domain_failed");
        assert_eq!(json["domain_id"], "docs");
    }

    #[test]
    fn workflow_id_accessor() {
        let event = OrchestratorEvent::WorkflowCancelled {
            workflow_id: "release".to_string(),
        };
        assert_eq!(event.workflow_id(), Some("release"));

        let event = OrchestratorEvent::CoordinationStarted { domain_count: 2 };
        assert_eq!(event.workflow_id(), None);
    }
}
