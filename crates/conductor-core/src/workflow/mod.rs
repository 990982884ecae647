//! Workflow engine core: definitions, domain coordination, gates and the run
//! state machine.
//!
//! - `definition` -- YAML parsing and structural validation
//! - `source` -- the `WorkflowSource` port for raw definition text
//! - `dag` -- dependency ordering and cycle detection
//! - `context` -- per-run context with size-capped step outputs
//! - `action` -- step/domain handlers and the `ActionRegistry`
//! - `coordinator` -- dependency-aware parallel domain execution
//! - `gate` -- validation gates and the `GateRegistry`
//! - `state` -- per-run `WorkflowState`
//! - `executor` -- the `WorkflowExecutor` state machine

pub mod action;
pub mod context;
pub mod coordinator;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod gate;
pub mod source;
pub mod state;

pub use action::{ActionRegistry, TaskHandler, TaskOutcome, task_handler};
pub use context::WorkflowContext;
pub use coordinator::{CoordinationError, CoordinationResult, Domain, DomainCoordinator, DomainError};
pub use definition::{WorkflowError, parse_workflow_yaml, serialize_workflow_yaml, validate_definition};
pub use executor::{ExecutorError, WorkflowExecutor};
pub use gate::{GateRegistry, ValidationGate, ValidationResult, validate_gates};
pub use source::{InMemoryWorkflowSource, WorkflowSource};
pub use state::WorkflowState;
