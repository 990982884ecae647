//! Workflow execution context with step output tracking.
//!
//! `WorkflowContext` is the state that flows through a workflow run. Steps and
//! domains receive an immutable `Arc` snapshot; only the executor merges step
//! outputs back, with size limits to prevent unbounded memory growth.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Per-run execution context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Workflow this context belongs to.
    pub workflow_id: String,
    /// Who started the run.
    pub initiator: String,
    /// Free-form caller metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Environment overrides visible to steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    /// Step outputs keyed by step ID.
    #[serde(default)]
    pub step_outputs: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            initiator: initiator.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Look up an environment override.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment
            .as_ref()
            .and_then(|env| env.get(key))
            .map(String::as_str)
    }

    /// Store the output of a completed step.
    ///
    /// Enforces `MAX_STEP_OUTPUT_SIZE` (1 MB) per output. If the output
    /// exceeds this limit, it is replaced by a JSON marker describing the
    /// overflow. Also enforces `MAX_CONTEXT_SIZE` (10 MB) total: an output
    /// that would push the context past it is rejected and the context is
    /// left as it was.
    pub fn set_step_output(&mut self, step_id: &str, output: Value) -> Result<(), WorkflowError> {
        let serialized =
            serde_json::to_string(&output).map_err(|e| WorkflowError::Execution(e.to_string()))?;

        let stored = if serialized.len() > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size = serialized.len(),
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": serialized.len(),
                "_message": format!(
                    "output exceeded {} byte limit and was truncated",
                    MAX_STEP_OUTPUT_SIZE
                )
            });
            truncated
        } else {
            output
        };
        let previous = self.step_outputs.insert(step_id.to_string(), stored);

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            match previous {
                Some(previous) => self.step_outputs.insert(step_id.to_string(), previous),
                None => self.step_outputs.remove(step_id),
            };
            return Err(WorkflowError::Execution(format!(
                "total context size ({} bytes) exceeds maximum ({} bytes)",
                total, MAX_CONTEXT_SIZE
            )));
        }

        Ok(())
    }

    /// Get the output of a completed step.
    pub fn get_step_output(&self, step_id: &str) -> Option<&Value> {
        self.step_outputs.get(step_id)
    }

    /// Approximate serialized size of outputs and metadata, in bytes.
    pub fn total_size(&self) -> usize {
        let json_len = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        let outputs_size: usize = self.step_outputs.values().map(json_len).sum();
        let metadata_size: usize = self.metadata.values().map(json_len).sum();
        outputs_size + metadata_size
    }

    /// Serialize the context for inspection or hook payloads.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> WorkflowContext {
        WorkflowContext::new("release", "ci")
            .with_metadata("branch", json!("main"))
            .with_environment(HashMap::from([("STAGE".to_string(), "staging".to_string())]))
    }

    #[test]
    fn test_new_context() {
        let ctx = WorkflowContext::new("release", "ci");
        assert_eq!(ctx.workflow_id, "release");
        assert_eq!(ctx.initiator, "ci");
        assert!(ctx.step_outputs.is_empty());
        assert!(ctx.environment.is_none());
        assert_eq!(ctx.env("STAGE"), None);
    }

    #[test]
    fn test_builders_and_env_lookup() {
        let ctx = test_context();
        assert_eq!(ctx.metadata["branch"], json!("main"));
        assert_eq!(ctx.env("STAGE"), Some("staging"));
        assert_eq!(ctx.env("MISSING"), None);
    }

    #[test]
    fn test_set_and_get_step_output() {
        let mut ctx = test_context();
        ctx.set_step_output("build", json!({"artifact": "app.tar"}))
            .unwrap();
        assert_eq!(
            ctx.get_step_output("build"),
            Some(&json!({"artifact": "app.tar"}))
        );
        assert!(ctx.get_step_output("test").is_none());
    }

    #[test]
    fn test_step_output_size_limit_truncates() {
        let mut ctx = test_context();
        let big = "x".repeat(MAX_STEP_OUTPUT_SIZE + 10);
        ctx.set_step_output("big", json!(big)).unwrap();

        let stored = ctx.get_step_output("big").unwrap();
        assert_eq!(stored["_truncated"], json!(true));
    }

    #[test]
    fn test_total_context_size_limit() {
        let mut ctx = test_context();
        let chunk = "y".repeat(MAX_STEP_OUTPUT_SIZE - 100);
        let mut last = Ok(());
        for i in 0..12 {
            last = ctx.set_step_output(&format!("s{i}"), json!(chunk));
            if last.is_err() {
                break;
            }
        }
        let err = last.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"), "got: {err}");
    }

    #[test]
    fn test_rejected_output_leaves_context_unchanged() {
        let mut ctx = test_context();
        let chunk = "z".repeat(MAX_STEP_OUTPUT_SIZE - 100);
        let mut rejected = None;
        for i in 0..12 {
            let step_id = format!("s{i}");
            if ctx.set_step_output(&step_id, json!(chunk)).is_err() {
                rejected = Some(step_id);
                break;
            }
        }

        let rejected = rejected.expect("context cap never reached");
        assert!(ctx.get_step_output(&rejected).is_none());
        assert!(ctx.total_size() <= MAX_CONTEXT_SIZE);

        // Growing an existing output past the cap keeps the old value.
        ctx.set_step_output("s0", json!("small")).unwrap();
        ctx.set_step_output("filler", json!(chunk)).unwrap();
        assert!(ctx.set_step_output("s0", json!(chunk)).is_err());
        assert_eq!(ctx.get_step_output("s0"), Some(&json!("small")));
    }

    #[test]
    fn test_to_json_includes_outputs() {
        let mut ctx = test_context();
        ctx.set_step_output("build", json!(1)).unwrap();
        let value = ctx.to_json();
        assert_eq!(value["workflow_id"], json!("release"));
        assert_eq!(value["step_outputs"]["build"], json!(1));
    }
}
