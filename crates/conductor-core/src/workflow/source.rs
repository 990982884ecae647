//! Workflow source port.
//!
//! The executor pulls raw definition text through `WorkflowSource`; the
//! filesystem implementation lives in conductor-infra.

use conductor_types::error::SourceError;
use dashmap::DashMap;

/// Provides the raw declarative text of a workflow by id.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowSource: Send + Sync {
    /// Fetch the definition text for `workflow_id`.
    ///
    /// Returns `SourceError::NotFound` when the source has no entry for the id.
    fn fetch(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<String, SourceError>> + Send;
}

/// Definitions held in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowSource {
    definitions: DashMap<String, String>,
}

impl InMemoryWorkflowSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the YAML text for `workflow_id`.
    pub fn insert(&self, workflow_id: impl Into<String>, yaml: impl Into<String>) {
        self.definitions.insert(workflow_id.into(), yaml.into());
    }

    pub fn remove(&self, workflow_id: &str) -> bool {
        self.definitions.remove(workflow_id).is_some()
    }
}

impl WorkflowSource for InMemoryWorkflowSource {
    async fn fetch(&self, workflow_id: &str) -> Result<String, SourceError> {
        self.definitions
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SourceError::NotFound(workflow_id.to_string()))
    }
}
