//! Filesystem workflow source.
//!
//! Definitions live as `{dir}/{workflow_id}.yaml` (or `.yml`). The executor
//! pulls raw text through the `WorkflowSource` port; parsing stays in
//! conductor-core.

use std::path::{Path, PathBuf};

use conductor_core::workflow::{WorkflowError, WorkflowSource, serialize_workflow_yaml};
use conductor_types::config::OrchestratorConfig;
use conductor_types::error::SourceError;
use conductor_types::workflow::WorkflowDefinition;

/// Extensions tried in order when fetching a definition.
const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Reads workflow definitions from a directory.
#[derive(Debug, Clone)]
pub struct FsWorkflowSource {
    dir: PathBuf,
}

impl FsWorkflowSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Source rooted at the configured `workflows_dir`.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.workflows_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path `save_workflow` writes `workflow_id` to.
    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.yaml"))
    }

    /// Write `def` as `{dir}/{id}.yaml`, creating the directory if needed.
    pub async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<PathBuf, WorkflowError> {
        check_id(&def.id)?;
        let io_error = |e: std::io::Error| SourceError::Io {
            id: def.id.clone(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;
        let yaml = serialize_workflow_yaml(def)?;
        let path = self.path_for(&def.id);
        tokio::fs::write(&path, yaml).await.map_err(io_error)?;

        tracing::debug!(workflow_id = def.id.as_str(), path = %path.display(), "workflow saved");
        Ok(path)
    }

    /// Ids of the definition files in the directory, sorted.
    ///
    /// Only the file stem is inspected; contents are not parsed. A missing
    /// directory yields an empty list.
    pub async fn discover_workflows(&self) -> Result<Vec<String>, SourceError> {
        let io_error = |e: std::io::Error| SourceError::Io {
            id: self.dir.display().to_string(),
            reason: e.to_string(),
        };

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            let is_definition = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.contains(&ext));
            if !is_definition {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl WorkflowSource for FsWorkflowSource {
    async fn fetch(&self, workflow_id: &str) -> Result<String, SourceError> {
        check_id(workflow_id)?;

        for ext in EXTENSIONS {
            let path = self.dir.join(format!("{workflow_id}.{ext}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    tracing::debug!(workflow_id, path = %path.display(), "workflow definition read");
                    return Ok(content);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SourceError::Io {
                        id: workflow_id.to_string(),
                        reason: format!("{}: {e}", path.display()),
                    });
                }
            }
        }

        Err(SourceError::NotFound(workflow_id.to_string()))
    }
}

/// Reject ids that would escape the workflows directory.
fn check_id(workflow_id: &str) -> Result<(), SourceError> {
    let invalid = workflow_id.is_empty()
        || workflow_id.starts_with('.')
        || workflow_id.contains(['/', '\\']);
    if invalid {
        return Err(SourceError::Malformed {
            id: workflow_id.to_string(),
            reason: "workflow ids may not be empty, start with '.' or contain path separators"
                .to_string(),
        });
    }
    Ok(())
}
