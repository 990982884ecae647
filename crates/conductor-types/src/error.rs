use thiserror::Error;

/// Errors from a workflow source (used by the `WorkflowSource` port in conductor-core).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("failed to read workflow '{id}': {reason}")]
    Io { id: String, reason: String },

    #[error("workflow '{id}' is malformed: {reason}")]
    Malformed { id: String, reason: String },
}

impl SourceError {
    /// Whether the source simply has no definition for the id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::NotFound("release".to_string());
        assert_eq!(err.to_string(), "workflow 'release' not found");
        assert!(err.is_not_found());

        let err = SourceError::Io {
            id: "release".to_string(),
            reason: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("permission denied"));
        assert!(!err.is_not_found());
    }
}
