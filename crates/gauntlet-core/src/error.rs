//! Unified error types for gauntlet

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all gauntlet operations
#[derive(Error, Debug)]
pub enum GauntletError {
    // Git errors
    #[error("Git command failed: {0}")]
    GitCommand(String),

    #[error("Not in a git repository")]
    NotInRepository,

    // Working directory errors
    #[error("Working directory {} resolves outside the repository root {}", .requested, .root.display())]
    PathTraversal { requested: String, root: PathBuf },

    #[error("Working directory does not exist: {0}")]
    WorkdirNotFound(String),

    // Execution errors
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    // Cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    // Document errors
    #[error("Document error: {0}")]
    Document(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl GauntletError {
    /// Rejected input: a bad working directory or configuration
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::PathTraversal { .. } | Self::WorkdirNotFound(_) | Self::Config(_)
        )
    }
}

/// Result type alias using GauntletError
pub type Result<T> = std::result::Result<T, GauntletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_is_usage_error() {
        let err = GauntletError::PathTraversal {
            requested: "../../etc".to_string(),
            root: PathBuf::from("/repo"),
        };
        assert!(err.is_usage_error());
        assert!(err.to_string().contains("../../etc"));
    }

    #[test]
    fn test_cache_and_spawn_errors_are_not_usage_errors() {
        assert!(!GauntletError::Cache("corrupt".to_string()).is_usage_error());
        let spawn = GauntletError::Spawn {
            command: "x".to_string(),
            reason: "not found".to_string(),
        };
        assert!(!spawn.is_usage_error());
    }
}
