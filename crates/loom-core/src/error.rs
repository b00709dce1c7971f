//! Error types for loom core
//!
//! Provides error handling for:
//! - State persistence and locking
//! - Status tracking and planning
//! - Derivation batches
//! - Project migration
//! - Configuration loading

use loom_artifact::Layer;
use loom_document::DocumentError;
use loom_graph::GraphError;
use std::path::PathBuf;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// State load/save/lock failed
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Tracking or planning failed
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Derivation batch failed
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// Migration failed
    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Whether the error means the project was never initialized
    #[inline]
    #[must_use]
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Self::State(StateError::NotInitialized(_)))
    }
}

/// State persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// IO error on a specific file
    #[error("io error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// State file is not valid JSON
    #[error("failed to parse state file {path}: {source}")]
    Parse {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: serde_json::Error,
    },

    /// State could not be serialized
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Atomic rename of the temporary state file failed
    #[error("failed to replace {path}: {source}")]
    Persist {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: tempfile::PersistError,
    },

    /// No state file where one is required
    #[error("project not initialized: {0} does not exist")]
    NotInitialized(PathBuf),

    /// Another holder kept the lock past the timeout
    #[error("timed out after {waited_ms}ms waiting for lock {path} (another process may be running)")]
    LockTimeout {
        /// Lock file that stayed held
        path: PathBuf,
        /// How long acquisition waited
        waited_ms: u64,
    },

    /// Artifact ID not present in state
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Edge would derive a lower layer from a higher one
    #[error("cannot derive {to} ({to_layer}) from {from} ({from_layer}): backward layer dependency")]
    BackwardLink {
        /// Upstream artifact ID
        from: String,
        /// Layer of the upstream artifact
        from_layer: Layer,
        /// Downstream artifact ID
        to: String,
        /// Layer of the downstream artifact
        to_layer: Layer,
    },
}

impl StateError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Status tracking errors
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Artifact ID not present in state
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Graph ordering failed
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Reading or hashing a document failed
    #[error("document error: {0}")]
    Document(#[from] DocumentError),
}

/// Errors that abort a derivation batch
///
/// Per-artifact failures never surface here; they are collected in the
/// execution result.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Plan could not be built
    #[error("failed to create derivation plan: {0}")]
    Plan(#[from] TrackerError),

    /// State could not be locked or saved
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// A blocking task was cancelled or panicked
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Migration errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// IO error on a specific file
    #[error("io error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// Directory traversal failed
    #[error("failed to walk {path}: {source}")]
    Walk {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: walkdir::Error,
    },

    /// Document parsing or hashing failed
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// Rewriting a file in place failed
    #[error("failed to write migrated file: {0}")]
    Write(#[from] StateError),
}

impl MigrationError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("io error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::EngineConfig`]
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: toml::de::Error,
    },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_initialized_is_detected() {
        let err = EngineError::from(StateError::NotInitialized(PathBuf::from(".loom/derivation-state.json")));
        assert!(err.is_not_initialized());
        assert!(err.to_string().contains("project not initialized"));
        assert!(!EngineError::from(StateError::ArtifactNotFound("X".into())).is_not_initialized());
    }

    #[test]
    fn backward_link_display() {
        let err = StateError::BackwardLink {
            from: "TC-AC-ORD-001-P01".into(),
            from_layer: Layer::L3,
            to: "AC-ORD-001".into(),
            to_layer: Layer::L1,
        };
        assert_eq!(
            err.to_string(),
            "cannot derive AC-ORD-001 (l1) from TC-AC-ORD-001-P01 (l3): backward layer dependency"
        );
    }

    #[test]
    fn graph_error_converts() {
        let err: TrackerError = GraphError::CycleDetected {
            nodes: vec!["A".into(), "B".into()],
        }
        .into();
        assert!(err.to_string().contains("cycle"));
    }
}
