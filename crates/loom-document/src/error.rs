//! Error types for document handling
//!
//! Covers reading, hashing and rewriting marked-up documents.

use std::path::PathBuf;

/// Errors from document I/O and section edits
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// IO error on a specific file
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory traversal failed
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// Artifact has no usable file location
    #[error("artifact {0} has no file location")]
    NoLocation(String),

    /// No generated section with this ID in the document
    #[error("section not found: {0}")]
    SectionNotFound(String),
}

impl DocumentError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for document operations
pub type DocumentResult<T> = Result<T, DocumentError>;
