//! Derivation progress events

use loom_artifact::Layer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Observer invoked synchronously for every event
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Progress of a derivation batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Batch started
    Start {
        /// Planned steps
        total: usize,
        /// Human-readable message
        message: String,
    },
    /// About to derive one artifact
    Step {
        /// Artifact ID
        artifact_id: String,
        /// 1-based position
        current: usize,
        /// Planned steps
        total: usize,
        /// Human-readable message
        message: String,
    },
    /// Artifact skipped
    Skip {
        /// Artifact ID
        artifact_id: String,
        /// Why
        reason: String,
    },
    /// Artifact failed
    Error {
        /// Artifact ID
        artifact_id: String,
        /// Failure message
        message: String,
    },
    /// Batch finished
    Complete {
        /// Derived count
        derived: usize,
        /// Skipped count
        skipped: usize,
        /// Failure count
        errors: usize,
        /// Human-readable message
        message: String,
    },
}

impl ProgressEvent {
    pub(crate) fn start(total: usize) -> Self {
        Self::Start {
            total,
            message: format!("Starting derivation of {total} artifacts"),
        }
    }

    pub(crate) fn step(artifact_id: &str, layer: Layer, current: usize, total: usize) -> Self {
        Self::Step {
            artifact_id: artifact_id.to_string(),
            current,
            total,
            message: format!("Deriving {artifact_id} ({layer})"),
        }
    }

    pub(crate) fn complete(derived: usize, skipped: usize, errors: usize) -> Self {
        Self::Complete {
            derived,
            skipped,
            errors,
            message: format!("Derivation complete: {derived} derived, {skipped} skipped, {errors} errors"),
        }
    }

    /// Event kind as serialized in the `type` tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Step { .. } => "step",
            Self::Skip { .. } => "skip",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }

    /// Human-readable description
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Start { message, .. }
            | Self::Step { message, .. }
            | Self::Error { message, .. }
            | Self::Complete { message, .. } => message,
            Self::Skip { reason, .. } => reason,
        }
    }

    /// Artifact the event concerns, if any
    #[must_use]
    pub fn artifact_id(&self) -> Option<&str> {
        match self {
            Self::Step { artifact_id, .. } | Self::Skip { artifact_id, .. } | Self::Error { artifact_id, .. } => {
                Some(artifact_id)
            }
            Self::Start { .. } | Self::Complete { .. } => None,
        }
    }
}

/// Send `event` to tracing and to `callback`
pub(crate) fn emit(callback: Option<&ProgressCallback>, event: &ProgressEvent) {
    match event {
        ProgressEvent::Error { artifact_id, message } => {
            tracing::warn!(artifact = %artifact_id, error = %message, "derivation failed");
        }
        ProgressEvent::Skip { artifact_id, reason } => {
            tracing::info!(artifact = %artifact_id, reason = %reason, "skipped");
        }
        other => tracing::info!(kind = other.kind(), "{}", other.message()),
    }
    if let Some(callback) = callback {
        callback(event);
    }
}
