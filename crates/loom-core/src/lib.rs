//! Loom Core - derivation state and dependency tracking
//!
//! Keeps a persistent, content-hash-addressed graph of specification
//! artifacts and uses it to:
//! - Classify every artifact as current, stale, affected, new, modified or orphaned
//! - Plan the minimal re-derivation in dependency order
//! - Run an injected deriver over that plan, keeping human-edited regions
//! - Persist the state atomically behind a lock file
//! - Migrate unmarked documents into the marker convention
//!
//! # Example
//!
//! ```rust,no_run
//! use loom_core::{Engine, EngineConfig};
//! use loom_artifact::Artifact;
//! use std::collections::BTreeMap;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = Engine::init(EngineConfig::load("my-project")?)?;
//! let report = engine.status()?;
//! println!("{} stale artifacts", report.stale.len());
//!
//! let deriver = |artifact: &Artifact, upstream: &BTreeMap<String, String>, _: &Path| -> anyhow::Result<String> {
//!     Ok(format!("{} derived from {} inputs", artifact.id, upstream.len()))
//! };
//! let result = engine.derive_all(Arc::new(deriver)).await?;
//! println!("derived {}", result.derived.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod migrate;
pub mod progress;
pub mod state;
pub mod tracker;

pub use config::{
    EngineConfig, ExecutorConfig, LockConfig, MigrationConfig, CONFIG_FILE_NAME, DEFAULT_STATE_DIR,
};
pub use engine::Engine;
pub use error::{
    ConfigError, EngineError, ExecutionError, MigrationError, Result, StateError, TrackerError,
};
pub use executor::{
    DerivationFailure, DerivedArtifact, Deriver, ExecutionPreview, ExecutionResult, Executor,
    FailurePhase, SkippedArtifact,
};
pub use migrate::{
    FileMigration, MigrationIssue, MigrationResult, MigrationStatistics, Migrator, ALREADY_MARKED,
    NO_SECTIONS,
};
pub use progress::{ProgressCallback, ProgressEvent};
pub use state::{
    ArtifactSummary, DerivationState, LayerStatus, LockGuard, StateManager, StatusReport,
    LOCK_FILE_NAME, STATE_FILE_NAME, STATE_VERSION,
};
pub use tracker::{
    DerivationPlan, DerivationStep, FileChange, FileChangeKind, GraphIssue, ImpactReport,
    ManualEditWarning, StatusChange, SyncSummary, Tracker,
};

/// Version of loom core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
