//! Engine facade
//!
//! Wires configuration, the state manager, tracker, executor and migrator
//! together for one project.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::executor::{Deriver, ExecutionPreview, ExecutionResult, Executor};
use crate::migrate::{MigrationResult, Migrator};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::state::{DerivationState, StateManager, StatusReport};
use crate::tracker::{StatusChange, SyncSummary, Tracker};
use loom_document::{Hasher, Parser};
use std::sync::Arc;

/// One project's derivation engine
pub struct Engine {
    config: EngineConfig,
    manager: Arc<StateManager>,
    tracker: Tracker,
    state: DerivationState,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("state_path", &self.manager.state_path())
            .field("artifacts", &self.state.artifacts.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    fn with_state(config: EngineConfig, manager: StateManager, state: DerivationState) -> Self {
        let tracker = Tracker::new(config.project_dir.clone(), Hasher::new(config.hasher.clone()));
        Self {
            config,
            manager: Arc::new(manager),
            tracker,
            state,
            progress: None,
        }
    }

    /// Load existing state, or create and save a fresh one
    ///
    /// # Errors
    /// State file unreadable or unwritable.
    pub fn init(config: EngineConfig) -> Result<Self> {
        let manager = StateManager::from_config(&config);
        let state = manager.load()?;
        if !manager.is_initialized() {
            let _guard = manager.lock_guard()?;
            manager.save(&state)?;
            tracing::info!(path = %manager.state_path().display(), "initialized project");
        }
        Ok(Self::with_state(config, manager, state))
    }

    /// Open an initialized project
    ///
    /// # Errors
    /// [`crate::StateError::NotInitialized`] when there is no state file.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let manager = StateManager::from_config(&config);
        let state = manager.load_required()?;
        Ok(Self::with_state(config, manager, state))
    }

    /// With a progress observer for derivation batches
    #[must_use]
    pub fn with_progress(mut self, callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// In-memory state
    pub fn state(&self) -> &DerivationState {
        &self.state
    }

    /// Mutable in-memory state; call [`Engine::save`] to persist edits
    pub fn state_mut(&mut self) -> &mut DerivationState {
        &mut self.state
    }

    /// Tracker bound to the project directory
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Manager owning the state file and its lock
    pub fn state_manager(&self) -> &StateManager {
        &self.manager
    }

    /// Persist the in-memory state while holding the state lock
    ///
    /// # Errors
    /// Lock timeout, or see [`StateManager::save`].
    pub fn save(&self) -> Result<()> {
        let _guard = self.manager.lock_guard()?;
        Ok(self.manager.save(&self.state)?)
    }

    /// Run a status pass, save it and report
    ///
    /// # Errors
    /// Graph cycle or save failure.
    pub fn status(&mut self) -> Result<StatusReport> {
        let changes: Vec<StatusChange> = self.tracker.update_statuses(&mut self.state)?;
        if !changes.is_empty() && !self.config.executor.dry_run {
            self.save()?;
        }
        Ok(self.state.status_report())
    }

    /// Plan and impact of re-deriving `ids`
    ///
    /// # Errors
    /// Graph cycle within the closure of `ids`.
    pub fn preview<S: AsRef<str>>(&self, ids: &[S]) -> Result<ExecutionPreview> {
        Ok(self.executor(None).preview_execution(&self.state, ids)?)
    }

    /// Re-derive `ids` and their downstream
    ///
    /// # Errors
    /// See [`Executor::execute`].
    pub async fn derive<S: AsRef<str>>(&mut self, ids: &[S], deriver: Arc<dyn Deriver>) -> Result<ExecutionResult> {
        let executor = self.executor(Some(deriver));
        Ok(executor.execute(&mut self.state, ids).await?)
    }

    /// Re-derive everything stale or new
    ///
    /// # Errors
    /// See [`Executor::execute_all`].
    pub async fn derive_all(&mut self, deriver: Arc<dyn Deriver>) -> Result<ExecutionResult> {
        let executor = self.executor(Some(deriver));
        Ok(executor.execute_all(&mut self.state).await?)
    }

    /// Add markers to the project's documents and adopt the resulting state
    ///
    /// In dry run the current state is kept and nothing is written.
    ///
    /// # Errors
    /// Project directory missing or state save failure.
    pub fn migrate(&mut self) -> Result<MigrationResult> {
        let result = Migrator::from_config(&self.config).migrate_project(&self.config.project_dir)?;
        if let Some(state) = &result.created_state {
            let _guard = self.manager.lock_guard()?;
            self.manager.save(state)?;
            self.state = state.clone();
        }
        Ok(result)
    }

    /// Refresh the state from the documents on disk and save it
    ///
    /// # Errors
    /// Hash cache or save failure.
    pub fn sync(&mut self) -> Result<SyncSummary> {
        let parser = Parser::new(self.config.parser.clone());
        let summary = self.tracker.sync_from_files(&mut self.state, &parser);
        self.tracker.update_hash_cache(&mut self.state)?;
        if !self.config.executor.dry_run {
            self.save()?;
        }
        Ok(summary)
    }

    fn executor(&self, deriver: Option<Arc<dyn Deriver>>) -> Executor {
        let mut executor = Executor::new(self.tracker.clone(), self.config.executor.clone())
            .with_state_manager(Arc::clone(&self.manager));
        if let Some(deriver) = deriver {
            executor = executor.with_shared_deriver(deriver);
        }
        if let Some(progress) = &self.progress {
            executor = executor.with_shared_progress(Arc::clone(progress));
        }
        executor
    }
}
