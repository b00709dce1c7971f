//! Derivation executor
//!
//! Runs a [`DerivationPlan`] level by level. Within one level the deriver is
//! called for up to `max_parallel` artifacts at once; results are then applied
//! one at a time in plan order, so a downstream artifact always sees the
//! already-updated content of its upstream.
//!
//! A failed artifact never aborts the batch. Its downstream artifacts in the
//! same batch are skipped, and independent siblings carry on.
//!
//! In dry-run mode the deriver is still invoked, but nothing is written, the
//! state is not mutated and the lock is never taken.

use crate::config::ExecutorConfig;
use crate::error::{ExecutionError, TrackerError};
use crate::progress::{emit, ProgressCallback, ProgressEvent};
use crate::state::{write_atomic, DerivationState, StateManager};
use crate::tracker::{DerivationPlan, DerivationStep, ImpactReport, Tracker};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use loom_artifact::{Artifact, ArtifactStatus, ArtifactType, ContentHash, Layer};
use loom_document::{
    begin_generated, extract_manual, replace_section, resolve_location, restore_manual, section_body, ManualRegion,
    END_GENERATED,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Produces new content for one artifact
///
/// `upstream` maps each upstream ID to its current content. Implementations
/// may call out to anything, but must not touch the derivation state.
#[async_trait::async_trait]
pub trait Deriver: Send + Sync {
    /// Generate the artifact's new content
    async fn derive(
        &self,
        artifact: &Artifact,
        upstream: &BTreeMap<String, String>,
        project_dir: &Path,
    ) -> anyhow::Result<String>;
}

#[async_trait::async_trait]
impl<F> Deriver for F
where
    F: Fn(&Artifact, &BTreeMap<String, String>, &Path) -> anyhow::Result<String> + Send + Sync,
{
    async fn derive(
        &self,
        artifact: &Artifact,
        upstream: &BTreeMap<String, String>,
        project_dir: &Path,
    ) -> anyhow::Result<String> {
        self(artifact, upstream, project_dir)
    }
}

/// Stage at which an artifact failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePhase {
    /// Planned artifact missing from state
    Lookup,
    /// Upstream content could not be read
    Upstream,
    /// The deriver returned an error
    Derive,
    /// Output could not be written
    Write,
    /// State could not be updated
    State,
}

/// Per-artifact failure; never aborts the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivationFailure {
    /// Artifact ID
    pub artifact_id: String,
    /// Where it failed
    pub phase: FailurePhase,
    /// Error message, with causes
    pub message: String,
    /// Whether retrying may succeed
    pub recoverable: bool,
}

/// A successfully derived artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedArtifact {
    /// Artifact ID
    pub artifact_id: String,
    /// Artifact layer
    pub layer: Layer,
    /// File the content went to
    pub output_file: PathBuf,
    /// Hash before derivation
    pub old_hash: Option<ContentHash>,
    /// Hash after derivation
    pub new_hash: ContentHash,
    /// Upstream hashes the content was derived from
    pub from_hashes: BTreeMap<String, ContentHash>,
    /// Time spent on this artifact
    pub duration: Duration,
    /// Whether the artifact had manual sections
    pub has_manual: bool,
    /// Manual regions carried into the new content
    pub manual_kept: Vec<String>,
}

/// An artifact left untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedArtifact {
    /// Artifact ID
    pub artifact_id: String,
    /// Why
    pub reason: String,
}

/// Outcome of a derivation batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// The executed plan
    pub plan: DerivationPlan,
    /// Derived artifacts, in plan order
    pub derived: Vec<DerivedArtifact>,
    /// Skipped artifacts
    pub skipped: Vec<SkippedArtifact>,
    /// Failed artifacts
    pub errors: Vec<DerivationFailure>,
    /// Wall time
    pub duration: Duration,
    /// Batch start
    pub started_at: DateTime<Utc>,
    /// Batch end
    pub finished_at: DateTime<Utc>,
    /// Whether the batch ran in dry-run mode
    pub dry_run: bool,
}

impl ExecutionResult {
    /// No artifact failed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// IDs of derived artifacts, in plan order
    #[must_use]
    pub fn derived_ids(&self) -> Vec<&str> {
        self.derived.iter().map(|d| d.artifact_id.as_str()).collect()
    }
}

/// What a batch would do, without doing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPreview {
    /// Steps that would run
    pub plan: DerivationPlan,
    /// Artifacts that would change
    pub impact: ImpactReport,
}

/// One deriver call prepared from state
struct Job {
    step: DerivationStep,
    artifact: Artifact,
    upstream: BTreeMap<String, String>,
    manual: Vec<ManualRegion>,
    started: Instant,
}

/// Mutable bookkeeping of one batch
struct Batch {
    total: usize,
    current: usize,
    derived: Vec<DerivedArtifact>,
    skipped: Vec<SkippedArtifact>,
    errors: Vec<DerivationFailure>,
    /// Content derived in this batch, by artifact ID
    overlay: BTreeMap<String, String>,
    /// Artifacts whose downstream must not run
    blocked: BTreeSet<String>,
    /// Set once the state could not be persisted; later steps are skipped
    halted: bool,
}

/// Runs derivation plans against a state
pub struct Executor {
    config: ExecutorConfig,
    tracker: Tracker,
    deriver: Option<Arc<dyn Deriver>>,
    progress: Option<ProgressCallback>,
    state_manager: Option<Arc<StateManager>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("project_dir", &self.tracker.project_dir())
            .field("has_deriver", &self.deriver.is_some())
            .field("has_progress", &self.progress.is_some())
            .field("has_state_manager", &self.state_manager.is_some())
            .finish()
    }
}

impl Executor {
    /// Executor without a deriver; every step will be skipped until one is set
    #[must_use]
    pub fn new(tracker: Tracker, config: ExecutorConfig) -> Self {
        Self {
            config,
            tracker,
            deriver: None,
            progress: None,
            state_manager: None,
        }
    }

    /// With a deriver
    #[must_use]
    pub fn with_deriver(mut self, deriver: impl Deriver + 'static) -> Self {
        self.deriver = Some(Arc::new(deriver));
        self
    }

    /// With a shared deriver
    #[must_use]
    pub fn with_shared_deriver(mut self, deriver: Arc<dyn Deriver>) -> Self {
        self.deriver = Some(deriver);
        self
    }

    /// With a progress observer
    #[must_use]
    pub fn with_progress(mut self, callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// With a shared progress observer
    #[must_use]
    pub fn with_shared_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Persist through `manager`, holding its lock for each batch
    #[must_use]
    pub fn with_state_manager(mut self, manager: Arc<StateManager>) -> Self {
        self.state_manager = Some(manager);
        self
    }

    /// Executor settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Tracker used for planning
    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    fn project_dir(&self) -> &Path {
        self.tracker.project_dir()
    }

    /// Derive `ids` and everything downstream of them
    ///
    /// # Errors
    /// [`ExecutionError::Plan`] if the plan cannot be built, or a state error
    /// when the lock cannot be taken or the final save fails. Per-artifact
    /// failures are reported in the result instead.
    pub async fn execute<S: AsRef<str>>(
        &self,
        state: &mut DerivationState,
        ids: &[S],
    ) -> Result<ExecutionResult, ExecutionError> {
        let plan = self.tracker.plan_derivation(state, ids)?;
        self.run(state, plan, false).await
    }

    /// Status pass, then derive every stale or new artifact with its downstream
    ///
    /// `last_full_derive` is stamped when nothing failed.
    ///
    /// # Errors
    /// As [`Executor::execute`].
    pub async fn execute_all(&self, state: &mut DerivationState) -> Result<ExecutionResult, ExecutionError> {
        let statuses = self.refresh_statuses(state)?;
        let roots: Vec<&String> = statuses
            .iter()
            .filter(|(_, s)| matches!(s, ArtifactStatus::Stale | ArtifactStatus::New))
            .map(|(id, _)| id)
            .collect();
        let plan = self.tracker.plan_derivation(state, &roots)?;
        self.run(state, plan, true).await
    }

    /// Derive the stale, affected or new artifacts of one layer
    ///
    /// Downstream artifacts in other layers are left for a later run.
    ///
    /// # Errors
    /// As [`Executor::execute`].
    pub async fn execute_layer(
        &self,
        state: &mut DerivationState,
        layer: Layer,
    ) -> Result<ExecutionResult, ExecutionError> {
        let plan = self.restricted_plan(state, |a| a.layer == layer)?;
        self.run(state, plan, false).await
    }

    /// Derive the stale, affected or new artifacts of one type
    ///
    /// # Errors
    /// As [`Executor::execute`].
    pub async fn execute_type(
        &self,
        state: &mut DerivationState,
        artifact_type: ArtifactType,
    ) -> Result<ExecutionResult, ExecutionError> {
        let plan = self.restricted_plan(state, |a| a.artifact_type == artifact_type)?;
        self.run(state, plan, false).await
    }

    /// Plan and impact of deriving `ids`; nothing is executed
    ///
    /// # Errors
    /// [`TrackerError::Graph`] if the closure of `ids` has a cycle.
    pub fn preview_execution<S: AsRef<str>>(
        &self,
        state: &DerivationState,
        ids: &[S],
    ) -> Result<ExecutionPreview, TrackerError> {
        Ok(ExecutionPreview {
            plan: self.tracker.plan_derivation(state, ids)?,
            impact: self.tracker.analyze_impact(state, ids),
        })
    }

    /// Statuses after a status pass; applied to the state unless dry run
    fn refresh_statuses(&self, state: &mut DerivationState) -> Result<BTreeMap<String, ArtifactStatus>, TrackerError> {
        if self.config.dry_run {
            return self.tracker.compute_statuses(state);
        }
        self.tracker.update_statuses(state)?;
        Ok(state.artifacts.iter().map(|(id, a)| (id.clone(), a.status)).collect())
    }

    fn restricted_plan(
        &self,
        state: &mut DerivationState,
        keep: impl Fn(&Artifact) -> bool,
    ) -> Result<DerivationPlan, TrackerError> {
        let statuses = self.refresh_statuses(state)?;
        let ids: Vec<&String> = statuses
            .iter()
            .filter(|(_, s)| matches!(s, ArtifactStatus::Stale | ArtifactStatus::Affected | ArtifactStatus::New))
            .filter(|(id, _)| state.get_artifact(id).is_some_and(&keep))
            .map(|(id, _)| id)
            .collect();
        let plan = self.tracker.plan_derivation(state, &ids)?;
        Ok(plan.filtered(|step| state.get_artifact(&step.artifact_id).is_some_and(&keep)))
    }

    // ------------------------------------------------------------------
    // Batch
    // ------------------------------------------------------------------

    async fn run(
        &self,
        state: &mut DerivationState,
        plan: DerivationPlan,
        full_derive: bool,
    ) -> Result<ExecutionResult, ExecutionError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let dry_run = self.config.dry_run;

        let mut batch = Batch {
            total: plan.total_count,
            current: 0,
            derived: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            overlay: BTreeMap::new(),
            blocked: BTreeSet::new(),
            halted: false,
        };
        tracing::info!(steps = batch.total, dry_run, "starting derivation");
        self.emit(&ProgressEvent::start(batch.total));

        let manager = self.state_manager.as_ref().filter(|_| !dry_run);
        let acquired = match acquire_lock(manager).await {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::error!(error = %e, "could not lock state, nothing derived");
                self.emit(&ProgressEvent::complete(0, 0, 0));
                return Err(e);
            }
        };

        let levels: Vec<Vec<DerivationStep>> = plan
            .levels()
            .into_iter()
            .map(|level| level.into_iter().cloned().collect())
            .collect();
        for level in levels {
            self.run_level(state, level, &mut batch).await;
        }

        let mut outcome = Ok(());
        if let Some(manager) = manager {
            if full_derive && batch.errors.is_empty() {
                state.last_full_derive = Some(Utc::now());
            }
            outcome = manager.save(state);
            if acquired {
                if let Err(e) = manager.unlock() {
                    tracing::warn!(error = %e, "failed to release state lock");
                }
            }
        } else if full_derive && !dry_run && batch.errors.is_empty() {
            state.last_full_derive = Some(Utc::now());
        }

        self.emit(&ProgressEvent::complete(
            batch.derived.len(),
            batch.skipped.len(),
            batch.errors.len(),
        ));
        outcome?;

        Ok(ExecutionResult {
            plan,
            derived: batch.derived,
            skipped: batch.skipped,
            errors: batch.errors,
            duration: start.elapsed(),
            started_at,
            finished_at: Utc::now(),
            dry_run,
        })
    }

    async fn run_level(&self, state: &mut DerivationState, level: Vec<DerivationStep>, batch: &mut Batch) {
        let mut jobs = Vec::with_capacity(level.len());
        for step in level {
            batch.current += 1;
            if let Some(job) = self.prepare(state, step, batch) {
                jobs.push(job);
            }
        }
        let Some(deriver) = self.deriver.clone() else {
            return;
        };
        if jobs.is_empty() {
            return;
        }

        let project_dir = self.project_dir().to_path_buf();
        let outputs: Vec<(Job, anyhow::Result<String>)> = stream::iter(jobs)
            .map(|job| {
                let deriver = Arc::clone(&deriver);
                let project_dir = project_dir.clone();
                async move {
                    let output = deriver.derive(&job.artifact, &job.upstream, &project_dir).await;
                    (job, output)
                }
            })
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await;

        for (job, output) in outputs {
            let id = job.step.artifact_id.clone();
            if batch.halted {
                self.skip(&id, HALTED.to_string(), batch);
                continue;
            }
            let result = match output {
                Ok(content) => self.apply(state, job, content, batch),
                Err(e) => Err(failure(&id, FailurePhase::Derive, format!("{e:#}"), true)),
            };
            match result {
                Ok(derived) => {
                    tracing::info!(
                        artifact = %derived.artifact_id,
                        hash = %derived.new_hash.short(),
                        elapsed_ms = u64::try_from(derived.duration.as_millis()).unwrap_or(u64::MAX),
                        "derived"
                    );
                    batch.derived.push(derived);
                }
                Err(f) => self.fail(f, batch),
            }
        }
    }

    /// Gather inputs for one step, or record why it cannot run
    fn prepare(&self, state: &DerivationState, step: DerivationStep, batch: &mut Batch) -> Option<Job> {
        let id = step.artifact_id.clone();
        let Some(artifact) = state.get_artifact(&id).cloned() else {
            self.fail(
                failure(&id, FailurePhase::Lookup, format!("artifact {id} not found in state"), false),
                batch,
            );
            return None;
        };
        if batch.halted {
            self.skip(&id, HALTED.to_string(), batch);
            return None;
        }
        if self.deriver.is_none() {
            self.skip(&id, "no deriver function configured".to_string(), batch);
            return None;
        }
        if let Some(up) = artifact.upstream_ids().find(|up| batch.blocked.contains(*up)) {
            let reason = format!("upstream {up} failed");
            batch.blocked.insert(id.clone());
            self.skip(&id, reason, batch);
            return None;
        }

        self.emit(&ProgressEvent::step(&id, step.layer, batch.current, batch.total));

        let mut upstream = BTreeMap::new();
        for up in artifact.upstream_ids() {
            let content = match batch.overlay.get(up) {
                Some(content) => Ok(content.clone()),
                None => match state.get_artifact(up) {
                    Some(up_artifact) => self
                        .tracker
                        .hasher()
                        .artifact_content(up_artifact, self.project_dir())
                        .map_err(|e| e.to_string()),
                    None => Err(format!("upstream {up} not found in state")),
                },
            };
            match content {
                Ok(content) => {
                    upstream.insert(up.to_string(), content);
                }
                Err(message) => {
                    self.fail(failure(&id, FailurePhase::Upstream, message, true), batch);
                    return None;
                }
            }
        }

        let manual = if self.config.preserve_manual {
            self.current_manual(&artifact)
        } else {
            Vec::new()
        };

        Some(Job {
            step,
            artifact,
            upstream,
            manual,
            started: Instant::now(),
        })
    }

    /// Manual regions inside the artifact's current generated section
    fn current_manual(&self, artifact: &Artifact) -> Vec<ManualRegion> {
        let Some(anchor) = artifact.location.anchor.as_deref() else {
            return Vec::new();
        };
        resolve_location(artifact, self.project_dir())
            .ok()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|content| section_body(&content, anchor))
            .map(|body| extract_manual(&body))
            .unwrap_or_default()
    }

    /// Write derived content and record it in state
    fn apply(
        &self,
        state: &mut DerivationState,
        job: Job,
        content: String,
        batch: &mut Batch,
    ) -> Result<DerivedArtifact, DerivationFailure> {
        let Job {
            step,
            artifact,
            manual,
            started,
            ..
        } = job;
        let id = step.artifact_id.as_str();

        let (content, manual_kept) = if manual.is_empty() {
            (content, Vec::new())
        } else {
            let restored = restore_manual(&content, &manual);
            let kept = restored.kept();
            (restored.content, kept)
        };

        let output_file = resolve_location(&artifact, self.project_dir())
            .map_err(|e| failure(id, FailurePhase::Write, e.to_string(), false))?;

        let (from_hashes, new_hash) = if self.config.dry_run {
            let from_hashes = artifact
                .upstream_ids()
                .filter_map(|up| {
                    let hash = match batch.overlay.get(up) {
                        Some(content) => Some(self.tracker.hasher().hash_content(content)),
                        None => state.get_artifact(up).and_then(|a| a.content_hash),
                    };
                    hash.map(|h| (up.to_string(), h))
                })
                .collect();
            (from_hashes, self.tracker.hasher().hash_content(&content))
        } else {
            write_output(&output_file, &artifact, &content)
                .map_err(|message| failure(id, FailurePhase::Write, message, true))?;
            let from_hashes = self.tracker.collect_upstream_hashes(state, &artifact);
            self.tracker
                .mark_as_derived(state, id, from_hashes.clone())
                .map_err(|e| failure(id, FailurePhase::State, e.to_string(), false))?;
            let new_hash = state
                .get_artifact(id)
                .and_then(|a| a.content_hash)
                .ok_or_else(|| failure(id, FailurePhase::State, format!("artifact {id} has no hash"), false))?;
            if self.config.persist_each {
                if let Some(manager) = &self.state_manager {
                    if let Err(e) = manager.save(state) {
                        tracing::error!(artifact = %id, error = %e, "failed to persist state, stopping batch");
                        batch.halted = true;
                        return Err(failure(id, FailurePhase::State, format!("failed to persist state: {e}"), true));
                    }
                }
            }
            (from_hashes, new_hash)
        };

        batch.overlay.insert(id.to_string(), content);
        Ok(DerivedArtifact {
            artifact_id: step.artifact_id.clone(),
            layer: step.layer,
            output_file,
            old_hash: artifact.content_hash,
            new_hash,
            from_hashes,
            duration: started.elapsed(),
            has_manual: step.has_manual,
            manual_kept,
        })
    }

    fn skip(&self, id: &str, reason: String, batch: &mut Batch) {
        self.emit(&ProgressEvent::Skip {
            artifact_id: id.to_string(),
            reason: reason.clone(),
        });
        batch.skipped.push(SkippedArtifact {
            artifact_id: id.to_string(),
            reason,
        });
    }

    fn fail(&self, failure: DerivationFailure, batch: &mut Batch) {
        self.emit(&ProgressEvent::Error {
            artifact_id: failure.artifact_id.clone(),
            message: failure.message.clone(),
        });
        batch.blocked.insert(failure.artifact_id.clone());
        batch.errors.push(failure);
    }

    fn emit(&self, event: &ProgressEvent) {
        emit(self.progress.as_ref(), event);
    }
}

const HALTED: &str = "state could not be persisted";

/// Take `manager`'s lock unless it is already held; true when taken here
async fn acquire_lock(manager: Option<&Arc<StateManager>>) -> Result<bool, ExecutionError> {
    match manager {
        Some(manager) if !manager.holds_lock() => {
            let manager = Arc::clone(manager);
            tokio::task::spawn_blocking(move || manager.lock()).await??;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn failure(id: &str, phase: FailurePhase, message: String, recoverable: bool) -> DerivationFailure {
    DerivationFailure {
        artifact_id: id.to_string(),
        phase,
        message,
        recoverable,
    }
}

/// Splice `content` into the artifact's section, or write the whole file
///
/// An anchored artifact always ends up inside its own generated section: a
/// section missing from an existing file is appended, and a missing file is
/// created holding just that section.
fn write_output(path: &Path, artifact: &Artifact, content: &str) -> Result<(), String> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(format!("failed to read {}: {e}", path.display())),
    };
    let text = match (existing, artifact.location.anchor.as_deref()) {
        (Some(text), Some(anchor)) => replace_section(&text, anchor, content).unwrap_or_else(|_| {
            let mut text = text;
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            format!("{text}\n{}", marked_section(artifact, anchor, content))
        }),
        (None, Some(anchor)) => marked_section(artifact, anchor, content),
        (_, None) => content.to_string(),
    };
    write_atomic(path, text.as_bytes()).map_err(|e| e.to_string())
}

fn marked_section(artifact: &Artifact, anchor: &str, content: &str) -> String {
    format!(
        "{}\n{content}\n{END_GENERATED}\n",
        begin_generated(anchor, artifact.artifact_type)
    )
}
