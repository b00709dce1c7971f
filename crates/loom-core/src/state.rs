//! Persisted derivation state
//!
//! [`DerivationState`] is the registry of artifacts, decisions, the dependency
//! graph and the file-hash snapshot. [`StateManager`] loads it, replaces it
//! atomically on save and guards mutation with a lock file.

use crate::config::{EngineConfig, LockConfig, DEFAULT_STATE_DIR};
use crate::error::StateError;
use chrono::{DateTime, Utc};
use loom_artifact::{Artifact, ArtifactStatus, ArtifactType, Decision, Layer};
use loom_document::FileHashInfo;
use loom_graph::{DependencyGraph, EdgeType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

/// State file name inside the state directory
pub const STATE_FILE_NAME: &str = "derivation-state.json";

/// Lock file name inside the state directory
pub const LOCK_FILE_NAME: &str = "derivation-state.lock";

/// Current state file format version
pub const STATE_VERSION: &str = "1.0";

/// Complete derivation state of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationState {
    /// State file format version
    pub version: String,
    /// Project name
    pub project: String,
    /// When a full derivation last completed without errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_derive: Option<DateTime<Utc>>,
    /// Version of the engine that last wrote the state
    #[serde(default)]
    pub loom_version: String,
    /// Artifacts by ID
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    /// Decisions by ID
    #[serde(default)]
    pub decisions: BTreeMap<String, Decision>,
    /// Derives edges, persisted as an edge list
    #[serde(default)]
    pub dependency_graph: DependencyGraph,
    /// File-system snapshot used for change detection
    #[serde(default)]
    pub file_hashes: BTreeMap<PathBuf, FileHashInfo>,
}

impl DerivationState {
    /// Empty state for `project`
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.into(),
            last_full_derive: None,
            loom_version: crate::VERSION.to_string(),
            artifacts: BTreeMap::new(),
            decisions: BTreeMap::new(),
            dependency_graph: DependencyGraph::new(),
            file_hashes: BTreeMap::new(),
        }
    }

    /// Artifact by ID
    #[inline]
    #[must_use]
    pub fn get_artifact(&self, id: &str) -> Option<&Artifact> {
        self.artifacts.get(id)
    }

    /// Mutable artifact by ID
    #[inline]
    pub fn get_artifact_mut(&mut self, id: &str) -> Option<&mut Artifact> {
        self.artifacts.get_mut(id)
    }

    /// Insert or replace an artifact, returning the previous one
    pub fn set_artifact(&mut self, artifact: Artifact) -> Option<Artifact> {
        self.artifacts.insert(artifact.id.clone(), artifact)
    }

    /// Remove an artifact and every edge touching it
    pub fn remove_artifact(&mut self, id: &str) -> Option<Artifact> {
        self.dependency_graph.remove_node(id);
        self.artifacts.remove(id)
    }

    /// Decision by ID
    #[inline]
    #[must_use]
    pub fn get_decision(&self, id: &str) -> Option<&Decision> {
        self.decisions.get(id)
    }

    /// Insert or replace a decision
    pub fn set_decision(&mut self, decision: Decision) -> Option<Decision> {
        self.decisions.insert(decision.id.clone(), decision)
    }

    /// Artifacts in `layer`, by ID
    #[must_use]
    pub fn artifacts_by_layer(&self, layer: Layer) -> Vec<&Artifact> {
        self.artifacts.values().filter(|a| a.layer == layer).collect()
    }

    /// Artifacts of `artifact_type`, by ID
    #[must_use]
    pub fn artifacts_by_type(&self, artifact_type: ArtifactType) -> Vec<&Artifact> {
        self.artifacts
            .values()
            .filter(|a| a.artifact_type == artifact_type)
            .collect()
    }

    /// Artifacts with `status`, by ID
    #[must_use]
    pub fn artifacts_by_status(&self, status: ArtifactStatus) -> Vec<&Artifact> {
        self.artifacts.values().filter(|a| a.status == status).collect()
    }

    /// Stale and affected artifacts, by ID
    #[must_use]
    pub fn stale_artifacts(&self) -> Vec<&Artifact> {
        self.artifacts
            .values()
            .filter(|a| matches!(a.status, ArtifactStatus::Stale | ArtifactStatus::Affected))
            .collect()
    }

    /// Cached hash info for a file
    #[inline]
    #[must_use]
    pub fn get_file_hash(&self, path: &Path) -> Option<&FileHashInfo> {
        self.file_hashes.get(path)
    }

    /// Cache hash info under its own path
    pub fn set_file_hash(&mut self, info: FileHashInfo) {
        self.file_hashes.insert(info.path.clone(), info);
    }

    /// Declare that `to` is derived from `from`
    ///
    /// The upstream is recorded without an input hash, so `to` needs
    /// derivation before it is current again.
    ///
    /// # Errors
    /// [`StateError::ArtifactNotFound`] if either ID is unknown,
    /// [`StateError::BackwardLink`] if `from` sits in a higher layer than `to`.
    pub fn link(&mut self, from: &str, to: &str) -> Result<(), StateError> {
        let from_layer = self
            .get_artifact(from)
            .ok_or_else(|| StateError::ArtifactNotFound(from.to_string()))?
            .layer;
        let target = self
            .artifacts
            .get_mut(to)
            .ok_or_else(|| StateError::ArtifactNotFound(to.to_string()))?;
        if from_layer > target.layer {
            return Err(StateError::BackwardLink {
                from: from.to_string(),
                from_layer,
                to: to.to_string(),
                to_layer: target.layer,
            });
        }
        target.upstream.entry(from.to_string()).or_insert(None);
        self.dependency_graph.add_edge(from, to, EdgeType::Derives);
        if let Some(source) = self.artifacts.get_mut(from) {
            if !source.downstream.iter().any(|d| d == to) {
                source.downstream.push(to.to_string());
                source.downstream.sort();
            }
        }
        Ok(())
    }

    /// Rebuild the graph and downstream lists from each artifact's upstream map
    pub fn rebuild_graph(&mut self) {
        self.dependency_graph.build_from_artifacts(
            self.artifacts
                .values()
                .map(|a| (a.id.as_str(), a.upstream.keys().map(String::as_str))),
        );
        let downstream: BTreeMap<String, Vec<String>> = self
            .artifacts
            .keys()
            .map(|id| (id.clone(), self.dependency_graph.get_downstream(id)))
            .collect();
        for (id, ids) in downstream {
            if let Some(artifact) = self.artifacts.get_mut(&id) {
                artifact.downstream = ids;
            }
        }
    }

    /// Per-layer counts and the artifacts needing attention
    #[must_use]
    pub fn status_report(&self) -> StatusReport {
        let mut report = StatusReport {
            project: self.project.clone(),
            last_full_derive: self.last_full_derive,
            total_artifacts: self.artifacts.len(),
            layers: Layer::ALL.iter().map(|l| (*l, LayerStatus::default())).collect(),
            stale: Vec::new(),
            affected: Vec::new(),
            modified: Vec::new(),
        };

        for artifact in self.artifacts.values() {
            let counts = report.layers.entry(artifact.layer).or_default();
            match artifact.status {
                ArtifactStatus::Current => counts.current += 1,
                ArtifactStatus::Stale => {
                    counts.stale += 1;
                    report.stale.push(ArtifactSummary::of(artifact, None));
                }
                ArtifactStatus::Affected => {
                    counts.affected += 1;
                    report.affected.push(ArtifactSummary::of(artifact, None));
                }
                ArtifactStatus::Modified => {
                    counts.modified += 1;
                    let message = format!("manual sections: {}", artifact.manual_sections.join(", "));
                    report.modified.push(ArtifactSummary::of(artifact, Some(message)));
                }
                ArtifactStatus::New => counts.new += 1,
                ArtifactStatus::Orphaned => counts.orphaned += 1,
            }
        }
        report
    }
}

/// Snapshot of project status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Project name
    pub project: String,
    /// When a full derivation last completed
    pub last_full_derive: Option<DateTime<Utc>>,
    /// Artifact count
    pub total_artifacts: usize,
    /// Counts per layer
    pub layers: BTreeMap<Layer, LayerStatus>,
    /// Directly stale artifacts
    pub stale: Vec<ArtifactSummary>,
    /// Transitively affected artifacts
    pub affected: Vec<ArtifactSummary>,
    /// Artifacts with human edits
    pub modified: Vec<ArtifactSummary>,
}

impl StatusReport {
    /// Whether any artifact needs derivation
    #[must_use]
    pub fn needs_action(&self) -> bool {
        self.layers.values().any(|l| l.stale + l.affected + l.new + l.orphaned > 0)
    }
}

/// Status counts for one layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct LayerStatus {
    pub current: usize,
    pub stale: usize,
    pub affected: usize,
    pub modified: usize,
    pub new: usize,
    pub orphaned: usize,
}

impl LayerStatus {
    /// Artifacts in the layer
    #[must_use]
    pub fn total(&self) -> usize {
        self.current + self.stale + self.affected + self.modified + self.new + self.orphaned
    }
}

/// One line of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    /// Artifact ID
    pub id: String,
    /// Artifact type
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// File holding the artifact
    pub location: PathBuf,
    /// Status at report time
    pub status: ArtifactStatus,
    /// Extra detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ArtifactSummary {
    fn of(artifact: &Artifact, message: Option<String>) -> Self {
        Self {
            id: artifact.id.clone(),
            artifact_type: artifact.artifact_type,
            location: artifact.location.file.clone(),
            status: artifact.status,
            message,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    locked_at: DateTime<Utc>,
}

/// Loads, saves and locks the state of one project
#[derive(Debug)]
pub struct StateManager {
    project_dir: PathBuf,
    state_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_config: LockConfig,
    held: Mutex<bool>,
}

impl StateManager {
    /// Manager for `<project_dir>/.loom`
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let state_dir = project_dir.join(DEFAULT_STATE_DIR);
        Self::with_paths(project_dir, state_dir, LockConfig::default())
    }

    /// Manager using the directories and lock timing from `config`
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_paths(config.project_dir.clone(), config.state_path(), config.lock)
    }

    fn with_paths(project_dir: PathBuf, state_dir: PathBuf, lock_config: LockConfig) -> Self {
        Self {
            state_path: state_dir.join(STATE_FILE_NAME),
            lock_path: state_dir.join(LOCK_FILE_NAME),
            project_dir,
            state_dir,
            lock_config,
            held: Mutex::new(false),
        }
    }

    /// With different lock timing
    #[inline]
    #[must_use]
    pub fn with_lock_config(mut self, lock_config: LockConfig) -> Self {
        self.lock_config = lock_config;
        self
    }

    /// Project root
    #[inline]
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// State file path
    #[inline]
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Lock file path
    #[inline]
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Whether a state file exists
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state_path.is_file()
    }

    /// Empty state named after the project directory
    #[must_use]
    pub fn new_state(&self) -> DerivationState {
        let project = self
            .project_dir
            .canonicalize()
            .unwrap_or_else(|_| self.project_dir.clone())
            .file_name()
            .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned());
        DerivationState::new(project)
    }

    /// Load the state; a missing file yields a fresh state
    ///
    /// # Errors
    /// [`StateError::Io`] or [`StateError::Parse`] for an unreadable file.
    pub fn load(&self) -> Result<DerivationState, StateError> {
        if !self.state_path.exists() {
            tracing::debug!(path = %self.state_path.display(), "no state file, starting fresh");
            return Ok(self.new_state());
        }
        let text = std::fs::read_to_string(&self.state_path)
            .map_err(|e| StateError::io_error(&self.state_path, e))?;
        let mut state: DerivationState = serde_json::from_str(&text).map_err(|source| StateError::Parse {
            path: self.state_path.clone(),
            source,
        })?;
        if state.version != STATE_VERSION {
            migrate_state(&mut state);
        }
        tracing::debug!(
            path = %self.state_path.display(),
            artifacts = state.artifacts.len(),
            edges = state.dependency_graph.edge_count(),
            "loaded state"
        );
        Ok(state)
    }

    /// Load the state; fail when the project was never initialized
    ///
    /// # Errors
    /// [`StateError::NotInitialized`] when the file is missing, otherwise as
    /// [`StateManager::load`].
    pub fn load_required(&self) -> Result<DerivationState, StateError> {
        if !self.is_initialized() {
            return Err(StateError::NotInitialized(self.state_path.clone()));
        }
        self.load()
    }

    /// Replace the state file atomically
    ///
    /// The state is written to a temporary file in the same directory and
    /// renamed over the old one.
    ///
    /// # Errors
    /// [`StateError`] on directory creation, write, or rename failure.
    pub fn save(&self, state: &DerivationState) -> Result<(), StateError> {
        let mut json = serde_json::to_vec_pretty(state).map_err(StateError::Serialize)?;
        json.push(b'\n');
        write_atomic(&self.state_path, &json)?;
        tracing::debug!(
            path = %self.state_path.display(),
            artifacts = state.artifacts.len(),
            "saved state"
        );
        Ok(())
    }

    /// Acquire the lock file, waiting up to the configured timeout
    ///
    /// A no-op when this manager already holds the lock. A lock file older
    /// than `stale_after` is removed first.
    ///
    /// # Errors
    /// [`StateError::LockTimeout`] when another holder keeps the lock,
    /// [`StateError::Io`] on other file-system failures.
    pub fn lock(&self) -> Result<(), StateError> {
        let mut held = self.held.lock();
        if *held {
            return Ok(());
        }
        std::fs::create_dir_all(&self.state_dir).map_err(|e| StateError::io_error(&self.state_dir, e))?;
        self.break_stale_lock();

        let info = LockInfo {
            pid: std::process::id(),
            locked_at: Utc::now(),
        };
        let body = serde_json::to_vec(&info).map_err(StateError::Serialize)?;

        let started = Instant::now();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    write_lock_body(&self.lock_path, &mut file, &body)?;
                    *held = true;
                    tracing::debug!(path = %self.lock_path.display(), "acquired state lock");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let waited = started.elapsed();
                    if waited >= self.lock_config.timeout() {
                        return Err(StateError::LockTimeout {
                            path: self.lock_path.clone(),
                            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    std::thread::sleep(self.lock_config.poll_interval());
                }
                Err(e) => return Err(StateError::io_error(&self.lock_path, e)),
            }
        }
    }

    fn break_stale_lock(&self) {
        let age = std::fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        if let Some(age) = age {
            if age > self.lock_config.stale_after() {
                tracing::warn!(
                    path = %self.lock_path.display(),
                    age_secs = age.as_secs(),
                    "breaking stale lock"
                );
                let _ = std::fs::remove_file(&self.lock_path);
            }
        }
    }

    /// Release the lock if this manager holds it
    ///
    /// # Errors
    /// [`StateError::Io`] if the lock file cannot be removed.
    pub fn unlock(&self) -> Result<(), StateError> {
        let mut held = self.held.lock();
        if !*held {
            return Ok(());
        }
        *held = false;
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => {
                tracing::debug!(path = %self.lock_path.display(), "released state lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io_error(&self.lock_path, e)),
        }
    }

    /// Whether the lock file exists, whoever holds it
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_path.exists()
    }

    /// Whether this manager holds the lock
    #[must_use]
    pub fn holds_lock(&self) -> bool {
        *self.held.lock()
    }

    /// Lock for the lifetime of the returned guard
    ///
    /// If the lock was already held, dropping the guard leaves it held.
    ///
    /// # Errors
    /// As [`StateManager::lock`].
    pub fn lock_guard(&self) -> Result<LockGuard<'_>, StateError> {
        let release = !self.holds_lock();
        self.lock()?;
        Ok(LockGuard { manager: self, release })
    }
}

/// Releases the state lock on drop
#[derive(Debug)]
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard<'a> {
    manager: &'a StateManager,
    release: bool,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.release {
            if let Err(e) = self.manager.unlock() {
                tracing::warn!(error = %e, "failed to release state lock");
            }
        }
    }
}

fn migrate_state(state: &mut DerivationState) {
    tracing::info!(from = %state.version, to = STATE_VERSION, "upgrading state file format");
    state.version = STATE_VERSION.to_string();
}

/// Fill a freshly created lock file; on failure the file is removed again
fn write_lock_body(path: &Path, file: &mut impl Write, body: &[u8]) -> Result<(), StateError> {
    if let Err(e) = file.write_all(body).and_then(|()| file.flush()) {
        if let Err(cleanup) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %cleanup, "failed to remove partial lock file");
        }
        return Err(StateError::io_error(path, e));
    }
    Ok(())
}

/// Write `bytes` to `path` through a temporary file and an atomic rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StateError::io_error(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::io_error(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StateError::io_error(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StateError::io_error(tmp.path(), e))?;
    tmp.persist(path).map_err(|source| StateError::Persist {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_artifact::{ContentHash, Location};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn artifact(id: &str, artifact_type: ArtifactType) -> Artifact {
        Artifact::new(id, artifact_type, Location::file("l1/doc.md").with_anchor(id))
            .with_hash(ContentHash::sha256(id.as_bytes()))
    }

    fn fast_locks() -> LockConfig {
        LockConfig {
            timeout_ms: 50,
            stale_after_ms: 300_000,
            poll_interval_ms: 5,
        }
    }

    #[test]
    fn accessors() {
        let mut state = DerivationState::new("shop");
        state.set_artifact(artifact("US-ORD-001", ArtifactType::UserStory));
        state.set_artifact(artifact("AC-ORD-001", ArtifactType::AcceptanceCriteria).with_status(ArtifactStatus::Stale));

        assert_eq!(state.artifacts_by_layer(Layer::L1).len(), 1);
        assert_eq!(state.artifacts_by_status(ArtifactStatus::Stale)[0].id, "AC-ORD-001");
        assert_eq!(state.stale_artifacts().len(), 1);
        assert_eq!(state.artifacts_by_type(ArtifactType::UserStory).len(), 1);

        state.set_decision(Decision::new("DEC-001", Layer::L1, "Currency?", "EUR", "user").affecting("AC-ORD-001"));
        assert_eq!(state.get_decision("DEC-001").unwrap().affects, vec!["AC-ORD-001"]);
    }

    #[test]
    fn link_records_edge_and_rejects_backward_layers() {
        let mut state = DerivationState::new("shop");
        state.set_artifact(artifact("US-ORD-001", ArtifactType::UserStory));
        state.set_artifact(artifact("AC-ORD-001", ArtifactType::AcceptanceCriteria));

        state.link("US-ORD-001", "AC-ORD-001").unwrap();
        assert!(state.dependency_graph.has_edge("US-ORD-001", "AC-ORD-001"));
        assert_eq!(state.get_artifact("AC-ORD-001").unwrap().upstream.get("US-ORD-001"), Some(&None));
        assert_eq!(state.get_artifact("US-ORD-001").unwrap().downstream, vec!["AC-ORD-001"]);

        assert!(matches!(
            state.link("AC-ORD-001", "US-ORD-001"),
            Err(StateError::BackwardLink { .. })
        ));
        assert!(matches!(state.link("US-ORD-001", "BR-X-001"), Err(StateError::ArtifactNotFound(_))));
    }

    #[test]
    fn rebuild_graph_from_upstream_maps() {
        let mut state = DerivationState::new("shop");
        state.set_artifact(artifact("US-ORD-001", ArtifactType::UserStory));
        state.set_artifact(artifact("AC-ORD-001", ArtifactType::AcceptanceCriteria).with_upstream("US-ORD-001", None));
        state.rebuild_graph();
        assert_eq!(state.dependency_graph.get_downstream("US-ORD-001"), vec!["AC-ORD-001"]);
        assert_eq!(state.get_artifact("US-ORD-001").unwrap().downstream, vec!["AC-ORD-001"]);

        state.remove_artifact("US-ORD-001");
        assert_eq!(state.dependency_graph.edge_count(), 0);
    }

    #[test]
    fn status_report_counts_by_layer() {
        let mut state = DerivationState::new("shop");
        state.set_artifact(artifact("US-ORD-001", ArtifactType::UserStory));
        state.set_artifact(artifact("AC-ORD-001", ArtifactType::AcceptanceCriteria).with_status(ArtifactStatus::Stale));
        let mut modified = artifact("AC-ORD-002", ArtifactType::AcceptanceCriteria).with_status(ArtifactStatus::Modified);
        modified.manual_sections = vec!["notes".into()];
        state.set_artifact(modified);

        let report = state.status_report();
        assert_eq!(report.total_artifacts, 3);
        assert_eq!(report.layers[&Layer::L0].current, 1);
        assert_eq!(report.layers[&Layer::L1].total(), 2);
        assert_eq!(report.stale[0].id, "AC-ORD-001");
        assert_eq!(report.modified[0].message.as_deref(), Some("manual sections: notes"));
        assert!(report.needs_action());
    }

    #[test]
    fn missing_state_file_loads_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let state = manager.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.artifacts.is_empty());
        assert!(matches!(manager.load_required(), Err(StateError::NotInitialized(_))));
    }

    #[test]
    fn save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        manager.save(&manager.new_state()).unwrap();
        manager.save(&manager.new_state()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path().join(".loom"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![STATE_FILE_NAME.to_string()]);
    }

    #[test]
    fn old_versions_are_upgraded_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".loom")).unwrap();
        std::fs::write(
            manager.state_path(),
            r#"{"version":"0.9","project":"shop","future_field":true,"dependency_graph":{"edges":[]}}"#,
        )
        .unwrap();
        let state = manager.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.project, "shop");
    }

    #[test]
    fn corrupt_state_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".loom")).unwrap();
        std::fs::write(manager.state_path(), "{not json").unwrap();
        assert!(matches!(manager.load(), Err(StateError::Parse { .. })));
    }

    #[test]
    fn second_manager_times_out_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let first = StateManager::new(dir.path()).with_lock_config(fast_locks());
        let second = StateManager::new(dir.path()).with_lock_config(fast_locks());

        first.lock().unwrap();
        assert!(second.is_locked());
        assert!(matches!(second.lock(), Err(StateError::LockTimeout { .. })));

        first.unlock().unwrap();
        second.lock().unwrap();
        second.unlock().unwrap();
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path()).with_lock_config(LockConfig {
            stale_after_ms: 0,
            ..fast_locks()
        });
        std::fs::create_dir_all(dir.path().join(".loom")).unwrap();
        std::fs::write(manager.lock_path(), "{}").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        manager.lock().unwrap();
        assert!(manager.holds_lock());
        manager.unlock().unwrap();
    }

    #[test]
    fn guard_keeps_an_outer_lock() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        {
            let _guard = manager.lock_guard().unwrap();
            assert!(manager.is_locked());
        }
        assert!(!manager.is_locked());

        manager.lock().unwrap();
        drop(manager.lock_guard().unwrap());
        assert!(manager.is_locked());
        manager.unlock().unwrap();
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_lock_write_leaves_no_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".loom")).unwrap();
        std::fs::write(manager.lock_path(), "").unwrap();

        let err = write_lock_body(manager.lock_path(), &mut FullDisk, b"{}").unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
        assert!(!manager.is_locked());
        manager.lock().unwrap();
        assert!(manager.holds_lock());
        manager.unlock().unwrap();
    }
}
