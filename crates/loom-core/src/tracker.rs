//! Status tracking
//!
//! One classification rule decides whether an artifact is stale, new or
//! orphaned relative to the current hashes of its upstream artifacts. The
//! status pass applies it in topological order and marks everything
//! downstream of a dirty artifact as affected.

use crate::error::TrackerError;
use crate::state::DerivationState;
use chrono::Utc;
use loom_artifact::{Artifact, ArtifactStatus, ArtifactType, ContentHash, Layer};
use loom_document::{read_document, Hasher, Parser};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

/// Result of checking one artifact against its upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Clean,
    New,
    Stale,
    Orphaned,
}

/// Staleness and impact analysis over a [`DerivationState`]
#[derive(Debug, Clone)]
pub struct Tracker {
    hasher: Hasher,
    project_dir: PathBuf,
}

impl Tracker {
    /// Tracker resolving artifact files under `project_dir`
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, hasher: Hasher) -> Self {
        Self {
            hasher,
            project_dir: project_dir.into(),
        }
    }

    /// Hasher used for artifact content
    #[inline]
    #[must_use]
    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    /// Project root
    #[inline]
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Classify one artifact from recorded and current upstream hashes
    ///
    /// Roots are always clean. A missing upstream means orphaned; no recorded
    /// fingerprint means new; any upstream whose current hash differs from the
    /// recorded one means stale.
    fn classify(state: &DerivationState, artifact: &Artifact) -> Classification {
        if artifact.is_root() {
            return Classification::Clean;
        }
        if artifact.upstream_ids().any(|id| state.get_artifact(id).is_none()) {
            return Classification::Orphaned;
        }
        let recorded = artifact.recorded_fingerprint();
        if recorded.is_empty() {
            return Classification::New;
        }
        let changed = artifact.upstream_ids().any(|id| {
            let current = state.get_artifact(id).and_then(|u| u.content_hash);
            current.is_none() || recorded.get(id).copied() != current
        });
        if changed {
            Classification::Stale
        } else {
            Classification::Clean
        }
    }

    /// Artifacts whose recorded input hashes no longer match their upstream
    ///
    /// Read-only; ordered by layer, then ID.
    #[must_use]
    pub fn detect_stale_artifacts<'s>(&self, state: &'s DerivationState) -> Vec<&'s Artifact> {
        let mut stale: Vec<&Artifact> = state
            .artifacts
            .values()
            .filter(|a| Self::classify(state, a) == Classification::Stale)
            .collect();
        stale.sort_by(|a, b| (a.layer, &a.id).cmp(&(b.layer, &b.id)));
        stale
    }

    /// Status every artifact would have after a status pass, without applying it
    ///
    /// # Errors
    /// [`TrackerError::Graph`] if the dependency graph has a cycle.
    pub fn compute_statuses(&self, state: &DerivationState) -> Result<BTreeMap<String, ArtifactStatus>, TrackerError> {
        let ids: Vec<&str> = state.artifacts.keys().map(String::as_str).collect();
        let order = state.dependency_graph.get_derivation_order(&ids)?;

        let mut statuses: BTreeMap<String, ArtifactStatus> = BTreeMap::new();
        for id in order {
            let Some(artifact) = state.get_artifact(&id) else {
                continue;
            };
            let upstream_dirty = artifact
                .upstream_ids()
                .map(str::to_string)
                .chain(state.dependency_graph.get_upstream(&id))
                .any(|up| statuses.get(&up).is_some_and(|s| s.is_action_required()));

            let status = match Self::classify(state, artifact) {
                Classification::Orphaned => ArtifactStatus::Orphaned,
                Classification::Stale => ArtifactStatus::Stale,
                Classification::New => ArtifactStatus::New,
                Classification::Clean if upstream_dirty => ArtifactStatus::Affected,
                Classification::Clean => match artifact.status {
                    ArtifactStatus::Modified | ArtifactStatus::Orphaned => artifact.status,
                    _ => ArtifactStatus::Current,
                },
            };
            statuses.insert(id, status);
        }
        Ok(statuses)
    }

    /// Recalculate and apply every artifact's status in one pass
    ///
    /// # Errors
    /// [`TrackerError::Graph`] if the dependency graph has a cycle.
    pub fn update_statuses(&self, state: &mut DerivationState) -> Result<Vec<StatusChange>, TrackerError> {
        let statuses = self.compute_statuses(state)?;
        let mut changes = Vec::new();
        for (id, status) in statuses {
            if let Some(artifact) = state.get_artifact_mut(&id) {
                if artifact.status != status {
                    changes.push(StatusChange {
                        artifact_id: id,
                        from: artifact.status,
                        to: status,
                    });
                    artifact.status = status;
                }
            }
        }
        tracing::info!(
            artifacts = state.artifacts.len(),
            changed = changes.len(),
            stale = state.artifacts_by_status(ArtifactStatus::Stale).len(),
            affected = state.artifacts_by_status(ArtifactStatus::Affected).len(),
            "updated statuses"
        );
        Ok(changes)
    }

    /// Stale and new artifacts, the starting points of a full derivation
    #[must_use]
    pub fn derivation_roots(&self, state: &DerivationState) -> Vec<String> {
        state
            .artifacts
            .values()
            .filter(|a| matches!(a.status, ArtifactStatus::Stale | ArtifactStatus::New))
            .map(|a| a.id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Impact and planning
    // ------------------------------------------------------------------

    /// What re-deriving `changed` would touch
    #[must_use]
    pub fn analyze_impact<S: AsRef<str>>(&self, state: &DerivationState, changed: &[S]) -> ImpactReport {
        let graph = &state.dependency_graph;
        let affected: BTreeSet<String> = changed
            .iter()
            .flat_map(|id| graph.get_all_downstream(id.as_ref()))
            .collect();

        let mut affected_by_layer: BTreeMap<Layer, Vec<String>> = BTreeMap::new();
        let mut manual_edit_warnings = Vec::new();
        for id in &affected {
            let Some(artifact) = state.get_artifact(id) else {
                continue;
            };
            affected_by_layer.entry(artifact.layer).or_default().push(id.clone());
            if artifact.has_manual_edits() {
                manual_edit_warnings.push(ManualEditWarning {
                    artifact_id: id.clone(),
                    manual_sections: artifact.manual_sections.clone(),
                    message: format!(
                        "artifact {id} has manual edits in sections: {}",
                        artifact.manual_sections.join(", ")
                    ),
                });
            }
        }

        let derivation_order = graph.get_derivation_order(changed).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "impact analysis without derivation order");
            Vec::new()
        });

        ImpactReport {
            changed_artifacts: changed.iter().map(|s| s.as_ref().to_string()).collect(),
            affected_artifacts: affected.into_iter().collect(),
            affected_by_layer,
            derivation_order,
            manual_edit_warnings,
        }
    }

    /// Ordered steps to re-derive `ids` and everything downstream of them
    ///
    /// # Errors
    /// [`TrackerError::Graph`] if that closure contains a cycle.
    pub fn plan_derivation<S: AsRef<str>>(&self, state: &DerivationState, ids: &[S]) -> Result<DerivationPlan, TrackerError> {
        let levels = state.dependency_graph.get_derivation_levels(ids)?;
        let mut plan = DerivationPlan::default();

        for (depth, level) in levels.into_iter().enumerate() {
            for id in level {
                let Some(artifact) = state.get_artifact(&id) else {
                    plan.warnings.push(format!("artifact {id} in derivation order but not in state"));
                    continue;
                };
                plan.push(DerivationStep {
                    order: 0,
                    artifact_id: id,
                    artifact_type: artifact.artifact_type,
                    layer: artifact.layer,
                    upstream: artifact.upstream_ids().map(str::to_string).collect(),
                    has_manual: artifact.has_manual_edits(),
                    depth,
                });
            }
        }
        tracing::debug!(requested = ids.len(), steps = plan.total_count, "planned derivation");
        Ok(plan)
    }

    // ------------------------------------------------------------------
    // Write paths
    // ------------------------------------------------------------------

    /// Record a successful derivation
    ///
    /// Sets status `current`, stores `upstream_hashes` as the input
    /// fingerprint, stamps the time and rehashes the artifact from its file.
    ///
    /// # Errors
    /// [`TrackerError::ArtifactNotFound`] or a hashing failure.
    pub fn mark_as_derived(
        &self,
        state: &mut DerivationState,
        id: &str,
        upstream_hashes: BTreeMap<String, ContentHash>,
    ) -> Result<(), TrackerError> {
        let artifact = state
            .get_artifact_mut(id)
            .ok_or_else(|| TrackerError::ArtifactNotFound(id.to_string()))?;
        let hash = self.hasher.hash_artifact(artifact, &self.project_dir)?;

        for (up, h) in &upstream_hashes {
            artifact.upstream.insert(up.clone(), Some(*h));
        }
        artifact.derived_from_hashes = upstream_hashes;
        artifact.derived_at = Some(Utc::now());
        artifact.status = ArtifactStatus::Current;
        artifact.content_hash = Some(hash);
        Ok(())
    }

    /// Flag human edits in `sections`
    ///
    /// # Errors
    /// [`TrackerError::ArtifactNotFound`].
    pub fn mark_as_modified(&self, state: &mut DerivationState, id: &str, sections: Vec<String>) -> Result<(), TrackerError> {
        let artifact = state
            .get_artifact_mut(id)
            .ok_or_else(|| TrackerError::ArtifactNotFound(id.to_string()))?;
        artifact.status = ArtifactStatus::Modified;
        artifact.manual_sections = sections;
        Ok(())
    }

    /// Flag an artifact whose sources are gone
    ///
    /// # Errors
    /// [`TrackerError::ArtifactNotFound`].
    pub fn mark_as_orphaned(&self, state: &mut DerivationState, id: &str) -> Result<(), TrackerError> {
        state
            .get_artifact_mut(id)
            .ok_or_else(|| TrackerError::ArtifactNotFound(id.to_string()))?
            .status = ArtifactStatus::Orphaned;
        Ok(())
    }

    /// Current hash of every upstream artifact present in state
    #[must_use]
    pub fn collect_upstream_hashes(&self, state: &DerivationState, artifact: &Artifact) -> BTreeMap<String, ContentHash> {
        artifact
            .upstream_ids()
            .filter_map(|id| {
                state
                    .get_artifact(id)
                    .and_then(|u| u.content_hash)
                    .map(|h| (id.to_string(), h))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    fn artifact_files(state: &DerivationState) -> BTreeSet<PathBuf> {
        state
            .artifacts
            .values()
            .map(|a| a.location.file.clone())
            .filter(|f| !f.as_os_str().is_empty())
            .collect()
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.project_dir.join(file)
        }
    }

    /// Refresh cached file hashes whose size or mtime changed
    ///
    /// Returns the refreshed paths.
    ///
    /// # Errors
    /// [`TrackerError::Document`] on the first unreadable file.
    pub fn update_hash_cache(&self, state: &mut DerivationState) -> Result<Vec<PathBuf>, TrackerError> {
        let mut refreshed = Vec::new();
        for file in Self::artifact_files(state) {
            let resolved = self.resolve(&file);
            if !self.hasher.needs_rehash(&resolved, state.get_file_hash(&file)) {
                continue;
            }
            let mut info = self.hasher.hash_file_with_info(&resolved)?;
            info.path.clone_from(&file);
            state.set_file_hash(info);
            refreshed.push(file);
        }
        Ok(refreshed)
    }

    /// Files whose content differs from the cached snapshot
    #[must_use]
    pub fn detect_file_changes(&self, state: &DerivationState) -> Vec<FileChange> {
        let mut changes = Vec::new();
        for file in Self::artifact_files(state) {
            let cached = state.get_file_hash(&file);
            let resolved = self.resolve(&file);
            if !self.hasher.needs_rehash(&resolved, cached) {
                continue;
            }
            let old_hash = cached.map(|c| c.hash);
            match self.hasher.hash_file(&resolved) {
                Ok(new_hash) if Some(new_hash) == old_hash => {}
                Ok(new_hash) => changes.push(FileChange {
                    path: file,
                    kind: if cached.is_some() {
                        FileChangeKind::Modified
                    } else {
                        FileChangeKind::New
                    },
                    old_hash,
                    new_hash: Some(new_hash),
                    error: None,
                }),
                Err(e) => changes.push(FileChange {
                    path: file,
                    kind: FileChangeKind::Error,
                    old_hash,
                    new_hash: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        changes
    }

    /// Refresh locations, manual sections and hashes from the files on disk
    ///
    /// A current artifact whose content changed becomes `modified`. Artifacts
    /// missing from their file, or whose file cannot be read, become
    /// `orphaned`.
    pub fn sync_from_files(&self, state: &mut DerivationState, parser: &Parser) -> SyncSummary {
        let mut by_file: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for artifact in state.artifacts.values() {
            if !artifact.location.file.as_os_str().is_empty() {
                by_file
                    .entry(artifact.location.file.clone())
                    .or_default()
                    .push(artifact.id.clone());
            }
        }

        let mut summary = SyncSummary::default();
        for (file, ids) in by_file {
            let parsed = read_document(self.resolve(&file))
                .map(|content| parser.parse_content(&content, &file));
            let doc = match parsed {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "artifact file unreadable");
                    for id in ids {
                        self.orphan(state, &id, &mut summary);
                    }
                    continue;
                }
            };

            for id in ids {
                let Some(found) = doc.artifacts.iter().find(|a| a.id == id) else {
                    self.orphan(state, &id, &mut summary);
                    continue;
                };
                let Some(artifact) = state.get_artifact_mut(&id) else {
                    continue;
                };
                artifact.location = found.location.clone();
                artifact.manual_sections.clone_from(&found.manual_sections);
                if artifact.status == ArtifactStatus::Orphaned {
                    artifact.status = ArtifactStatus::Current;
                }
                match self.hasher.hash_artifact(artifact, &self.project_dir) {
                    Ok(hash) if artifact.content_hash != Some(hash) => {
                        if artifact.status == ArtifactStatus::Current {
                            artifact.status = ArtifactStatus::Modified;
                            summary.modified.push(id.clone());
                        }
                        artifact.content_hash = Some(hash);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(artifact = %id, error = %e, "failed to rehash artifact"),
                }
            }
        }
        tracing::info!(
            modified = summary.modified.len(),
            orphaned = summary.orphaned.len(),
            "synchronized state from files"
        );
        summary
    }

    fn orphan(&self, state: &mut DerivationState, id: &str, summary: &mut SyncSummary) {
        if let Some(artifact) = state.get_artifact_mut(id) {
            if artifact.status != ArtifactStatus::Orphaned {
                artifact.status = ArtifactStatus::Orphaned;
                summary.orphaned.push(id.to_string());
            }
        }
    }

    /// Remove orphaned artifacts and their edges
    pub fn cleanup_orphaned(&self, state: &mut DerivationState) -> Vec<String> {
        let orphaned: Vec<String> = state
            .artifacts_by_status(ArtifactStatus::Orphaned)
            .into_iter()
            .map(|a| a.id.clone())
            .collect();
        for id in &orphaned {
            state.remove_artifact(id);
        }
        if !orphaned.is_empty() {
            tracing::info!(removed = orphaned.len(), "removed orphaned artifacts");
        }
        orphaned
    }

    /// Structural problems in the dependency graph
    #[must_use]
    pub fn validate_graph(&self, state: &DerivationState) -> Vec<GraphIssue> {
        let mut issues = Vec::new();
        let cycle = state.dependency_graph.detect_cycle();
        if !cycle.is_empty() {
            issues.push(GraphIssue::Cycle { nodes: cycle });
        }
        for edge in state.dependency_graph.edges() {
            let from = state.get_artifact(&edge.from);
            let to = state.get_artifact(&edge.to);
            for (id, present) in [(&edge.from, from.is_some()), (&edge.to, to.is_some())] {
                if !present {
                    issues.push(GraphIssue::DanglingEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: id.clone(),
                    });
                }
            }
            if let (Some(from), Some(to)) = (from, to) {
                if from.layer > to.layer {
                    issues.push(GraphIssue::BackwardEdge {
                        from: edge.from.clone(),
                        from_layer: from.layer,
                        to: edge.to.clone(),
                        to_layer: to.layer,
                    });
                }
            }
        }
        issues
    }
}

/// One status transition applied by a status pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Artifact ID
    pub artifact_id: String,
    /// Status before the pass
    pub from: ArtifactStatus,
    /// Status after the pass
    pub to: ArtifactStatus,
}

/// Impact of re-deriving a set of artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactReport {
    /// The input IDs
    pub changed_artifacts: Vec<String>,
    /// Full downstream closure of the input, sorted
    pub affected_artifacts: Vec<String>,
    /// Affected artifacts grouped by layer
    pub affected_by_layer: BTreeMap<Layer, Vec<String>>,
    /// Order in which the input and its closure must be re-derived
    pub derivation_order: Vec<String>,
    /// Affected artifacts that carry human edits
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual_edit_warnings: Vec<ManualEditWarning>,
}

/// Warning that regeneration touches human-edited content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualEditWarning {
    /// Artifact ID
    pub artifact_id: String,
    /// Edited regions
    pub manual_sections: Vec<String>,
    /// Human-readable message
    pub message: String,
}

/// Ordered derivation steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationPlan {
    /// Steps in topological order
    pub steps: Vec<DerivationStep>,
    /// Number of steps
    pub total_count: usize,
    /// Steps per layer
    pub by_layer: BTreeMap<Layer, usize>,
    /// Planning warnings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl DerivationPlan {
    fn push(&mut self, mut step: DerivationStep) {
        self.total_count += 1;
        step.order = self.total_count;
        *self.by_layer.entry(step.layer).or_default() += 1;
        self.steps.push(step);
    }

    /// Whether there is nothing to derive
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep only steps matching `keep`, renumbering the rest
    #[must_use]
    pub fn filtered(self, keep: impl Fn(&DerivationStep) -> bool) -> Self {
        let mut plan = Self {
            warnings: self.warnings,
            ..Self::default()
        };
        for step in self.steps.into_iter().filter(|s| keep(s)) {
            plan.push(step);
        }
        plan
    }

    /// Steps grouped by depth; each group only depends on earlier groups
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<&DerivationStep>> {
        let mut levels: Vec<Vec<&DerivationStep>> = Vec::new();
        for step in &self.steps {
            if levels.last().and_then(|l| l.first()).map(|s| s.depth) != Some(step.depth) {
                levels.push(Vec::new());
            }
            if let Some(level) = levels.last_mut() {
                level.push(step);
            }
        }
        levels
    }
}

/// One artifact to derive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationStep {
    /// Position in the plan (1-based)
    pub order: usize,
    /// Artifact ID
    pub artifact_id: String,
    /// Artifact type
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Artifact layer
    pub layer: Layer,
    /// Upstream IDs, sorted
    pub upstream: Vec<String>,
    /// Whether the artifact has manual sections
    pub has_manual: bool,
    /// Topological depth within the plan
    pub depth: usize,
}

/// How a file differs from the cached snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    /// Not in the snapshot
    New,
    /// Content hash differs
    Modified,
    /// Could not be hashed
    Error,
}

/// A detected file change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path as recorded in artifact locations
    pub path: PathBuf,
    /// Kind of change
    #[serde(rename = "change_type")]
    pub kind: FileChangeKind,
    /// Cached hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_hash: Option<ContentHash>,
    /// Current hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<ContentHash>,
    /// Hashing error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of [`Tracker::sync_from_files`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Artifacts that became modified
    pub modified: Vec<String>,
    /// Artifacts that became orphaned
    pub orphaned: Vec<String>,
}

/// Structural problem in the dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphIssue {
    /// Nodes on a cycle
    Cycle {
        /// Nodes on the cycle, sorted
        nodes: Vec<String>,
    },
    /// Edge endpoint absent from state
    DanglingEdge {
        /// Edge source
        from: String,
        /// Edge target
        to: String,
        /// The missing endpoint
        missing: String,
    },
    /// Edge from a higher layer to a lower one
    BackwardEdge {
        /// Edge source
        from: String,
        /// Source layer
        from_layer: Layer,
        /// Edge target
        to: String,
        /// Target layer
        to_layer: Layer,
    },
}

impl Display for GraphIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle { nodes } => write!(f, "dependency cycle detected: {}", nodes.join(" -> ")),
            Self::DanglingEdge { from, to, missing } => {
                write!(f, "edge {from} -> {to} references missing artifact {missing}")
            }
            Self::BackwardEdge {
                from,
                from_layer,
                to,
                to_layer,
            } => write!(f, "edge {from} ({from_layer}) -> {to} ({to_layer}) derives a lower layer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_artifact::Location;
    use loom_document::{begin_generated, begin_manual, END_GENERATED, END_MANUAL};
    use loom_graph::EdgeType;
    use pretty_assertions::assert_eq;

    fn hash(s: &str) -> ContentHash {
        ContentHash::sha256(s.as_bytes())
    }

    /// US-ORD-001 -> AC-ORD-001 -> TS-ORD-001, all derived from the hashes now in state
    fn chain() -> DerivationState {
        let mut state = DerivationState::new("shop");
        state.set_artifact(Artifact::new("US-ORD-001", ArtifactType::UserStory, Location::file("l0/us.md")).with_hash(hash("us")));
        state.set_artifact(
            Artifact::new("AC-ORD-001", ArtifactType::AcceptanceCriteria, Location::file("l1/ac.md"))
                .with_hash(hash("ac"))
                .with_upstream("US-ORD-001", Some(hash("us"))),
        );
        state.set_artifact(
            Artifact::new("TS-ORD-001", ArtifactType::TechSpec, Location::file("l2/ts.md"))
                .with_hash(hash("ts"))
                .with_upstream("AC-ORD-001", Some(hash("ac"))),
        );
        state.rebuild_graph();
        state
    }

    fn tracker() -> Tracker {
        Tracker::new(".", Hasher::default())
    }

    fn status(state: &DerivationState, id: &str) -> ArtifactStatus {
        state.get_artifact(id).unwrap().status
    }

    #[test]
    fn unchanged_chain_stays_current() {
        let mut state = chain();
        let changes = tracker().update_statuses(&mut state).unwrap();
        assert!(changes.is_empty());
        assert!(tracker().detect_stale_artifacts(&state).is_empty());
    }

    #[test]
    fn change_propagates_stale_then_affected() {
        let mut state = chain();
        state.get_artifact_mut("US-ORD-001").unwrap().content_hash = Some(hash("us v2"));

        let stale: Vec<_> = tracker().detect_stale_artifacts(&state).iter().map(|a| a.id.clone()).collect();
        assert_eq!(stale, vec!["AC-ORD-001"]);

        tracker().update_statuses(&mut state).unwrap();
        assert_eq!(status(&state, "US-ORD-001"), ArtifactStatus::Current);
        assert_eq!(status(&state, "AC-ORD-001"), ArtifactStatus::Stale);
        assert_eq!(status(&state, "TS-ORD-001"), ArtifactStatus::Affected);
        assert_eq!(tracker().derivation_roots(&state), vec!["AC-ORD-001"]);
    }

    #[test]
    fn never_derived_is_new_and_missing_upstream_is_orphaned() {
        let mut state = chain();
        state.set_artifact(
            Artifact::new("BR-ORD-001", ArtifactType::BusinessRule, Location::file("l1/br.md")).with_upstream("US-ORD-001", None),
        );
        state.set_artifact(
            Artifact::new("BR-ORD-002", ArtifactType::BusinessRule, Location::file("l1/br.md")).with_upstream("US-GONE-001", Some(hash("x"))),
        );
        state.rebuild_graph();
        tracker().update_statuses(&mut state).unwrap();
        assert_eq!(status(&state, "BR-ORD-001"), ArtifactStatus::New);
        assert_eq!(status(&state, "BR-ORD-002"), ArtifactStatus::Orphaned);
    }

    #[test]
    fn modified_survives_unless_upstream_changes() {
        let mut state = chain();
        tracker().mark_as_modified(&mut state, "TS-ORD-001", vec!["notes".into()]).unwrap();
        tracker().update_statuses(&mut state).unwrap();
        assert_eq!(status(&state, "TS-ORD-001"), ArtifactStatus::Modified);

        state.get_artifact_mut("US-ORD-001").unwrap().content_hash = Some(hash("us v2"));
        tracker().update_statuses(&mut state).unwrap();
        assert_eq!(status(&state, "TS-ORD-001"), ArtifactStatus::Affected);
    }

    #[test]
    fn derived_from_hashes_take_precedence() {
        let mut state = chain();
        let ac = state.get_artifact_mut("AC-ORD-001").unwrap();
        ac.derived_from_hashes.insert("US-ORD-001".into(), hash("old"));
        assert_eq!(tracker().detect_stale_artifacts(&state).len(), 1);
    }

    #[test]
    fn cycle_fails_the_status_pass() {
        let mut state = chain();
        state.dependency_graph.add_edge("TS-ORD-001", "US-ORD-001", EdgeType::Derives);
        assert!(matches!(tracker().update_statuses(&mut state), Err(TrackerError::Graph(_))));
    }

    #[test]
    fn impact_lists_closure_and_manual_warnings() {
        let mut state = chain();
        state.get_artifact_mut("TS-ORD-001").unwrap().manual_sections = vec!["notes".into()];
        let report = tracker().analyze_impact(&state, &["US-ORD-001"]);
        assert_eq!(report.changed_artifacts, vec!["US-ORD-001"]);
        assert_eq!(report.affected_artifacts, vec!["AC-ORD-001", "TS-ORD-001"]);
        assert_eq!(report.affected_by_layer[&Layer::L2], vec!["TS-ORD-001"]);
        assert_eq!(report.derivation_order, vec!["US-ORD-001", "AC-ORD-001", "TS-ORD-001"]);
        assert_eq!(report.manual_edit_warnings.len(), 1);
        assert_eq!(report.manual_edit_warnings[0].artifact_id, "TS-ORD-001");
    }

    #[test]
    fn plan_orders_and_annotates_steps() {
        let mut state = chain();
        state.get_artifact_mut("TS-ORD-001").unwrap().manual_sections = vec!["notes".into()];
        let plan = tracker().plan_derivation(&state, &["AC-ORD-001"]).unwrap();
        let ids: Vec<_> = plan.steps.iter().map(|s| s.artifact_id.as_str()).collect();
        assert_eq!(ids, vec!["AC-ORD-001", "TS-ORD-001"]);
        assert_eq!(plan.steps[1].order, 2);
        assert_eq!(plan.steps[1].upstream, vec!["AC-ORD-001"]);
        assert!(plan.steps[1].has_manual);
        assert_eq!(plan.by_layer[&Layer::L1], 1);
        assert_eq!(plan.levels().len(), 2);

        let only_l2 = plan.filtered(|s| s.layer == Layer::L2);
        assert_eq!(only_l2.total_count, 1);
        assert_eq!(only_l2.steps[0].order, 1);
    }

    #[test]
    fn plan_warns_about_unknown_ids() {
        let state = chain();
        let plan = tracker().plan_derivation(&state, &["AC-NONE-001"]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn graph_validation_reports_all_issue_kinds() {
        let mut state = chain();
        state.dependency_graph.add_edge("AC-ORD-001", "API-GONE-001", EdgeType::Derives);
        state.dependency_graph.add_edge("TS-ORD-001", "US-ORD-001", EdgeType::Derives);
        let issues = tracker().validate_graph(&state);
        assert!(issues.iter().any(|i| matches!(i, GraphIssue::Cycle { .. })));
        assert!(issues.iter().any(|i| matches!(i, GraphIssue::DanglingEdge { missing, .. } if missing == "API-GONE-001")));
        assert!(issues.iter().any(|i| matches!(i, GraphIssue::BackwardEdge { from, .. } if from == "TS-ORD-001")));
    }

    #[test]
    fn mark_as_derived_rehashes_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("l1")).unwrap();
        std::fs::write(
            dir.path().join("l1/ac.md"),
            format!("{}\nfresh\n{END_GENERATED}\n", begin_generated("AC-ORD-001", ArtifactType::AcceptanceCriteria)),
        )
        .unwrap();
        let tracker = Tracker::new(dir.path(), Hasher::default());
        let mut state = chain();
        state.get_artifact_mut("AC-ORD-001").unwrap().location = Location::file("l1/ac.md").with_anchor("AC-ORD-001");

        let inputs: BTreeMap<String, ContentHash> = [("US-ORD-001".to_string(), hash("us v2"))].into_iter().collect();
        tracker.mark_as_derived(&mut state, "AC-ORD-001", inputs.clone()).unwrap();

        let ac = state.get_artifact("AC-ORD-001").unwrap();
        assert_eq!(ac.status, ArtifactStatus::Current);
        assert_eq!(ac.content_hash, Some(hash("fresh")));
        assert_eq!(ac.derived_from_hashes, inputs);
        assert_eq!(ac.upstream["US-ORD-001"], Some(hash("us v2")));
        assert!(ac.derived_at.is_some());
        assert!(matches!(
            tracker.mark_as_derived(&mut state, "AC-NONE-001", BTreeMap::new()),
            Err(TrackerError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn file_changes_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("l1")).unwrap();
        let path = dir.path().join("l1/ac.md");
        let write = |body: &str| {
            std::fs::write(
                &path,
                format!(
                    "{}\n{body}\n{}\nmine\n{END_MANUAL}\n{END_GENERATED}\n",
                    begin_generated("AC-ORD-001", ArtifactType::AcceptanceCriteria),
                    begin_manual("notes")
                ),
            )
            .unwrap();
        };
        write("first");

        let tracker = Tracker::new(dir.path(), Hasher::default());
        let mut state = DerivationState::new("shop");
        state.set_artifact(Artifact::new("AC-ORD-001", ArtifactType::AcceptanceCriteria, Location::file("l1/ac.md").with_anchor("AC-ORD-001")));
        state.set_artifact(Artifact::new("AC-ORD-002", ArtifactType::AcceptanceCriteria, Location::file("l1/ac.md")));

        let changes = tracker.detect_file_changes(&state);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, FileChangeKind::New);
        assert_eq!(tracker.update_hash_cache(&mut state).unwrap(), vec![PathBuf::from("l1/ac.md")]);
        assert!(tracker.detect_file_changes(&state).is_empty());

        let summary = tracker.sync_from_files(&mut state, &Parser::default());
        assert_eq!(summary.modified, vec!["AC-ORD-001"]);
        assert_eq!(summary.orphaned, vec!["AC-ORD-002"]);
        let ac = state.get_artifact("AC-ORD-001").unwrap();
        assert_eq!(ac.manual_sections, vec!["notes"]);
        assert_eq!(ac.location.line_start, Some(1));

        assert_eq!(tracker.cleanup_orphaned(&mut state), vec!["AC-ORD-002"]);
        assert!(state.get_artifact("AC-ORD-002").is_none());
    }
}
