//! Migration of unmarked projects
//!
//! Finds ID headings in existing specification documents, wraps each section
//! in generated-region markers and builds a first derivation state from what
//! it found. Section text is kept byte for byte; only marker lines are added.

use crate::config::{EngineConfig, MigrationConfig};
use crate::error::MigrationError;
use crate::state::{write_atomic, DerivationState};
use chrono::Utc;
use loom_artifact::{extract_ids, Artifact, ArtifactStatus, ContentHash, Layer};
use loom_document::{
    begin_generated, has_markers, heading_sections, is_document, HeadingSection, Hasher, ParsedDocument, Parser,
    Severity, END_GENERATED,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Skip reason for files that were migrated before
pub const ALREADY_MARKED: &str = "already has markers";

/// Skip reason for files without ID headings
pub const NO_SECTIONS: &str = "no artifact sections found";

/// Outcome for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMigration {
    /// Path relative to the project
    pub path: PathBuf,
    /// Whether markers were (or in dry run, would be) inserted
    pub migrated: bool,
    /// Why the file was left alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Artifact IDs found in the file
    pub artifacts: Vec<String>,
    /// Marker lines inserted
    pub markers_added: usize,
    /// Copy taken before rewriting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

/// Problem with one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationIssue {
    /// Offending file
    pub file: PathBuf,
    /// What went wrong
    pub message: String,
    /// Whether the rest of the migration could go on
    pub recoverable: bool,
}

/// Migration counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatistics {
    /// Document files found
    pub files_scanned: usize,
    /// Files that received markers
    pub files_migrated: usize,
    /// Files left alone or failed
    pub files_skipped: usize,
    /// Distinct artifacts
    pub artifacts_found: usize,
    /// Marker lines inserted
    pub markers_added: usize,
    /// Wall time
    pub duration: Duration,
}

/// Outcome of [`Migrator::migrate_project`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationResult {
    /// Project root
    pub project_dir: PathBuf,
    /// Whether files were left untouched
    pub dry_run: bool,
    /// Per-file outcomes, in scan order
    pub files: Vec<FileMigration>,
    /// Files that received markers
    pub migrated_files: Vec<PathBuf>,
    /// Every artifact found, sorted by ID
    pub discovered_artifacts: Vec<Artifact>,
    /// Fresh state; `None` in dry run
    pub created_state: Option<DerivationState>,
    /// Per-file failures
    pub errors: Vec<MigrationIssue>,
    /// Non-fatal observations
    pub warnings: Vec<String>,
    /// Counters
    pub statistics: MigrationStatistics,
}

impl MigrationResult {
    fn new(project_dir: &Path, dry_run: bool) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            dry_run,
            files: Vec::new(),
            migrated_files: Vec::new(),
            discovered_artifacts: Vec::new(),
            created_state: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            statistics: MigrationStatistics::default(),
        }
    }

    /// Whether no file failed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Adds markers to existing documents and seeds the derivation state
#[derive(Debug, Clone, Default)]
pub struct Migrator {
    config: MigrationConfig,
    parser: Parser,
    hasher: Hasher,
}

impl Migrator {
    /// Migrator with explicit parts
    pub fn new(config: MigrationConfig, parser: Parser, hasher: Hasher) -> Self {
        Self { config, parser, hasher }
    }

    /// Migrator built from an engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.migration.clone(),
            Parser::new(config.parser.clone()),
            Hasher::new(config.hasher.clone()),
        )
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Add markers to one file
    ///
    /// `path` is relative to `project_dir` or absolute. Files that already
    /// carry markers, or have no ID headings, are skipped with a reason.
    ///
    /// # Errors
    /// [`MigrationError`] when the file cannot be read, backed up or written.
    pub fn migrate_file(&self, project_dir: &Path, path: &Path) -> Result<FileMigration, MigrationError> {
        Ok(self.migrate_file_in(project_dir, path)?.0)
    }

    fn migrate_file_in(
        &self,
        project_dir: &Path,
        path: &Path,
    ) -> Result<(FileMigration, ParsedDocument), MigrationError> {
        let (abs, rel) = split_path(project_dir, path);
        let content = std::fs::read_to_string(&abs).map_err(|e| MigrationError::io_error(&abs, e))?;
        let (doc, marked, markers_added) = self.marked_document(&content, &rel);

        let mut outcome = FileMigration {
            path: rel.clone(),
            migrated: marked.is_some(),
            skip_reason: None,
            artifacts: doc.artifacts.iter().map(|a| a.id.clone()).collect(),
            markers_added,
            backup_path: None,
        };

        let Some(marked) = marked else {
            let reason = if has_markers(&content) { ALREADY_MARKED } else { NO_SECTIONS };
            tracing::debug!(path = %rel.display(), reason, "skipping file");
            outcome.skip_reason = Some(reason.to_string());
            return Ok((outcome, doc));
        };

        if self.config.dry_run {
            tracing::info!(path = %rel.display(), markers = markers_added, "would migrate file");
            return Ok((outcome, doc));
        }

        if let Some(backup_dir) = &self.config.backup_dir {
            let backup = backup_path(&project_dir.join(backup_dir), &rel);
            if let Some(parent) = backup.parent() {
                std::fs::create_dir_all(parent).map_err(|e| MigrationError::io_error(parent, e))?;
            }
            std::fs::copy(&abs, &backup).map_err(|e| MigrationError::io_error(&backup, e))?;
            outcome.backup_path = Some(backup);
        }
        write_atomic(&abs, marked.as_bytes())?;
        tracing::info!(path = %rel.display(), markers = markers_added, "migrated file");
        Ok((outcome, doc))
    }

    /// Parse `content` as it would look after migration
    ///
    /// Returns the document, the rewritten text when markers were inserted,
    /// and the number of marker lines added.
    fn marked_document(&self, content: &str, rel: &Path) -> (ParsedDocument, Option<String>, usize) {
        if has_markers(content) {
            return (self.parser.parse_content(content, rel), None, 0);
        }
        let sections = heading_sections(content);
        if sections.is_empty() {
            return (self.parser.parse_content(content, rel), None, 0);
        }
        let marked = insert_markers(content, &sections);
        let doc = self.parser.parse_content(&marked, rel);
        (doc, Some(marked), sections.len() * 2)
    }

    /// Document files under the configured specification directories
    fn spec_files(&self, project_dir: &Path) -> (BTreeSet<PathBuf>, Vec<MigrationError>) {
        let mut files = BTreeSet::new();
        let mut failures = Vec::new();
        for spec_dir in &self.config.spec_dirs {
            let dir = project_dir.join(spec_dir);
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() && is_document(entry.path()) => {
                        files.insert(entry.into_path());
                    }
                    Ok(_) => {}
                    Err(source) => failures.push(MigrationError::Walk {
                        path: source.path().map_or_else(|| dir.clone(), Path::to_path_buf),
                        source,
                    }),
                }
            }
        }
        (files, failures)
    }

    /// Artifacts the migration would create, all with status `new`
    ///
    /// Nothing is written.
    ///
    /// # Errors
    /// [`MigrationError`] on the first unreadable file or directory.
    pub fn discover_artifacts(&self, project_dir: &Path) -> Result<Vec<Artifact>, MigrationError> {
        let (files, failures) = self.spec_files(project_dir);
        if let Some(failure) = failures.into_iter().next() {
            return Err(failure);
        }
        let mut artifacts: BTreeMap<String, Artifact> = BTreeMap::new();
        for file in files {
            let (abs, rel) = split_path(project_dir, &file);
            let content = std::fs::read_to_string(&abs).map_err(|e| MigrationError::io_error(&abs, e))?;
            for artifact in self.marked_document(&content, &rel).0.artifacts {
                artifacts
                    .entry(artifact.id.clone())
                    .or_insert_with(|| artifact.with_status(ArtifactStatus::New));
            }
        }
        Ok(artifacts.into_values().collect())
    }

    /// Migrate every document under the specification directories
    ///
    /// Per-file failures are collected, not returned. Outside dry run the
    /// result carries a fresh state; saving it is up to the caller.
    ///
    /// # Errors
    /// [`MigrationError::Io`] if `project_dir` is not a directory.
    pub fn migrate_project(&self, project_dir: &Path) -> Result<MigrationResult, MigrationError> {
        let start = Instant::now();
        if !project_dir.is_dir() {
            return Err(MigrationError::io_error(
                project_dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "project directory not found"),
            ));
        }
        let mut result = MigrationResult::new(project_dir, self.config.dry_run);
        let (files, failures) = self.spec_files(project_dir);
        for failure in failures {
            let file = match &failure {
                MigrationError::Walk { path, .. } => path.clone(),
                _ => project_dir.to_path_buf(),
            };
            result.errors.push(MigrationIssue {
                file,
                message: failure.to_string(),
                recoverable: true,
            });
        }

        let mut docs = Vec::new();
        for file in files {
            result.statistics.files_scanned += 1;
            match self.migrate_file_in(project_dir, &file) {
                Ok((outcome, doc)) => {
                    if outcome.migrated {
                        result.statistics.files_migrated += 1;
                        result.statistics.markers_added += outcome.markers_added;
                        result.migrated_files.push(outcome.path.clone());
                    } else {
                        result.statistics.files_skipped += 1;
                    }
                    for issue in doc.issues.iter().filter(|i| i.severity == Severity::Error) {
                        result
                            .warnings
                            .push(format!("{}:{}: {}", outcome.path.display(), issue.line, issue.message));
                    }
                    result.files.push(outcome);
                    docs.push(doc);
                }
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "failed to migrate file");
                    result.statistics.files_skipped += 1;
                    result.errors.push(MigrationIssue {
                        file,
                        message: e.to_string(),
                        recoverable: true,
                    });
                }
            }
        }

        let artifacts = self.build_artifacts(&docs, &mut result.warnings);
        result.statistics.artifacts_found = artifacts.len();

        if !self.config.dry_run {
            let mut state = DerivationState::new(project_name(project_dir));
            for artifact in artifacts.values() {
                state.set_artifact(artifact.clone());
            }
            state.rebuild_graph();
            for doc in &docs {
                match self.hasher.hash_file_with_info(project_dir.join(&doc.path)) {
                    Ok(mut info) => {
                        info.path.clone_from(&doc.path);
                        state.set_file_hash(info);
                    }
                    Err(e) => result.warnings.push(format!("{}: {e}", doc.path.display())),
                }
            }
            result.created_state = Some(state);
        }
        result.discovered_artifacts = artifacts.into_values().collect();
        result.statistics.duration = start.elapsed();

        tracing::info!(
            scanned = result.statistics.files_scanned,
            migrated = result.statistics.files_migrated,
            skipped = result.statistics.files_skipped,
            artifacts = result.statistics.artifacts_found,
            errors = result.errors.len(),
            dry_run = self.config.dry_run,
            "migration finished"
        );
        Ok(result)
    }

    /// Artifacts of all documents, hashed, with upstream edges from their text
    ///
    /// An ID mentioned in a section becomes an upstream only when it belongs
    /// to a lower layer.
    fn build_artifacts(&self, docs: &[ParsedDocument], warnings: &mut Vec<String>) -> BTreeMap<String, Artifact> {
        let now = Utc::now();
        let mut artifacts: BTreeMap<String, Artifact> = BTreeMap::new();
        let mut bodies: BTreeMap<String, &str> = BTreeMap::new();

        for doc in docs {
            for artifact in &doc.artifacts {
                let Some(section) = doc.section(&artifact.id) else {
                    continue;
                };
                if let Some(first) = artifacts.get(&artifact.id) {
                    warnings.push(format!(
                        "duplicate artifact {} in {} (first seen in {})",
                        artifact.id,
                        doc.path.display(),
                        first.location.file.display()
                    ));
                    continue;
                }
                let mut artifact = artifact.clone();
                artifact.content_hash = Some(self.hasher.hash_content(&section.content));
                artifact.status = ArtifactStatus::Current;
                artifact.derived_at = Some(now);
                bodies.insert(artifact.id.clone(), &section.content);
                artifacts.insert(artifact.id.clone(), artifact);
            }
        }

        let known: BTreeMap<String, (Layer, Option<ContentHash>)> = artifacts
            .iter()
            .map(|(id, a)| (id.clone(), (a.layer, a.content_hash)))
            .collect();
        for (id, body) in bodies {
            let Some(artifact) = artifacts.get_mut(&id) else {
                continue;
            };
            for reference in extract_ids(body) {
                if reference == id {
                    continue;
                }
                if let Some((layer, hash)) = known.get(&reference) {
                    if *layer < artifact.layer {
                        artifact.upstream.insert(reference, *hash);
                    }
                }
            }
        }
        artifacts
    }

    /// Problems in a migration outcome
    #[must_use]
    pub fn validate_migration(&self, result: &MigrationResult) -> Vec<String> {
        let mut problems = Vec::new();
        let known: BTreeSet<&str> = result.discovered_artifacts.iter().map(|a| a.id.as_str()).collect();
        for artifact in &result.discovered_artifacts {
            for up in artifact.upstream_ids().filter(|up| !known.contains(up)) {
                problems.push(format!("{} references unknown upstream {up}", artifact.id));
            }
        }
        if let Some(state) = &result.created_state {
            let cycle = state.dependency_graph.detect_cycle();
            if !cycle.is_empty() {
                problems.push(format!("dependency cycle: {}", cycle.join(", ")));
            }
        }
        if !result.dry_run {
            for rel in &result.migrated_files {
                match std::fs::read_to_string(result.project_dir.join(rel)) {
                    Ok(content) => {
                        let doc = self.parser.parse_content(&content, rel);
                        for issue in self.parser.validate_document(&doc) {
                            if issue.severity == Severity::Error {
                                problems.push(format!("{}:{}: {}", rel.display(), issue.line, issue.message));
                            }
                        }
                    }
                    Err(e) => problems.push(format!("{}: {e}", rel.display())),
                }
            }
        }
        problems
    }

    /// Markdown summary of a migration
    #[must_use]
    pub fn generate_migration_report(&self, result: &MigrationResult) -> String {
        let stats = &result.statistics;
        let mut out = String::from("# Migration Report\n\n## Summary\n\n");
        let _ = writeln!(out, "- Project: {}", result.project_dir.display());
        let _ = writeln!(out, "- Mode: {}", if result.dry_run { "dry run" } else { "applied" });
        let _ = writeln!(out, "- Files scanned: {}", stats.files_scanned);
        let _ = writeln!(out, "- Files migrated: {}", stats.files_migrated);
        let _ = writeln!(out, "- Files skipped: {}", stats.files_skipped);
        let _ = writeln!(out, "- Artifacts found: {}", stats.artifacts_found);
        let _ = writeln!(out, "- Markers added: {}", stats.markers_added);
        let _ = writeln!(out, "- Duration: {}ms", stats.duration.as_millis());

        out.push_str("\n## Artifacts by Layer\n");
        for layer in Layer::ALL {
            let in_layer: Vec<&Artifact> = result.discovered_artifacts.iter().filter(|a| a.layer == layer).collect();
            if in_layer.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n### {layer} ({})\n", in_layer.len());
            for artifact in in_layer {
                let _ = writeln!(
                    out,
                    "- {} ({}) in {}",
                    artifact.id,
                    artifact.artifact_type,
                    artifact.location.file.display()
                );
            }
        }

        if !result.migrated_files.is_empty() {
            out.push_str("\n## Migrated Files\n\n");
            for file in &result.migrated_files {
                let _ = writeln!(out, "- {}", file.display());
            }
        }
        if !result.errors.is_empty() {
            out.push_str("\n## Errors\n\n");
            for issue in &result.errors {
                let _ = writeln!(out, "- {}: {}", issue.file.display(), issue.message);
            }
        }
        if !result.warnings.is_empty() {
            out.push_str("\n## Warnings\n\n");
            for warning in &result.warnings {
                let _ = writeln!(out, "- {warning}");
            }
        }
        out
    }
}

/// Wrap every section in BEGIN/END lines, leaving all other lines untouched
fn insert_markers(content: &str, sections: &[HeadingSection]) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + sections.len() * 2);
    for (idx, line) in lines.iter().enumerate() {
        let number = idx + 1;
        for section in sections.iter().filter(|s| s.start_line == number) {
            out.push(begin_generated(&section.id, section.artifact_type));
        }
        out.push((*line).to_string());
        for _ in sections.iter().filter(|s| s.end_line == number) {
            out.push(END_GENERATED.to_string());
        }
    }
    out.join("\n")
}

/// Absolute path and project-relative path of `path`
fn split_path(project_dir: &Path, path: &Path) -> (PathBuf, PathBuf) {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    };
    let rel = abs.strip_prefix(project_dir).map_or_else(|_| abs.clone(), Path::to_path_buf);
    (abs, rel)
}

fn backup_path(backup_dir: &Path, rel: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    backup_dir.join(format!("{}.{stamp}.bak", rel.display()))
}

fn project_name(project_dir: &Path) -> String {
    project_dir
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_document::is_marker_line;
    use pretty_assertions::assert_eq;

    const STORIES: &str = "# User Stories\n\n## US-ORD-001: Place an order\n\nAs a buyer I can place an order.\n\n## US-ORD-002: Cancel\n\nAs a buyer I can cancel.\n";
    const CRITERIA: &str = "# Criteria\n\n## AC-ORD-001: Order total\n\nRefines US-ORD-001. See TS-ORD-001 later.\n\n```md\n# not a heading\n```\n";

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, text) in [("l0/stories.md", STORIES), ("l1/criteria.md", CRITERIA), ("l1/notes.txt", "US-ORD-001")] {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, text).unwrap();
        }
        dir
    }

    fn migrator(dry_run: bool) -> Migrator {
        Migrator::new(
            MigrationConfig {
                dry_run,
                ..MigrationConfig::default()
            },
            Parser::default(),
            Hasher::default(),
        )
    }

    #[test]
    fn markers_wrap_sections_without_touching_text() {
        let sections = heading_sections(STORIES);
        let marked = insert_markers(STORIES, &sections);
        let stripped: Vec<&str> = marked.split('\n').filter(|l| !is_marker_line(l)).collect();
        assert_eq!(stripped.join("\n"), STORIES);
        assert_eq!(marked.matches("LOOM:BEGIN").count(), 2);
        assert!(marked.contains(&format!("As a buyer I can place an order.\n{END_GENERATED}\n\n")));
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let dir = project();
        let result = migrator(true).migrate_project(dir.path()).unwrap();
        assert!(result.created_state.is_none());
        assert_eq!(result.statistics.files_scanned, 2);
        assert_eq!(result.statistics.files_migrated, 2);
        assert_eq!(result.statistics.markers_added, 6);
        assert_eq!(std::fs::read_to_string(dir.path().join("l0/stories.md")).unwrap(), STORIES);
    }

    #[test]
    fn migration_builds_state_with_upward_edges() {
        let dir = project();
        let result = migrator(false).migrate_project(dir.path()).unwrap();
        assert!(result.is_success());
        let state = result.created_state.as_ref().unwrap();
        assert_eq!(state.artifacts.len(), 3);

        let ac = state.get_artifact("AC-ORD-001").unwrap();
        let us = state.get_artifact("US-ORD-001").unwrap();
        assert_eq!(ac.upstream_ids().collect::<Vec<_>>(), vec!["US-ORD-001"]);
        assert_eq!(ac.upstream["US-ORD-001"], us.content_hash);
        assert_eq!(ac.status, ArtifactStatus::Current);
        assert_eq!(state.dependency_graph.get_downstream("US-ORD-001"), vec!["AC-ORD-001"]);
        assert!(state.get_file_hash(Path::new("l1/criteria.md")).is_some());

        let hasher = Hasher::default();
        assert_eq!(ac.content_hash, Some(hasher.hash_artifact(ac, dir.path()).unwrap()));
        assert!(migrator(false).validate_migration(&result).is_empty());
    }

    #[test]
    fn second_run_skips_marked_files() {
        let dir = project();
        migrator(false).migrate_project(dir.path()).unwrap();
        let again = migrator(false).migrate_project(dir.path()).unwrap();
        assert_eq!(again.statistics.files_migrated, 0);
        assert_eq!(again.statistics.markers_added, 0);
        assert!(again
            .files
            .iter()
            .all(|f| f.skip_reason.as_deref() == Some(ALREADY_MARKED)));
        assert_eq!(again.discovered_artifacts.len(), 3);
    }

    #[test]
    fn backup_taken_before_rewrite() {
        let dir = project();
        let config = MigrationConfig {
            backup_dir: Some(PathBuf::from(".loom/backups")),
            ..MigrationConfig::default()
        };
        let outcome = Migrator::new(config, Parser::default(), Hasher::default())
            .migrate_file(dir.path(), Path::new("l0/stories.md"))
            .unwrap();
        let backup = outcome.backup_path.unwrap();
        assert!(backup.starts_with(dir.path().join(".loom/backups/l0")));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), STORIES);
        assert!(has_markers(&std::fs::read_to_string(dir.path().join("l0/stories.md")).unwrap()));
    }

    #[test]
    fn discovered_artifacts_are_new() {
        let dir = project();
        let artifacts = migrator(false).discover_artifacts(dir.path()).unwrap();
        let ids: Vec<_> = artifacts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["AC-ORD-001", "US-ORD-001", "US-ORD-002"]);
        assert!(artifacts.iter().all(|a| a.status == ArtifactStatus::New));
        assert_eq!(std::fs::read_to_string(dir.path().join("l1/criteria.md")).unwrap(), CRITERIA);
    }

    #[test]
    fn report_has_all_sections() {
        let dir = project();
        let m = migrator(true);
        let mut result = m.migrate_project(dir.path()).unwrap();
        result.warnings.push("something odd".into());
        let report = m.generate_migration_report(&result);
        for heading in ["## Summary", "## Artifacts by Layer", "### l0 (2)", "## Migrated Files", "## Warnings"] {
            assert!(report.contains(heading), "missing {heading}");
        }
        assert!(report.contains("- Mode: dry run"));
    }
}
