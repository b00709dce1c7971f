//! Content, file and section hashing
//!
//! Optional normalization (whitespace, comments) is applied before hashing
//! for semantic-diff tolerance. Region markers are structural and always
//! survive normalization.

use crate::error::{DocumentError, DocumentResult};
use crate::markers::MARKER_TAG;
use crate::parser::{read_document, Parser, ParserConfig, SectionKind, DOCUMENT_EXTENSIONS};
use crate::splice::section_body;
use chrono::{DateTime, Utc};
use loom_artifact::{Artifact, ContentHash, HashAlgorithm};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const STREAM_CHUNK: usize = 64 * 1024;

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| unreachable!("static normalization pattern is valid: {e}"))
}

static HTML_COMMENT: Lazy<Regex> = Lazy::new(|| compile(r"(?s)<!--.*?-->"));
static INLINE_SPACE: Lazy<Regex> = Lazy::new(|| compile(r"[ \t]+"));
static SPACE_AROUND_NEWLINE: Lazy<Regex> = Lazy::new(|| compile(r" ?\n ?"));
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| compile(r"\n{2,}"));

/// Hasher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HasherConfig {
    /// Digest algorithm
    pub algorithm: HashAlgorithm,
    /// Collapse runs of spaces and blank lines before hashing
    pub ignore_whitespace: bool,
    /// Drop HTML comments (except region markers) before hashing
    pub ignore_comments: bool,
    /// File extensions considered by [`Hasher::hash_directory`]
    pub extensions: Vec<String>,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            ignore_whitespace: false,
            ignore_comments: false,
            extensions: DOCUMENT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect(),
        }
    }
}

/// Hash plus the file metadata used for cheap change pre-checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashInfo {
    /// File path
    pub path: PathBuf,
    /// Content hash
    pub hash: ContentHash,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// Hash of one marked region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHash {
    /// Artifact ID or manual section name
    pub section_id: Option<String>,
    /// Generated or manual
    pub kind: SectionKind,
    /// Hash of the region's content
    pub hash: ContentHash,
    /// First line (1-based)
    pub start_line: usize,
    /// Last line (1-based)
    pub end_line: usize,
}

/// Content hasher
#[derive(Debug, Clone, Default)]
pub struct Hasher {
    config: HasherConfig,
}

impl Hasher {
    /// Create a hasher
    #[inline]
    #[must_use]
    pub fn new(config: HasherConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &HasherConfig {
        &self.config
    }

    /// Hash text after configured normalization
    #[must_use]
    pub fn hash_content(&self, content: &str) -> ContentHash {
        let normalized = self.normalize(content);
        ContentHash::compute(self.config.algorithm, normalized.as_bytes())
    }

    /// Apply configured normalization
    #[must_use]
    pub fn normalize(&self, content: &str) -> String {
        let mut text = content.to_string();
        if self.config.ignore_comments {
            text = strip_comments(&text);
        }
        if self.config.ignore_whitespace {
            text = normalize_whitespace(&text);
        }
        text
    }

    /// Hash a file's content; invalid UTF-8 is decoded lossily
    ///
    /// # Errors
    /// [`DocumentError::Io`] if the file cannot be read.
    pub fn hash_file(&self, path: impl AsRef<Path>) -> DocumentResult<ContentHash> {
        Ok(self.hash_content(&read_document(path)?))
    }

    /// Hash a file and capture its size and modification time
    ///
    /// # Errors
    /// [`DocumentError::Io`] if the file cannot be read or stat'ed.
    pub fn hash_file_with_info(&self, path: impl AsRef<Path>) -> DocumentResult<FileHashInfo> {
        let path = path.as_ref();
        let (size, modified) = file_stamp(path)?;
        Ok(FileHashInfo {
            path: path.to_path_buf(),
            hash: self.hash_file(path)?,
            size,
            modified,
        })
    }

    /// Whether `path` must be rehashed given what was cached
    ///
    /// True when nothing is cached, the file cannot be stat'ed, or its size or
    /// modification time differ from the cached values.
    #[must_use]
    pub fn needs_rehash(&self, path: impl AsRef<Path>, cached: Option<&FileHashInfo>) -> bool {
        let Some(cached) = cached else {
            return true;
        };
        match file_stamp(path.as_ref()) {
            Ok((size, modified)) => size != cached.size || modified != cached.modified,
            Err(_) => true,
        }
    }

    /// Hash a large file incrementally
    ///
    /// Raw bytes are hashed; normalization does not apply.
    ///
    /// # Errors
    /// [`DocumentError::Io`] on open or read failure.
    pub fn stream_hash(&self, path: impl AsRef<Path>) -> DocumentResult<ContentHash> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path).map_err(|e| DocumentError::io_error(path, e))?;
        let mut hasher = self.config.algorithm.hasher();
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = file.read(&mut buf).map_err(|e| DocumentError::io_error(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    /// One hash per marked region in `content`
    #[must_use]
    pub fn hash_sections(&self, content: &str) -> Vec<SectionHash> {
        Parser::new(ParserConfig {
            strict: false,
            extract_references: false,
        })
        .parse_content(content, "")
        .sections
        .into_iter()
        .map(|s| SectionHash {
            hash: self.hash_content(&s.content),
            section_id: s.id,
            kind: s.kind,
            start_line: s.start_line,
            end_line: s.end_line,
        })
        .collect()
    }

    /// Text an artifact's hash is computed over
    ///
    /// The body of the generated region named by the location anchor when it
    /// exists in the file, else the declared line range, else the whole file.
    ///
    /// # Errors
    /// [`DocumentError::NoLocation`] for an empty path, [`DocumentError::Io`]
    /// if the file cannot be read.
    pub fn artifact_content(&self, artifact: &Artifact, project_dir: &Path) -> DocumentResult<String> {
        let path = resolve_location(artifact, project_dir)?;
        let content = read_document(&path)?;

        if let Some(body) = artifact
            .location
            .anchor
            .as_deref()
            .and_then(|anchor| section_body(&content, anchor))
        {
            return Ok(body);
        }

        if let Some(start) = artifact.location.line_start.filter(|s| *s > 0) {
            let lines: Vec<&str> = content.split('\n').collect();
            let start_idx = start - 1;
            let end_idx = artifact
                .location
                .line_end
                .filter(|e| *e > 0 && *e < lines.len())
                .unwrap_or(lines.len());
            if start_idx < end_idx {
                return Ok(lines[start_idx..end_idx].join("\n"));
            }
        }

        Ok(content)
    }

    /// Current hash of an artifact's content
    ///
    /// # Errors
    /// See [`Hasher::artifact_content`].
    pub fn hash_artifact(&self, artifact: &Artifact, project_dir: &Path) -> DocumentResult<ContentHash> {
        Ok(self.hash_content(&self.artifact_content(artifact, project_dir)?))
    }

    /// Hash every document under `dir`, keyed by path relative to `dir`
    ///
    /// Unreadable files are logged and left out.
    ///
    /// # Errors
    /// The first traversal failure.
    pub fn hash_directory(&self, dir: impl AsRef<Path>) -> DocumentResult<BTreeMap<PathBuf, ContentHash>> {
        let dir = dir.as_ref();
        let mut hashes = BTreeMap::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|source| DocumentError::Walk {
                path: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() || !self.is_hashed(entry.path()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .unwrap_or(entry.path())
                .to_path_buf();
            match self.hash_file(entry.path()) {
                Ok(hash) => {
                    hashes.insert(relative, hash);
                }
                Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable file"),
            }
        }
        Ok(hashes)
    }

    fn is_hashed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.config.extensions.iter().any(|x| x == e))
    }

    /// Keys in `current` whose hash differs from or is absent in `stored`
    #[must_use]
    pub fn detect_changes<K: Ord + Clone>(
        current: &BTreeMap<K, ContentHash>,
        stored: &BTreeMap<K, ContentHash>,
    ) -> Vec<K> {
        current
            .iter()
            .filter(|(key, hash)| stored.get(*key) != Some(*hash))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys in `stored` that are absent from `current`
    #[must_use]
    pub fn detect_deleted<K: Ord + Clone>(
        current: &BTreeMap<K, ContentHash>,
        stored: &BTreeMap<K, ContentHash>,
    ) -> Vec<K> {
        stored
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned()
            .collect()
    }
}

/// Absolute path of an artifact's file
///
/// # Errors
/// [`DocumentError::NoLocation`] when the location path is empty.
pub fn resolve_location(artifact: &Artifact, project_dir: &Path) -> DocumentResult<PathBuf> {
    let file = &artifact.location.file;
    if file.as_os_str().is_empty() {
        return Err(DocumentError::NoLocation(artifact.id.clone()));
    }
    Ok(if file.is_absolute() {
        file.clone()
    } else {
        project_dir.join(file)
    })
}

fn file_stamp(path: &Path) -> DocumentResult<(u64, DateTime<Utc>)> {
    let meta = std::fs::metadata(path).map_err(|e| DocumentError::io_error(path, e))?;
    let modified = meta.modified().map_err(|e| DocumentError::io_error(path, e))?;
    Ok((meta.len(), DateTime::<Utc>::from(modified)))
}

fn strip_comments(content: &str) -> String {
    HTML_COMMENT
        .replace_all(content, |caps: &regex::Captures<'_>| {
            let comment = &caps[0];
            if comment.contains(MARKER_TAG) {
                comment.to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

fn normalize_whitespace(content: &str) -> String {
    let text = content.replace("\r\n", "\n");
    let text = INLINE_SPACE.replace_all(&text, " ");
    let text = SPACE_AROUND_NEWLINE.replace_all(&text, "\n");
    let text = BLANK_RUNS.replace_all(&text, "\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::{begin_generated, begin_manual, END_GENERATED, END_MANUAL};
    use loom_artifact::{ArtifactType, Location};
    use pretty_assertions::assert_eq;

    fn hasher(ignore_whitespace: bool, ignore_comments: bool) -> Hasher {
        Hasher::new(HasherConfig {
            ignore_whitespace,
            ignore_comments,
            ..HasherConfig::default()
        })
    }

    #[test]
    fn hash_is_prefixed_and_stable() {
        let h = Hasher::default();
        let a = h.hash_content("hello");
        assert_eq!(a, h.hash_content("hello"));
        assert_ne!(a, h.hash_content("hello!"));
        assert!(a.to_string().starts_with("sha256:"));
    }

    #[test]
    fn whitespace_normalization() {
        let h = hasher(true, false);
        assert_eq!(h.hash_content("a  b\n\n\nc \n"), h.hash_content("a b\nc"));
        assert_ne!(Hasher::default().hash_content("a  b"), Hasher::default().hash_content("a b"));
    }

    #[test]
    fn comment_stripping_keeps_markers() {
        let h = hasher(false, true);
        let marker = begin_generated("US-ORD-001", ArtifactType::UserStory);
        assert_eq!(h.normalize(&format!("x<!-- note -->y\n{marker}")), format!("xy\n{marker}"));
        assert_ne!(h.hash_content(&marker), h.hash_content(""));
    }

    #[test]
    fn change_and_deletion_detection() {
        let h = Hasher::default();
        let stored: BTreeMap<&str, ContentHash> = [("a", h.hash_content("1")), ("b", h.hash_content("2")), ("gone", h.hash_content("3"))]
            .into_iter()
            .collect();
        let current: BTreeMap<&str, ContentHash> = [("a", h.hash_content("1")), ("b", h.hash_content("changed")), ("new", h.hash_content("4"))]
            .into_iter()
            .collect();
        assert_eq!(Hasher::detect_changes(&current, &stored), vec!["b", "new"]);
        assert_eq!(Hasher::detect_deleted(&current, &stored), vec!["gone"]);
    }

    #[test]
    fn section_hashes() {
        let content = [
            begin_generated("US-ORD-001", ArtifactType::UserStory).as_str(),
            "story",
            &begin_manual("notes"),
            "mine",
            END_MANUAL,
            END_GENERATED,
        ]
        .join("\n");
        let h = Hasher::default();
        let sections = h.hash_sections(&content);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section_id.as_deref(), Some("US-ORD-001"));
        assert_eq!(sections[1].kind, SectionKind::Manual);
        assert_eq!(sections[1].hash, h.hash_content("mine"));
    }

    #[test]
    fn file_hashing_and_rehash_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "content").unwrap();

        let h = Hasher::default();
        let info = h.hash_file_with_info(&path).unwrap();
        assert_eq!(info.hash, h.hash_content("content"));
        assert_eq!(info.size, 7);
        assert_eq!(h.hash_file(&path).unwrap(), info.hash);
        assert_eq!(h.stream_hash(&path).unwrap(), info.hash);
        assert!(!h.needs_rehash(&path, Some(&info)));
        assert!(h.needs_rehash(&path, None));

        std::fs::write(&path, "content grew").unwrap();
        assert!(h.needs_rehash(&path, Some(&info)));
        assert!(h.needs_rehash(dir.path().join("missing.md"), Some(&info)));
    }

    #[test]
    fn directory_hashing_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("l1")).unwrap();
        std::fs::write(dir.path().join("l1/ac.md"), "x").unwrap();
        std::fs::write(dir.path().join("l1/data.json"), "{}").unwrap();

        let hashes = Hasher::default().hash_directory(dir.path()).unwrap();
        assert_eq!(hashes.keys().cloned().collect::<Vec<_>>(), vec![PathBuf::from("l1/ac.md")]);
    }

    #[test]
    fn latin1_files_hash_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("latin1.md"), b"caf\xe9 cr\xe8me").unwrap();
        std::fs::write(dir.path().join("plain.md"), "plain").unwrap();

        let h = Hasher::default();
        let hashes = h.hash_directory(dir.path()).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[Path::new("latin1.md")], h.hash_content("caf\u{fffd} cr\u{fffd}me"));
        assert_eq!(h.hash_file(dir.path().join("latin1.md")).unwrap(), hashes[Path::new("latin1.md")]);
    }

    #[test]
    fn artifact_hash_uses_anchor_then_lines_then_file() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "intro\n{}\nbody\n{END_GENERATED}\noutro",
            begin_generated("US-ORD-001", ArtifactType::UserStory)
        );
        std::fs::write(dir.path().join("s.md"), &content).unwrap();
        let h = Hasher::default();

        let anchored = Artifact::new("US-ORD-001", ArtifactType::UserStory, Location::file("s.md").with_anchor("US-ORD-001"));
        assert_eq!(h.hash_artifact(&anchored, dir.path()).unwrap(), h.hash_content("body"));

        let ranged = Artifact::new("US-ORD-002", ArtifactType::UserStory, Location::file("s.md").with_lines(1, 1));
        assert_eq!(h.hash_artifact(&ranged, dir.path()).unwrap(), h.hash_content("intro"));

        let whole = Artifact::new("US-ORD-003", ArtifactType::UserStory, Location::file("s.md"));
        assert_eq!(h.hash_artifact(&whole, dir.path()).unwrap(), h.hash_content(&content));

        let nowhere = Artifact::new("US-ORD-004", ArtifactType::UserStory, Location::default());
        assert!(matches!(h.hash_artifact(&nowhere, dir.path()), Err(DocumentError::NoLocation(_))));
    }
}
