//! Marker-based document parser
//!
//! Splits a document into generated and manual regions, turns generated
//! regions into [`Artifact`]s and collects cross-references between them.

use crate::error::{DocumentError, DocumentResult};
use crate::layer::detect_layer;
use crate::markers::Marker;
use loom_artifact::{find_ids, type_from_id, Artifact, ArtifactType, Layer, Location};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions treated as documents
pub const DOCUMENT_EXTENSIONS: &[&str] = &["md", "markdown"];

static REFERENCE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:(?P<derives>derive[sd]?\s+from)|(?P<implements>implements?|realizes?)|(?P<tests>tests?|verifies?)|(?P<references>see(?:\s+also)?|refs?|references?))\b",
    )
    .unwrap_or_else(|e| unreachable!("static reference pattern is valid: {e}"))
});

/// Parser settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Report unclosed regions and stray END markers as errors
    pub strict: bool,
    /// Collect cross-references from generated regions
    pub extract_references: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            strict: false,
            extract_references: true,
        }
    }
}

/// Region discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    /// Produced by derivation; may be regenerated
    Generated,
    /// Authored by a human; must survive regeneration
    Manual,
}

/// One marked region of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSection {
    /// Artifact ID (generated) or section name (manual)
    pub id: Option<String>,
    /// Generated or manual
    pub kind: SectionKind,
    /// Declared or inferred artifact type
    pub artifact_type: Option<ArtifactType>,
    /// Line of the opening marker (1-based)
    pub start_line: usize,
    /// Last line of the region (the closing marker when present)
    pub end_line: usize,
    /// Lines strictly between the markers
    pub content: String,
    /// Names of manual regions nested in this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual_sections: Vec<String>,
    /// Enclosing generated region, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// How one artifact refers to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    /// Plain mention or "see also"
    References,
    /// "implements" / "realizes"
    Implements,
    /// "tests" / "verifies"
    Tests,
    /// "derives from"
    Derives,
}

/// Cross-reference found inside a generated region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Artifact whose region contains the mention
    pub from_id: String,
    /// Artifact mentioned
    pub to_id: String,
    /// Relationship phrase
    pub kind: ReferenceKind,
    /// Line of the mention (1-based)
    pub line: usize,
}

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Must be fixed
    Error,
    /// Tolerated
    Warning,
}

/// Problem found while parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseIssue {
    /// Line (1-based); 0 for document-wide issues
    pub line: usize,
    /// Description
    pub message: String,
    /// Severity
    pub severity: Severity,
}

/// Parse result for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// Path as given to the parser
    pub path: PathBuf,
    /// Layer detected from the path
    pub layer: Layer,
    /// Regions ordered by start line
    pub sections: Vec<ParsedSection>,
    /// One artifact per recognized generated region
    pub artifacts: Vec<Artifact>,
    /// Cross-references
    pub references: Vec<Reference>,
    /// Front-matter and META pairs
    pub metadata: BTreeMap<String, String>,
    /// Problems found while parsing
    pub issues: Vec<ParseIssue>,
}

impl ParsedDocument {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            layer: detect_layer(path),
            sections: Vec::new(),
            artifacts: Vec::new(),
            references: Vec::new(),
            metadata: BTreeMap::new(),
            issues: Vec::new(),
        }
    }

    /// Generated region with this ID
    #[must_use]
    pub fn section(&self, id: &str) -> Option<&ParsedSection> {
        self.generated_sections()
            .find(|s| s.id.as_deref() == Some(id))
    }

    /// Generated regions in order
    pub fn generated_sections(&self) -> impl Iterator<Item = &ParsedSection> {
        self.sections
            .iter()
            .filter(|s| s.kind == SectionKind::Generated)
    }

    /// Whether any error-severity issue was recorded
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }
}

struct OpenRegion {
    kind: SectionKind,
    id: Option<String>,
    declared_type: Option<String>,
    start_idx: usize,
    manual_sections: Vec<String>,
    parent: Option<String>,
}

/// Marker-based document parser
#[derive(Debug, Clone, Default)]
pub struct Parser {
    config: ParserConfig,
}

impl Parser {
    /// Create a parser
    #[inline]
    #[must_use]
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Read and parse a file
    ///
    /// # Errors
    /// [`DocumentError::Io`] if the file cannot be read.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> DocumentResult<ParsedDocument> {
        let path = path.as_ref();
        let content = read_document(path)?;
        Ok(self.parse_content(&content, path))
    }

    /// Parse document text; `path` is recorded and used for layer detection
    #[must_use]
    pub fn parse_content(&self, content: &str, path: impl AsRef<Path>) -> ParsedDocument {
        let mut doc = ParsedDocument::new(path.as_ref());
        let lines: Vec<&str> = content.split('\n').collect();

        let mut body_start = 0;
        if let Some(front) = front_matter(&lines) {
            body_start = front.body_start;
            match front.metadata {
                Ok(pairs) => doc.metadata.extend(pairs),
                Err(message) => doc.issues.push(ParseIssue {
                    line: 1,
                    message: format!("invalid front-matter: {message}"),
                    severity: Severity::Warning,
                }),
            }
        }

        self.parse_markers(&lines, body_start, &mut doc);
        doc.sections.sort_by_key(|s| (s.start_line, s.end_line));
        self.extract_artifacts(&mut doc);
        if self.config.extract_references {
            extract_references(&lines, body_start, &mut doc);
        }

        tracing::trace!(
            path = %doc.path.display(),
            sections = doc.sections.len(),
            artifacts = doc.artifacts.len(),
            "parsed document"
        );
        doc
    }

    fn severity(&self) -> Severity {
        if self.config.strict {
            Severity::Error
        } else {
            Severity::Warning
        }
    }

    fn parse_markers(&self, lines: &[&str], body_start: usize, doc: &mut ParsedDocument) {
        let mut stack: Vec<OpenRegion> = Vec::new();

        for (idx, line) in lines.iter().enumerate().skip(body_start) {
            let Some(marker) = Marker::parse(line) else {
                continue;
            };
            match marker {
                Marker::Meta(pairs) => doc.metadata.extend(pairs),
                Marker::Begin {
                    kind,
                    id,
                    artifact_type,
                } => {
                    let kind = if kind == "manual" {
                        SectionKind::Manual
                    } else {
                        SectionKind::Generated
                    };
                    stack.push(OpenRegion {
                        kind,
                        id,
                        declared_type: artifact_type,
                        start_idx: idx,
                        manual_sections: Vec::new(),
                        parent: enclosing_generated(&stack),
                    });
                }
                Marker::Manual { section } => {
                    if stack.last().is_some_and(|r| r.kind == SectionKind::Manual) {
                        if let Some(open) = stack.pop() {
                            close_region(open, lines, idx, idx, doc);
                        }
                    }
                    if let Some(parent) = stack
                        .iter_mut()
                        .rev()
                        .find(|r| r.kind == SectionKind::Generated)
                    {
                        parent.manual_sections.push(section.clone());
                    }
                    stack.push(OpenRegion {
                        kind: SectionKind::Manual,
                        id: Some(section),
                        declared_type: None,
                        start_idx: idx,
                        manual_sections: Vec::new(),
                        parent: enclosing_generated(&stack),
                    });
                }
                Marker::End { kind } => {
                    let closes_manual = kind == "manual";
                    // A manual region left open ends with its generated parent.
                    if !closes_manual && stack.last().is_some_and(|r| r.kind == SectionKind::Manual) {
                        if let Some(open) = stack.pop() {
                            close_region(open, lines, idx, idx, doc);
                        }
                    }
                    let wanted = if closes_manual {
                        SectionKind::Manual
                    } else {
                        SectionKind::Generated
                    };
                    if stack.last().is_some_and(|r| r.kind == wanted) {
                        if let Some(open) = stack.pop() {
                            close_region(open, lines, idx, idx + 1, doc);
                        }
                    } else {
                        doc.issues.push(ParseIssue {
                            line: idx + 1,
                            message: format!("LOOM:END {kind} without matching LOOM:BEGIN"),
                            severity: self.severity(),
                        });
                    }
                }
            }
        }

        while let Some(open) = stack.pop() {
            doc.issues.push(ParseIssue {
                line: open.start_idx + 1,
                message: format!("unclosed section starting at line {}", open.start_idx + 1),
                severity: self.severity(),
            });
            close_region(open, lines, lines.len(), lines.len(), doc);
        }
    }

    fn extract_artifacts(&self, doc: &mut ParsedDocument) {
        let mut artifacts = Vec::new();
        let mut issues = Vec::new();

        for section in &mut doc.sections {
            if section.kind != SectionKind::Generated {
                continue;
            }
            if section.id.is_none() {
                section.id = find_ids(&section.content).next().map(|(_, id)| id.to_string());
            }
            let Some(id) = section.id.clone() else {
                continue;
            };
            let Some(artifact_type) = section.artifact_type.or_else(|| type_from_id(&id)) else {
                continue;
            };
            section.artifact_type = Some(artifact_type);

            if let Some(expected) = type_from_id(&id) {
                if expected != artifact_type {
                    issues.push(ParseIssue {
                        line: section.start_line,
                        message: format!("{id} declared as {artifact_type} but its prefix means {expected}"),
                        severity: Severity::Warning,
                    });
                }
            }

            let location = Location::file(&doc.path)
                .with_anchor(id.clone())
                .with_lines(section.start_line, section.end_line);
            let mut artifact = Artifact::new(id, artifact_type, location);
            artifact.manual_sections.clone_from(&section.manual_sections);
            artifacts.push(artifact);
        }

        doc.artifacts = artifacts;
        doc.issues.extend(issues);
    }

    /// Problems that need attention
    ///
    /// Duplicate generated IDs are always errors. Unclosed regions and stray
    /// END markers appear only under strict mode.
    #[must_use]
    pub fn validate_document(&self, doc: &ParsedDocument) -> Vec<ParseIssue> {
        let mut issues: Vec<ParseIssue> = doc
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .cloned()
            .collect();

        let mut seen: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for section in doc.generated_sections() {
            if let Some(id) = section.id.as_deref() {
                let entry = seen.entry(id).or_insert((0, section.start_line));
                entry.0 += 1;
            }
        }
        for (id, (count, line)) in seen {
            if count > 1 {
                issues.push(ParseIssue {
                    line,
                    message: format!("duplicate artifact ID: {id} (appears {count} times)"),
                    severity: Severity::Error,
                });
            }
        }
        issues
    }

    /// Every ID-shaped token anywhere in `content`, sorted and unique
    #[must_use]
    pub fn get_artifact_ids(&self, content: &str) -> Vec<String> {
        find_ids(content)
            .map(|(_, id)| id.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Parse every document under `dir`, in path order
    ///
    /// # Errors
    /// The first traversal or read failure.
    pub fn parse_directory(&self, dir: impl AsRef<Path>) -> DocumentResult<Vec<ParsedDocument>> {
        let dir = dir.as_ref();
        let mut docs = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|source| DocumentError::Walk {
                path: dir.to_path_buf(),
                source,
            })?;
            if entry.file_type().is_file() && is_document(entry.path()) {
                docs.push(self.parse_file(entry.path())?);
            }
        }
        Ok(docs)
    }
}

/// Read a document as text
///
/// Bytes that are not valid UTF-8 are replaced with U+FFFD, so a stray
/// Latin-1 file still hashes and parses.
///
/// # Errors
/// [`DocumentError::Io`] if the file cannot be read.
pub fn read_document(path: impl AsRef<Path>) -> DocumentResult<String> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| DocumentError::io_error(path, e))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

/// Whether `path` has a document extension
#[must_use]
pub fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| DOCUMENT_EXTENSIONS.contains(&e))
}

/// Artifacts of every document, in document order
#[must_use]
pub fn all_artifacts(docs: &[ParsedDocument]) -> Vec<Artifact> {
    docs.iter().flat_map(|d| d.artifacts.iter().cloned()).collect()
}

/// References of every document, in document order
#[must_use]
pub fn all_references(docs: &[ParsedDocument]) -> Vec<Reference> {
    docs.iter().flat_map(|d| d.references.iter().cloned()).collect()
}

/// References grouped by the referring artifact
#[must_use]
pub fn reference_map(refs: &[Reference]) -> BTreeMap<String, Vec<Reference>> {
    let mut map: BTreeMap<String, Vec<Reference>> = BTreeMap::new();
    for reference in refs {
        map.entry(reference.from_id.clone())
            .or_default()
            .push(reference.clone());
    }
    map
}

fn enclosing_generated(stack: &[OpenRegion]) -> Option<String> {
    stack
        .iter()
        .rev()
        .find(|r| r.kind == SectionKind::Generated)
        .and_then(|r| r.id.clone())
}

/// Close `open`; content runs up to (not including) `content_end`
fn close_region(
    open: OpenRegion,
    lines: &[&str],
    content_end: usize,
    end_line: usize,
    doc: &mut ParsedDocument,
) {
    let content_start = (open.start_idx + 1).min(content_end);
    let artifact_type = open.declared_type.as_deref().and_then(|t| {
        let parsed = t.parse::<ArtifactType>().ok();
        if parsed.is_none() {
            doc.issues.push(ParseIssue {
                line: open.start_idx + 1,
                message: format!("unknown artifact type '{t}'"),
                severity: Severity::Warning,
            });
        }
        parsed
    });
    doc.sections.push(ParsedSection {
        id: open.id,
        kind: open.kind,
        artifact_type,
        start_line: open.start_idx + 1,
        end_line: end_line.max(open.start_idx + 1),
        content: lines[content_start..content_end].join("\n"),
        manual_sections: open.manual_sections,
        parent: open.parent,
    });
}

fn extract_references(lines: &[&str], body_start: usize, doc: &mut ParsedDocument) {
    let mut references = Vec::new();

    for (idx, line) in lines.iter().enumerate().skip(body_start) {
        let number = idx + 1;
        if Marker::parse(line).is_some() {
            continue;
        }
        // A heading that names an ID defines it rather than referring to it.
        if line.trim_start().starts_with('#') {
            continue;
        }
        let Some(source) = innermost_generated(doc, number) else {
            continue;
        };

        let mut window_start = 0;
        let mut kind = ReferenceKind::References;
        for (offset, target) in find_ids(line) {
            if let Some(phrase) = last_phrase(&line[window_start..offset]) {
                kind = phrase;
            }
            window_start = offset + target.len();
            if target != source {
                references.push(Reference {
                    from_id: source.to_string(),
                    to_id: target.to_string(),
                    kind,
                    line: number,
                });
            }
        }
    }

    doc.references = references;
}

fn innermost_generated(doc: &ParsedDocument, line: usize) -> Option<&str> {
    doc.generated_sections()
        .filter(|s| s.start_line < line && line <= s.end_line)
        .max_by_key(|s| s.start_line)
        .and_then(|s| s.id.as_deref())
}

fn last_phrase(window: &str) -> Option<ReferenceKind> {
    let caps = REFERENCE_PHRASE.captures_iter(window).last()?;
    let kind = if caps.name("derives").is_some() {
        ReferenceKind::Derives
    } else if caps.name("implements").is_some() {
        ReferenceKind::Implements
    } else if caps.name("tests").is_some() {
        ReferenceKind::Tests
    } else {
        ReferenceKind::References
    };
    Some(kind)
}

pub(crate) struct FrontMatter {
    /// Index of the first line after the closing delimiter
    pub(crate) body_start: usize,
    pub(crate) metadata: Result<Vec<(String, String)>, String>,
}

/// YAML front-matter delimited by `---` lines at the very top
pub(crate) fn front_matter(lines: &[&str]) -> Option<FrontMatter> {
    if lines.first().map(|l| l.trim_end()) != Some("---") {
        return None;
    }
    let close = lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, l)| matches!(l.trim_end(), "---" | "..."))
        .map(|(i, _)| i)?;

    let yaml = lines[1..close].join("\n");
    let metadata = serde_yaml::from_str::<serde_yaml::Value>(&yaml)
        .map_err(|e| e.to_string())
        .map(|value| match value {
            serde_yaml::Value::Mapping(map) => map
                .into_iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), yaml_scalar(&v)?)))
                .collect(),
            _ => Vec::new(),
        });

    Some(FrontMatter {
        body_start: close + 1,
        metadata,
    })
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}
