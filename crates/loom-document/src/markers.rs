//! Region marker convention
//!
//! Markers are HTML comments, so they stay invisible in rendered markdown:
//!
//! ```text
//! <!-- LOOM:META key="value" -->
//! <!-- LOOM:BEGIN generated id="AC-ORD-001" type="acceptance_criteria" -->
//! <!-- LOOM:MANUAL section="notes" -->
//! <!-- LOOM:END manual -->
//! <!-- LOOM:END generated -->
//! ```

use loom_artifact::ArtifactType;
use once_cell::sync::Lazy;
use regex::Regex;

/// Token every marker carries
pub const MARKER_TAG: &str = "LOOM:";

/// Closes a generated region
pub const END_GENERATED: &str = "<!-- LOOM:END generated -->";

/// Closes a manual region
pub const END_MANUAL: &str = "<!-- LOOM:END manual -->";

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| unreachable!("static marker pattern is valid: {e}"))
}

pub(crate) static BEGIN: Lazy<Regex> = Lazy::new(|| {
    compile(r#"<!--\s*LOOM:BEGIN\s+(\w+)(?:\s+id="([^"]+)")?(?:\s+type="([^"]+)")?\s*-->"#)
});

pub(crate) static END: Lazy<Regex> = Lazy::new(|| compile(r"<!--\s*LOOM:END\s+(\w+)\s*-->"));

pub(crate) static MANUAL: Lazy<Regex> =
    Lazy::new(|| compile(r#"<!--\s*LOOM:MANUAL\s+section="([^"]+)"\s*-->"#));

pub(crate) static META: Lazy<Regex> = Lazy::new(|| compile(r"<!--\s*LOOM:META\s+([^>]+?)\s*-->"));

pub(crate) static META_PAIR: Lazy<Regex> = Lazy::new(|| compile(r#"(\w+)="([^"]*)""#));

/// Marker found on a single line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// Opens a region of the given kind (`generated` in practice)
    Begin {
        /// Region kind word
        kind: String,
        /// Artifact ID, if declared
        id: Option<String>,
        /// Declared type name, if any
        artifact_type: Option<String>,
    },
    /// Closes the innermost region of the given kind
    End {
        /// Region kind word
        kind: String,
    },
    /// Opens a named manual region
    Manual {
        /// Section name
        section: String,
    },
    /// Document-level key/value pairs
    Meta(Vec<(String, String)>),
}

impl Marker {
    /// Recognize the marker on `line`, if any
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        if !line.contains(MARKER_TAG) {
            return None;
        }
        if let Some(caps) = META.captures(line) {
            let pairs = META_PAIR
                .captures_iter(&caps[1])
                .map(|pair| (pair[1].to_string(), pair[2].to_string()))
                .collect();
            return Some(Self::Meta(pairs));
        }
        if let Some(caps) = BEGIN.captures(line) {
            return Some(Self::Begin {
                kind: caps[1].to_string(),
                id: caps.get(2).map(|m| m.as_str().to_string()),
                artifact_type: caps.get(3).map(|m| m.as_str().to_string()),
            });
        }
        if let Some(caps) = END.captures(line) {
            return Some(Self::End {
                kind: caps[1].to_string(),
            });
        }
        MANUAL.captures(line).map(|caps| Self::Manual {
            section: caps[1].to_string(),
        })
    }
}

/// Opening marker for a generated region
#[must_use]
pub fn begin_generated(id: &str, artifact_type: ArtifactType) -> String {
    format!("<!-- LOOM:BEGIN generated id=\"{id}\" type=\"{artifact_type}\" -->")
}

/// Opening marker for a manual region
#[must_use]
pub fn begin_manual(section: &str) -> String {
    format!("<!-- LOOM:MANUAL section=\"{section}\" -->")
}

/// Whether `content` already carries region markers
#[must_use]
pub fn has_markers(content: &str) -> bool {
    content.lines().any(|line| BEGIN.is_match(line))
}

/// Whether `line` is any marker line
#[must_use]
pub fn is_marker_line(line: &str) -> bool {
    Marker::parse(line).is_some()
}
