//! Artifact data model
//!
//! Defines the derivable unit ([`Artifact`]), its classification
//! ([`ArtifactType`], [`Layer`], [`ArtifactStatus`]) and the free-text
//! [`Decision`] records that accompany derivation.
//!
//! # Layers
//!
//! Every type belongs to exactly one [`Layer`]. Layers are ordered, and an
//! artifact may only be derived from artifacts in the same or a lower layer.

use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

/// Ordinal derivation tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Narrative input: stories, NFRs, vocabulary
    L0,
    /// Domain model
    L1,
    /// Technical design and contracts
    L2,
    /// Implementation-facing outputs
    L3,
}

impl Layer {
    /// All layers in derivation order
    pub const ALL: [Self; 4] = [Self::L0, Self::L1, Self::L2, Self::L3];

    /// Canonical lowercase name (`l0`..`l3`)
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::L0 => "l0",
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }
}

impl Display for Layer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l0" => Ok(Self::L0),
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            "l3" => Ok(Self::L3),
            _ => Err(ModelError::UnknownLayer(s.to_string())),
        }
    }
}

/// Kind of artifact; determines its [`Layer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ArtifactType {
    // L0
    UserStory,
    Nfr,
    Vocabulary,
    // L1
    Entity,
    ValueObject,
    Aggregate,
    Relationship,
    BusinessRule,
    AcceptanceCriteria,
    BoundedContext,
    // L2
    TechSpec,
    InterfaceOperation,
    AggregateDesign,
    Sequence,
    DataTable,
    DataEnum,
    // L3
    TestCase,
    ApiEndpoint,
    CodeSkeleton,
    Ticket,
    Event,
    Command,
    Service,
}

impl ArtifactType {
    /// Every known type
    pub const ALL: [Self; 23] = [
        Self::UserStory,
        Self::Nfr,
        Self::Vocabulary,
        Self::Entity,
        Self::ValueObject,
        Self::Aggregate,
        Self::Relationship,
        Self::BusinessRule,
        Self::AcceptanceCriteria,
        Self::BoundedContext,
        Self::TechSpec,
        Self::InterfaceOperation,
        Self::AggregateDesign,
        Self::Sequence,
        Self::DataTable,
        Self::DataEnum,
        Self::TestCase,
        Self::ApiEndpoint,
        Self::CodeSkeleton,
        Self::Ticket,
        Self::Event,
        Self::Command,
        Self::Service,
    ];

    /// Layer this type lives in
    #[must_use]
    pub const fn layer(self) -> Layer {
        match self {
            Self::UserStory | Self::Nfr | Self::Vocabulary => Layer::L0,
            Self::Entity
            | Self::ValueObject
            | Self::Aggregate
            | Self::Relationship
            | Self::BusinessRule
            | Self::AcceptanceCriteria
            | Self::BoundedContext => Layer::L1,
            Self::TechSpec
            | Self::InterfaceOperation
            | Self::AggregateDesign
            | Self::Sequence
            | Self::DataTable
            | Self::DataEnum => Layer::L2,
            Self::TestCase
            | Self::ApiEndpoint
            | Self::CodeSkeleton
            | Self::Ticket
            | Self::Event
            | Self::Command
            | Self::Service => Layer::L3,
        }
    }

    /// snake_case name as it appears in markers and state files
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserStory => "user_story",
            Self::Nfr => "nfr",
            Self::Vocabulary => "vocabulary",
            Self::Entity => "entity",
            Self::ValueObject => "value_object",
            Self::Aggregate => "aggregate",
            Self::Relationship => "relationship",
            Self::BusinessRule => "business_rule",
            Self::AcceptanceCriteria => "acceptance_criteria",
            Self::BoundedContext => "bounded_context",
            Self::TechSpec => "tech_spec",
            Self::InterfaceOperation => "interface_operation",
            Self::AggregateDesign => "aggregate_design",
            Self::Sequence => "sequence",
            Self::DataTable => "data_table",
            Self::DataEnum => "data_enum",
            Self::TestCase => "test_case",
            Self::ApiEndpoint => "api_endpoint",
            Self::CodeSkeleton => "code_skeleton",
            Self::Ticket => "ticket",
            Self::Event => "event",
            Self::Command => "command",
            Self::Service => "service",
        }
    }
}

impl Display for ArtifactType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ModelError::UnknownType(s.to_string()))
    }
}

/// Derivation status of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    /// Up to date with every upstream
    #[default]
    Current,
    /// A direct upstream changed since last derivation
    Stale,
    /// Downstream of a stale or changed artifact
    Affected,
    /// Carries human edits not produced by derivation
    Modified,
    /// Has upstream inputs but was never derived
    New,
    /// References upstream artifacts that no longer exist
    Orphaned,
}

impl ArtifactStatus {
    /// Whether the artifact needs re-derivation or attention
    #[inline]
    #[must_use]
    pub const fn is_action_required(self) -> bool {
        matches!(self, Self::Stale | Self::Affected | Self::New | Self::Orphaned)
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Stale => "stale",
            Self::Affected => "affected",
            Self::Modified => "modified",
            Self::New => "new",
            Self::Orphaned => "orphaned",
        }
    }
}

impl Display for ArtifactStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an artifact lives on disk
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    /// File path, relative to the project root unless absolute
    pub file: PathBuf,
    /// Section anchor inside the file (usually the artifact ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    /// First line of the artifact's section (1-based)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<usize>,
    /// Last line of the artifact's section (1-based, inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<usize>,
}

impl Location {
    /// Location covering a whole file
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: path.into(),
            ..Self::default()
        }
    }

    /// Set the section anchor
    #[inline]
    #[must_use]
    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.anchor = Some(anchor.into());
        self
    }

    /// Set the line range
    #[inline]
    #[must_use]
    pub fn with_lines(mut self, start: usize, end: usize) -> Self {
        self.line_start = Some(start);
        self.line_end = Some(end);
        self
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(anchor) = &self.anchor {
            write!(f, "#{anchor}")?;
        }
        Ok(())
    }
}

/// One derivable unit of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Globally unique ID, prefix-coded by type
    pub id: String,
    /// Artifact type
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Derived from `artifact_type`
    pub layer: Layer,
    /// Current derivation status
    #[serde(default)]
    pub status: ArtifactStatus,
    /// Hash of the artifact's current content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    /// Where the artifact lives
    pub location: Location,
    /// Upstream ID to the hash recorded as input (None until known)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upstream: BTreeMap<String, Option<ContentHash>>,
    /// Direct downstream IDs, informational
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstream: Vec<String>,
    /// Decisions that influenced this artifact
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<String>,
    /// When the artifact was last derived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_at: Option<DateTime<Utc>>,
    /// Upstream hashes used by the last successful derivation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derived_from_hashes: BTreeMap<String, ContentHash>,
    /// Names of human-edited regions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual_sections: Vec<String>,
}

impl Artifact {
    /// Create an artifact with no upstream and status `current`
    #[must_use]
    pub fn new(id: impl Into<String>, artifact_type: ArtifactType, location: Location) -> Self {
        Self {
            id: id.into(),
            artifact_type,
            layer: artifact_type.layer(),
            status: ArtifactStatus::Current,
            content_hash: None,
            location,
            upstream: BTreeMap::new(),
            downstream: Vec::new(),
            decisions: Vec::new(),
            derived_at: None,
            derived_from_hashes: BTreeMap::new(),
            manual_sections: Vec::new(),
        }
    }

    /// Set the content hash
    #[inline]
    #[must_use]
    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    /// Add an upstream dependency with an optional recorded hash
    #[inline]
    #[must_use]
    pub fn with_upstream(mut self, id: impl Into<String>, hash: Option<ContentHash>) -> Self {
        self.upstream.insert(id.into(), hash);
        self
    }

    /// Set the status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: ArtifactStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this artifact has no upstream dependencies
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.upstream.is_empty()
    }

    /// Whether a human edited part of this artifact
    #[inline]
    #[must_use]
    pub fn has_manual_edits(&self) -> bool {
        !self.manual_sections.is_empty()
    }

    /// Upstream IDs in sorted order
    pub fn upstream_ids(&self) -> impl Iterator<Item = &str> {
        self.upstream.keys().map(String::as_str)
    }

    /// Input fingerprint recorded at last derivation
    ///
    /// `derived_from_hashes` when non-empty, otherwise the known hashes in
    /// `upstream`. Empty when the artifact was never derived.
    #[must_use]
    pub fn recorded_fingerprint(&self) -> BTreeMap<&str, ContentHash> {
        if self.derived_from_hashes.is_empty() {
            self.upstream
                .iter()
                .filter_map(|(id, hash)| hash.map(|h| (id.as_str(), h)))
                .collect()
        } else {
            self.derived_from_hashes
                .iter()
                .map(|(id, hash)| (id.as_str(), *hash))
                .collect()
        }
    }
}

/// A recorded question/answer that influenced derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Decision ID
    pub id: String,
    /// Layer the decision was made in
    pub layer: Layer,
    /// The question asked
    pub question: String,
    /// The answer given
    pub answer: String,
    /// Who or what answered (`user`, `default`, `derived`, ...)
    pub source: String,
    /// When it was decided
    pub decided_at: DateTime<Utc>,
    /// Artifact IDs influenced by this decision
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affects: Vec<String>,
    /// Optional grouping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Optional subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl Decision {
    /// Create a decision stamped with the current time
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        layer: Layer,
        question: impl Into<String>,
        answer: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            layer,
            question: question.into(),
            answer: answer.into(),
            source: source.into(),
            decided_at: Utc::now(),
            affects: Vec::new(),
            category: None,
            subject: None,
        }
    }

    /// Record an affected artifact
    #[inline]
    #[must_use]
    pub fn affecting(mut self, artifact_id: impl Into<String>) -> Self {
        self.affects.push(artifact_id.into());
        self
    }
}

/// Errors from parsing model enums
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Not one of `l0`..`l3`
    #[error("unknown layer: '{0}'")]
    UnknownLayer(String),

    /// Not a known artifact type name
    #[error("unknown artifact type: '{0}'")]
    UnknownType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn layer_follows_type() {
        assert_eq!(ArtifactType::UserStory.layer(), Layer::L0);
        assert_eq!(ArtifactType::AcceptanceCriteria.layer(), Layer::L1);
        assert_eq!(ArtifactType::TechSpec.layer(), Layer::L2);
        assert_eq!(ArtifactType::TestCase.layer(), Layer::L3);
        assert!(Layer::L0 < Layer::L3);
    }

    #[test]
    fn type_names_parse_back() {
        for t in ArtifactType::ALL {
            assert_eq!(t.as_str().parse::<ArtifactType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert!("widget".parse::<ArtifactType>().is_err());
    }

    #[test]
    fn action_required_statuses() {
        use ArtifactStatus::*;
        let required: Vec<_> = [Current, Stale, Affected, Modified, New, Orphaned]
            .into_iter()
            .filter(|s| s.is_action_required())
            .collect();
        assert_eq!(required, vec![Stale, Affected, New, Orphaned]);
    }

    #[test]
    fn fingerprint_prefers_derived_from_hashes() {
        let up = ContentHash::sha256(b"up");
        let newer = ContentHash::sha256(b"newer");
        let mut artifact = Artifact::new("AC-ORD-001", ArtifactType::AcceptanceCriteria, Location::file("l1/ac.md"))
            .with_upstream("US-ORD-001", Some(up));
        assert_eq!(artifact.recorded_fingerprint().get("US-ORD-001"), Some(&up));

        artifact.derived_from_hashes.insert("US-ORD-001".into(), newer);
        assert_eq!(artifact.recorded_fingerprint().get("US-ORD-001"), Some(&newer));
    }

    #[test]
    fn fingerprint_empty_when_never_derived() {
        let artifact = Artifact::new("AC-ORD-001", ArtifactType::AcceptanceCriteria, Location::file("l1/ac.md"))
            .with_upstream("US-ORD-001", None);
        assert!(artifact.recorded_fingerprint().is_empty());
        assert!(!artifact.is_root());
    }

    #[test]
    fn artifact_json_shape() {
        let artifact = Artifact::new(
            "US-ORD-001",
            ArtifactType::UserStory,
            Location::file("l0/stories.md").with_anchor("US-ORD-001"),
        );
        let value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["type"], "user_story");
        assert_eq!(value["layer"], "l0");
        assert_eq!(value["status"], "current");
        assert_eq!(value["location"]["anchor"], "US-ORD-001");
        assert!(value.get("upstream").is_none());

        let back: Artifact = serde_json::from_value(value).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn location_display() {
        let loc = Location::file("l1/ac.md").with_anchor("AC-ORD-001");
        assert_eq!(loc.to_string(), "l1/ac.md#AC-ORD-001");
    }
}
