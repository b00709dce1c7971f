//! Loom Document Layer
//!
//! The boundary between specification documents on disk and the artifact
//! model.
//!
//! # Core Operations
//!
//! - **Parse**: Find `LOOM:BEGIN`, `LOOM:MANUAL` and `LOOM:END` regions, artifacts and cross references
//! - **Hash**: Content, file, section and artifact hashes with optional normalization
//! - **Splice**: Replace one generated region and carry manual regions across
//!
//! # Markers
//!
//! ```text
//! <!-- LOOM:BEGIN generated id="AC-ORD-001" type="acceptance_criteria" -->
//! ...derived content...
//! <!-- LOOM:MANUAL section="notes" -->
//! ...human-authored, preserved on regeneration...
//! <!-- LOOM:END manual -->
//! <!-- LOOM:END generated -->
//! ```
//!
//! # Example
//!
//! ```rust
//! use loom_document::{begin_generated, Parser, END_GENERATED};
//! use loom_artifact::ArtifactType;
//!
//! let doc = format!(
//!     "{}\nBuyer can place an order.\n{}",
//!     begin_generated("AC-ORD-001", ArtifactType::AcceptanceCriteria),
//!     END_GENERATED,
//! );
//! let parsed = Parser::default().parse_content(&doc, "l1/acceptance-criteria.md");
//! assert_eq!(parsed.artifacts[0].id, "AC-ORD-001");
//! ```

#![warn(unreachable_pub)]

mod error;
mod hasher;
mod headings;
mod layer;
mod markers;
mod parser;
mod splice;

pub use error::{DocumentError, DocumentResult};
pub use hasher::{resolve_location, FileHashInfo, Hasher, HasherConfig, SectionHash};
pub use headings::{heading_sections, HeadingSection};
pub use layer::detect_layer;
pub use markers::{
    begin_generated, begin_manual, has_markers, is_marker_line, Marker, END_GENERATED, END_MANUAL,
    MARKER_TAG,
};
pub use parser::{
    all_artifacts, all_references, is_document, read_document, reference_map, ParseIssue, ParsedDocument,
    ParsedSection, Parser, ParserConfig, Reference, ReferenceKind, SectionKind, Severity,
    DOCUMENT_EXTENSIONS,
};
pub use splice::{extract_manual, replace_section, restore_manual, section_body, ManualRegion, ManualRestore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
