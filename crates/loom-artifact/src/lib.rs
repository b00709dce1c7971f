//! Loom Artifact Model
//!
//! Content-addressed artifacts for the loom derivation engine.
//!
//! # Core Concepts
//!
//! - [`Artifact`]: One derivable unit, located in a document section
//! - [`ArtifactType`] / [`Layer`]: What an artifact is and which tier it lives in
//! - [`ArtifactStatus`]: Derivation status computed by the tracker
//! - [`ContentHash`]: Prefixed 32-byte digest (`sha256:<hex>` or `blake3:<hex>`)
//! - [`Decision`]: Recorded question/answer that shaped derivation
//!
//! # Example
//!
//! ```rust
//! use loom_artifact::{Artifact, ArtifactType, ContentHash, Location};
//!
//! let story = Artifact::new("US-ORD-001", ArtifactType::UserStory, Location::file("l0/stories.md"))
//!     .with_hash(ContentHash::sha256(b"As a buyer..."));
//! assert!(story.is_root());
//! assert_eq!(loom_artifact::type_from_id("AC-ORD-001"), Some(ArtifactType::AcceptanceCriteria));
//! ```

#![warn(unreachable_pub)]

mod artifact;
mod hash;
mod id;

pub use artifact::{
    Artifact, ArtifactStatus, ArtifactType, Decision, Layer, Location, ModelError,
};
pub use hash::{ContentHash, HashAlgorithm, HashError, StreamingHasher};
pub use id::{extract_ids, find_ids, is_artifact_id, type_from_id};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
