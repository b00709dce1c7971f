//! Testing utilities for the loom workspace
//!
//! Shared project fixtures, deriver stubs and tracing setup.

#![allow(missing_docs)]

use loom_artifact::{Artifact, ArtifactType, Location};
use loom_core::{DerivationState, Deriver};
use loom_document::{begin_generated, begin_manual, Hasher, END_GENERATED, END_MANUAL};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG`; later calls do nothing
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A generated region with `body` between its markers
pub fn generated_section(id: &str, artifact_type: ArtifactType, body: &str) -> String {
    format!("{}\n{body}\n{END_GENERATED}", begin_generated(id, artifact_type))
}

/// A manual region named `name`
pub fn manual_section(name: &str, body: &str) -> String {
    format!("{}\n{body}\n{END_MANUAL}", begin_manual(name))
}

/// Temporary project directory
pub struct ProjectFixture {
    dir: TempDir,
}

impl ProjectFixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Write `text` to `rel`, creating parent directories
    pub fn write(&self, rel: &str, text: &str) {
        let path = self.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.join(rel)).unwrap()
    }

    pub fn read_bytes(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.join(rel)).unwrap()
    }

    /// Artifact anchored at its own section in `rel`, hashed from disk
    pub fn artifact(&self, id: &str, artifact_type: ArtifactType, rel: &str) -> Artifact {
        let mut artifact = Artifact::new(id, artifact_type, Location::file(rel).with_anchor(id));
        artifact.content_hash = Some(Hasher::default().hash_artifact(&artifact, self.path()).unwrap());
        artifact
    }
}

impl Default for ProjectFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// `US-ORD-001 -> AC-ORD-001 -> TS-ORD-001`, each in its own layer file
///
/// Every artifact is current: recorded upstream hashes equal the hashes on
/// disk. `AC-ORD-001` carries a manual region named `notes`.
pub fn chain_project() -> (ProjectFixture, DerivationState) {
    let fixture = ProjectFixture::new();
    fixture.write(
        "l0/stories.md",
        &format!(
            "# Stories\n\n{}\n",
            generated_section("US-ORD-001", ArtifactType::UserStory, "As a buyer I can place an order.")
        ),
    );
    fixture.write(
        "l1/criteria.md",
        &format!(
            "# Criteria\n\n{}\n",
            generated_section(
                "AC-ORD-001",
                ArtifactType::AcceptanceCriteria,
                &format!("The order total includes tax.\n{}", manual_section("notes", "Reviewed by finance."))
            )
        ),
    );
    fixture.write(
        "l2/spec.md",
        &format!(
            "# Spec\n\n{}\n",
            generated_section("TS-ORD-001", ArtifactType::TechSpec, "Totals are computed server side.")
        ),
    );

    let us = fixture.artifact("US-ORD-001", ArtifactType::UserStory, "l0/stories.md");
    let mut ac = fixture
        .artifact("AC-ORD-001", ArtifactType::AcceptanceCriteria, "l1/criteria.md")
        .with_upstream("US-ORD-001", us.content_hash);
    ac.manual_sections = vec!["notes".to_string()];
    let ts = fixture
        .artifact("TS-ORD-001", ArtifactType::TechSpec, "l2/spec.md")
        .with_upstream("AC-ORD-001", ac.content_hash);

    let mut state = DerivationState::new("shop");
    state.set_artifact(us);
    state.set_artifact(ac);
    state.set_artifact(ts);
    state.rebuild_graph();
    (fixture, state)
}

/// Deriver that echoes its inputs and records every call
#[derive(Debug, Default)]
pub struct EchoDeriver {
    calls: Mutex<Vec<String>>,
}

impl EchoDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// IDs derived so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

/// `"<id> derived from [<upstream content>; ...]"`
pub fn echo_content(artifact: &Artifact, upstream: &BTreeMap<String, String>) -> String {
    let inputs: Vec<&str> = upstream.values().map(String::as_str).collect();
    format!("{} derived from [{}]", artifact.id, inputs.join("; "))
}

#[async_trait::async_trait]
impl Deriver for EchoDeriver {
    async fn derive(
        &self,
        artifact: &Artifact,
        upstream: &BTreeMap<String, String>,
        _project_dir: &Path,
    ) -> anyhow::Result<String> {
        self.calls.lock().push(artifact.id.clone());
        Ok(echo_content(artifact, upstream))
    }
}

/// Deriver that fails for chosen IDs and echoes for the rest
#[derive(Debug, Default)]
pub struct FailingDeriver {
    failing: BTreeSet<String>,
}

impl FailingDeriver {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait::async_trait]
impl Deriver for FailingDeriver {
    async fn derive(
        &self,
        artifact: &Artifact,
        upstream: &BTreeMap<String, String>,
        _project_dir: &Path,
    ) -> anyhow::Result<String> {
        if self.failing.contains(&artifact.id) {
            anyhow::bail!("generator refused {}", artifact.id);
        }
        Ok(echo_content(artifact, upstream))
    }
}
