//! Engine configuration
//!
//! Every entry point takes its configuration explicitly. An optional
//! `<state_dir>/config.toml` overrides the defaults field by field.

use crate::error::ConfigError;
use loom_document::{HasherConfig, ParserConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default state directory name, relative to the project root
pub const DEFAULT_STATE_DIR: &str = ".loom";

/// Config file name inside the state directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Project root
    pub project_dir: PathBuf,
    /// State directory, relative to `project_dir` unless absolute
    pub state_dir: PathBuf,
    /// Hashing
    pub hasher: HasherConfig,
    /// Document parsing
    pub parser: ParserConfig,
    /// Derivation batches
    pub executor: ExecutorConfig,
    /// State file locking
    pub lock: LockConfig,
    /// Migration of unmarked projects
    pub migration: MigrationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            hasher: HasherConfig::default(),
            parser: ParserConfig::default(),
            executor: ExecutorConfig::default(),
            lock: LockConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `project_dir`
    #[inline]
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults, overridden by `<project_dir>/.loom/config.toml` when present
    ///
    /// # Errors
    /// [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load(project_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let project_dir = project_dir.into();
        let path = project_dir.join(DEFAULT_STATE_DIR).join(CONFIG_FILE_NAME);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::new(project_dir));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
        config.project_dir = project_dir;
        Ok(config)
    }

    /// Parse from TOML; missing keys keep their defaults
    ///
    /// # Errors
    /// The TOML deserialization error.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Absolute or project-relative state directory
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            self.project_dir.join(&self.state_dir)
        }
    }

    /// With a different state directory
    #[inline]
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// With dry run enabled or disabled for both derivation and migration
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.executor.dry_run = dry_run;
        self.migration.dry_run = dry_run;
        self
    }

    /// With a deriver concurrency limit
    #[inline]
    #[must_use]
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.executor.max_parallel = max;
        self
    }

    /// With hashing settings
    #[inline]
    #[must_use]
    pub fn with_hasher(mut self, hasher: HasherConfig) -> Self {
        self.hasher = hasher;
        self
    }

    /// With parser settings
    #[inline]
    #[must_use]
    pub fn with_parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    /// With lock settings
    #[inline]
    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// With a migration backup directory
    #[inline]
    #[must_use]
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migration.backup_dir = Some(dir.into());
        self
    }
}

/// Derivation batch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Plan and invoke the deriver, but write nothing
    pub dry_run: bool,
    /// Carry manual regions across regeneration
    pub preserve_manual: bool,
    /// Deriver calls in flight within one level
    pub max_parallel: usize,
    /// Save state after every derived artifact
    pub persist_each: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            preserve_manual: true,
            max_parallel: 4,
            persist_each: true,
        }
    }
}

/// Lock file timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Give up acquiring after this long
    pub timeout_ms: u64,
    /// Break a lock file older than this
    pub stale_after_ms: u64,
    /// Retry interval while waiting
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            stale_after_ms: 300_000,
            poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    /// Acquisition timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Age after which a lock is broken
    #[inline]
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Retry interval
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Migration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Report what would change without rewriting files
    pub dry_run: bool,
    /// Copy each file here before rewriting it
    pub backup_dir: Option<PathBuf>,
    /// Directories searched for specification documents, relative to the project
    pub spec_dirs: Vec<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        let layers = ["l0", "l1", "l2", "l3"];
        let spec_dirs = std::iter::once(Path::new(""))
            .chain(["specs", "spec", "docs"].iter().map(Path::new))
            .flat_map(|base| layers.iter().map(move |layer| base.join(layer)))
            .collect();
        Self {
            dry_run: false,
            backup_dir: None,
            spec_dirs,
        }
    }
}
