//! TOML-based configuration for Ariadne.
//!
//! Every section and field is optional; a missing file yields the built-in
//! defaults. Lookup order is `./ariadne.toml`, then
//! `<config dir>/ariadne/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::git::CommitIdentity;

/// File name searched for in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "ariadne.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub repo: RepoConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub conflicts: ConflictConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub commit: CommitConfig,
}

// ---------------------------------------------------------------------------
// Repo / bus
// ---------------------------------------------------------------------------

/// The repository the commit phase mutates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoConfig {
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
        }
    }
}

/// Bus location. `None` means `<repo>/.ariadne/bus`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Scoped-check commands and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyConfig {
    /// Type checker; affected module files are appended.
    #[serde(default = "default_typecheck_cmd")]
    pub typecheck_cmd: Vec<String>,

    /// Linter; changed files are appended.
    #[serde(default = "default_lint_cmd")]
    pub lint_cmd: Vec<String>,

    /// Test runner; matched test files are appended.
    #[serde(default = "default_test_cmd")]
    pub test_cmd: Vec<String>,

    #[serde(default = "default_typecheck_timeout")]
    pub typecheck_timeout_secs: u64,

    #[serde(default = "default_lint_timeout")]
    pub lint_timeout_secs: u64,

    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// Extension (without the dot) of files treated as source modules.
    #[serde(default = "default_source_extension")]
    pub source_extension: String,

    /// Directories stripped from module names (`src/pkg/a.py` -> `pkg.a`).
    #[serde(default = "default_source_roots")]
    pub source_roots: Vec<String>,

    /// Test-file globs; `{name}` is a module name part, `{ext}` the
    /// source extension.
    #[serde(default = "default_test_patterns")]
    pub test_patterns: Vec<String>,

    /// Globs never copied into the scratch workspace.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Verifications allowed to run at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_typecheck_cmd() -> Vec<String> {
    vec!["mypy".into(), "--no-error-summary".into()]
}
fn default_lint_cmd() -> Vec<String> {
    vec!["ruff".into(), "check".into()]
}
fn default_test_cmd() -> Vec<String> {
    vec!["pytest".into(), "-x".into(), "-q".into()]
}
fn default_typecheck_timeout() -> u64 {
    60
}
fn default_lint_timeout() -> u64 {
    30
}
fn default_test_timeout() -> u64 {
    120
}
fn default_source_extension() -> String {
    "py".into()
}
fn default_source_roots() -> Vec<String> {
    vec!["src".into()]
}
fn default_test_patterns() -> Vec<String> {
    vec![
        "test_{name}.{ext}".into(),
        "{name}_test.{ext}".into(),
        "test_{name}*.{ext}".into(),
        "tests/**/test_{name}.{ext}".into(),
    ]
}
fn default_exclude() -> Vec<String> {
    [
        ".git",
        ".ariadne",
        "__pycache__",
        "*.pyc",
        ".venv",
        "venv",
        "target",
        "node_modules",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_parallel() -> usize {
    4
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            typecheck_cmd: default_typecheck_cmd(),
            lint_cmd: default_lint_cmd(),
            test_cmd: default_test_cmd(),
            typecheck_timeout_secs: default_typecheck_timeout(),
            lint_timeout_secs: default_lint_timeout(),
            test_timeout_secs: default_test_timeout(),
            source_extension: default_source_extension(),
            source_roots: default_source_roots(),
            test_patterns: default_test_patterns(),
            exclude: default_exclude(),
            max_parallel: default_max_parallel(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflicts / daemon / commit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConflictConfig {
    /// Run the causal-chain level for pairs that share no file.
    #[serde(default)]
    pub causal_level: bool,
}

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Seconds between cycles (default 5).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Stop after this many consecutive cycles that processed nothing.
    #[serde(default)]
    pub max_idle_cycles: Option<u32>,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_idle_cycles: None,
            log_level: default_log_level(),
        }
    }
}

/// Identity and policy for pipeline commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Commit automatically at the end of each cycle.
    #[serde(default)]
    pub auto_commit: bool,
}

fn default_author_name() -> String {
    "Ariadne".into()
}
fn default_author_email() -> String {
    "ariadne@localhost".into()
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
            auto_commit: false,
        }
    }
}

impl CommitConfig {
    pub fn identity(&self) -> CommitIdentity {
        CommitIdentity {
            name: self.author_name.clone(),
            email: self.author_email.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file on disk.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Load from the first file in `candidates` that exists, else defaults.
    ///
    /// Returns the path that was used, if any.
    pub fn load_first(candidates: &[PathBuf]) -> Result<(Self, Option<PathBuf>), ConfigError> {
        for candidate in candidates {
            if candidate.is_file() {
                let config = Self::load_from_file(candidate)?;
                return Ok((config, Some(candidate.clone())));
            }
        }
        debug!("no configuration file found, using defaults");
        Ok((Self::default(), None))
    }

    /// Where the bus lives for this configuration.
    pub fn bus_root(&self) -> PathBuf {
        match &self.bus.root {
            Some(root) => root.clone(),
            None => self.repo.path.join(".ariadne").join("bus"),
        }
    }

    /// Validate semantic constraints that cannot be expressed in the type
    /// system alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let commands = [
            ("verify.typecheck_cmd", &self.verify.typecheck_cmd),
            ("verify.lint_cmd", &self.verify.lint_cmd),
            ("verify.test_cmd", &self.verify.test_cmd),
        ];
        for (field, cmd) in commands {
            if cmd.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(invalid(field, "command must name a program"));
            }
        }

        let timeouts = [
            ("verify.typecheck_timeout_secs", self.verify.typecheck_timeout_secs),
            ("verify.lint_timeout_secs", self.verify.lint_timeout_secs),
            ("verify.test_timeout_secs", self.verify.test_timeout_secs),
        ];
        for (field, secs) in timeouts {
            if secs == 0 {
                return Err(invalid(field, "timeout must be > 0"));
            }
        }

        if self.verify.max_parallel == 0 {
            return Err(invalid("verify.max_parallel", "parallelism must be > 0"));
        }
        if self.verify.source_extension.trim().is_empty() {
            return Err(invalid("verify.source_extension", "extension must not be empty"));
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(invalid("daemon.poll_interval_secs", "poll interval must be > 0"));
        }
        if self.commit.author_name.trim().is_empty() {
            return Err(invalid("commit.author_name", "author name must not be empty"));
        }
        if self.commit.author_email.trim().is_empty() {
            return Err(invalid("commit.author_email", "author email must not be empty"));
        }

        Ok(())
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}
