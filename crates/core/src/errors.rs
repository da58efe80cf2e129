//! Error types for the Ariadne core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type.
//!
//! Verification and merge outcomes are *data*, not errors: they are carried
//! on result objects as strings rendered from [`PipelineError`]. Only
//! programmer or infrastructure faults travel through `Result::Err`.

use thiserror::Error;

use crate::models::DiffStatus;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another orchestration cycle holds the running flag.
    #[error("an orchestration cycle is already running (started {started_at})")]
    AlreadyRunning { started_at: String },
}

// ---------------------------------------------------------------------------
// Bus errors
// ---------------------------------------------------------------------------

/// Errors from the directory-backed diff bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus root has no manifest; `initialize` was never called.
    #[error("bus not initialized at '{0}' (run `ariadne init`)")]
    NotInitialized(String),

    /// The requested diff ID is absent from every partition.
    #[error("diff not found: {0}")]
    DiffNotFound(String),

    /// The requested conflict ID does not exist.
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// A record on disk could not be decoded.
    #[error("corrupt record at '{path}': {detail}")]
    CorruptRecord { path: String, detail: String },

    /// The record changed since the caller last read it: its status is not
    /// one the caller expected, or its version moved on.
    #[error("stale transition of {id}: expected {expected}, found {actual}")]
    StaleTransition {
        id: String,
        expected: String,
        actual: String,
    },

    /// The status graph has no edge between the two states.
    #[error("invalid transition of {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DiffStatus,
        to: DiffStatus,
    },

    /// A per-record or commit lock could not be acquired.
    #[error("failed to lock '{path}': {detail}")]
    LockFailed { path: String, detail: String },

    /// JSON encoding failure.
    #[error("bus serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O wrapper.
    #[error("bus I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git operations against the shared working tree.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// `git apply` rejected a patch.
    #[error("git apply failed: {0}")]
    ApplyFailed(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Pipeline outcomes
// ---------------------------------------------------------------------------

/// Failure categories observed while driving diffs through the pipeline.
///
/// These are rendered into the error strings stored on verification and
/// merge results. None of them aborts a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The scratch copy could not be built or the patch does not apply.
    #[error("workspace setup failed: {0}")]
    WorkspaceSetup(String),

    /// A check tool is not installed; the check is treated as passed.
    #[error("check tool unavailable: {tool}")]
    CheckToolUnavailable { tool: String },

    /// A check exceeded its own time bound.
    #[error("{check} timed out after {secs}s")]
    CheckTimeout { check: String, secs: u64 },

    /// Commit phase blocked by conflicts awaiting a decision.
    #[error("cannot commit: {count} unresolved conflict(s) remain")]
    ConflictUnresolved { count: usize },

    /// The combined patch did not apply to the real repository.
    #[error("failed to apply combined diff: {0}")]
    MergeApply(String),

    /// Creating the commit failed.
    #[error("failed to commit: {0}")]
    Commit(String),

    /// A merge request referenced an id that is in no partition.
    #[error("diff not found: {0}")]
    MissingDiff(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = BusError::NotInitialized("/tmp/bus".into());
        assert!(err.to_string().contains("/tmp/bus"));

        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = PipelineError::CheckTimeout {
            check: "typecheck".into(),
            secs: 60,
        };
        assert_eq!(err.to_string(), "typecheck timed out after 60s");

        let err = PipelineError::MissingDiff("diff-abc".into());
        assert_eq!(err.to_string(), "diff not found: diff-abc");
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let bus_err = BusError::DiffNotFound("diff-1".into());
        let core_err: CoreError = bus_err.into();
        assert!(matches!(core_err, CoreError::Bus(_)));

        let cfg_err = ConfigError::ParseError("bad".into());
        let core_err: CoreError = cfg_err.into();
        assert!(matches!(core_err, CoreError::Config(_)));
    }
}
