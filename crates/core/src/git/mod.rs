//! Git operations against the shared working tree.

pub mod client;

pub use client::{apply_patch, git_available, ApplyMode, CommitIdentity, CommitOutcome, GitClient};
