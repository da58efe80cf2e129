//! Merge records and commit staging directories.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{read_json, write_bytes_atomic, write_json_atomic, Bus};
use crate::errors::{BusError, PipelineError};
use crate::models::{Diff, MergeResult};

/// Snapshot written to `commits/{merge_id}/verification.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitMetadata {
    pub merge_id: String,
    pub diff_count: usize,
    pub prepared_at: DateTime<Utc>,
    pub repo_path: String,
    pub verification_passed: bool,
}

/// Concatenate patch bodies, each terminated by a newline so the next
/// `diff --git` header starts on its own line.
pub fn combine_patches<'a>(contents: impl IntoIterator<Item = &'a str>) -> String {
    let mut combined = String::new();
    for content in contents {
        combined.push_str(content);
        if !content.ends_with('\n') {
            combined.push('\n');
        }
    }
    combined
}

fn default_message(diffs: &[Diff]) -> String {
    let lines: Vec<String> = diffs
        .iter()
        .map(|d| match d.description.trim() {
            "" => format!("- {} ({})", d.work_id, d.producer_id),
            desc => format!("- {}", desc),
        })
        .collect();
    format!("Merged work from parallel workers:\n\n{}", lines.join("\n"))
}

impl Bus {
    fn merge_path(&self, id: &str) -> PathBuf {
        self.merges_dir().join(format!("{}.json", id))
    }

    /// Combine the given diffs into one merge record.
    ///
    /// If any id is missing the returned result is a failure and nothing is
    /// persisted. This does not touch the repository.
    pub fn merge_diffs(
        &self,
        diff_ids: &[String],
        message: Option<&str>,
    ) -> Result<MergeResult, BusError> {
        self.ensure_initialized()?;

        let mut diffs = Vec::with_capacity(diff_ids.len());
        for id in diff_ids {
            match self.get(id)? {
                Some(diff) => diffs.push(diff),
                None => {
                    warn!(diff_id = %id, "merge aborted, diff missing");
                    return Ok(MergeResult::failed(
                        diff_ids,
                        PipelineError::MissingDiff(id.clone()).to_string(),
                    ));
                }
            }
        }

        let combined = combine_patches(diffs.iter().map(|d| d.content.as_str()));
        let commit_message = message
            .map(str::to_string)
            .unwrap_or_else(|| default_message(&diffs));

        let result = MergeResult {
            id: MergeResult::id_for(diff_ids),
            diff_ids: diff_ids.to_vec(),
            combined_diff: combined,
            commit_message,
            success: true,
            error: None,
            conflicts_resolved: Vec::new(),
            verification_passed: diffs.iter().all(|d| {
                d.verification.as_ref().is_some_and(|v| v.passed)
            }),
            commit_sha: None,
            created_at: Utc::now(),
        };
        self.save_merge(&result)?;
        info!(merge_id = %result.id, diffs = diff_ids.len(), "merge prepared");
        Ok(result)
    }

    pub fn save_merge(&self, merge: &MergeResult) -> Result<(), BusError> {
        self.ensure_initialized()?;
        write_json_atomic(&self.merge_path(&merge.id), merge)
    }

    pub fn get_merge(&self, id: &str) -> Result<Option<MergeResult>, BusError> {
        let path = self.merge_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Materialize `commits/{merge_id}/` and return its path.
    pub fn prepare_commit(
        &self,
        merge: &MergeResult,
        repo_path: &Path,
    ) -> Result<PathBuf, BusError> {
        self.ensure_initialized()?;
        let dir = self.commits_dir().join(&merge.id);
        std::fs::create_dir_all(&dir)?;

        write_bytes_atomic(&dir.join("combined.diff"), merge.combined_diff.as_bytes())?;

        let mut message = format!("{}\n\nMerged diffs:\n", merge.commit_message);
        for id in &merge.diff_ids {
            message.push_str(&format!("  - {}\n", id));
        }
        write_bytes_atomic(&dir.join("message.md"), message.as_bytes())?;

        let metadata = CommitMetadata {
            merge_id: merge.id.clone(),
            diff_count: merge.diff_ids.len(),
            prepared_at: Utc::now(),
            repo_path: repo_path.display().to_string(),
            verification_passed: merge.verification_passed,
        };
        write_json_atomic(&dir.join("verification.json"), &metadata)?;

        Ok(dir)
    }
}
