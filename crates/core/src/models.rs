//! Domain model types used throughout Ariadne.
//!
//! These types bridge the bus, the conflict detector, the verifier and the
//! orchestrator. Every persisted record is plain serde JSON.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::patch;

/// Hex-encoded SHA-256 of `input`, truncated to `len` characters.
pub(crate) fn short_sha256(input: &str, len: usize) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..len.min(digest.len())].to_string()
}

// ---------------------------------------------------------------------------
// Diff status
// ---------------------------------------------------------------------------

/// Lifecycle status of a submitted diff.
///
/// `Pending -> Verifying -> {Verified, Rejected}`, then `Verified -> Merged`.
/// `Conflicted` is a named status the default pipeline never assigns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Pending,
    Verifying,
    Verified,
    Rejected,
    Conflicted,
    Merged,
}

impl DiffStatus {
    /// The storage partition a record with this status lives in.
    pub fn partition(self) -> Partition {
        match self {
            Self::Pending | Self::Verifying => Partition::Pending,
            Self::Verified | Self::Conflicted => Partition::Verified,
            Self::Rejected => Partition::Rejected,
            Self::Merged => Partition::Merged,
        }
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// `Rejected` and `Merged` are terminal.
    pub fn can_become(self, next: DiffStatus) -> bool {
        use DiffStatus::*;
        matches!(
            (self, next),
            (Pending, Verifying)
                | (Pending, Rejected)
                // Reclaiming a record abandoned mid-verification.
                | (Verifying, Verifying)
                | (Verifying, Verified)
                | (Verifying, Rejected)
                | (Verified, Merged)
                | (Verified, Rejected)
                | (Verified, Conflicted)
                | (Conflicted, Verified)
                | (Conflicted, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Merged)
    }
}

impl std::fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Verifying => write!(f, "verifying"),
            Self::Verified => write!(f, "verified"),
            Self::Rejected => write!(f, "rejected"),
            Self::Conflicted => write!(f, "conflicted"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// A status-partitioned directory under `diffs/`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Pending,
    Verified,
    Rejected,
    Merged,
}

impl Partition {
    /// Lookup order used by `Bus::get`.
    pub const ALL: [Partition; 4] = [
        Partition::Pending,
        Partition::Verified,
        Partition::Rejected,
        Partition::Merged,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::Merged => "merged",
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "rejected" => Ok(Self::Rejected),
            "merged" => Ok(Self::Merged),
            other => Err(format!(
                "unknown partition '{}': use pending, verified, rejected or merged",
                other
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Line changes
// ---------------------------------------------------------------------------

/// What a hunk does to the lines it covers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LineChangeKind {
    Add,
    Modify,
    Delete,
}

/// A changed line range `[start, end]` in the post-image of a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineChange {
    pub start: u32,
    pub end: u32,
    pub kind: LineChangeKind,
}

impl LineChange {
    pub fn new(start: u32, end: u32, kind: LineChangeKind) -> Self {
        Self { start, end, kind }
    }
}

// ---------------------------------------------------------------------------
// Causal chain
// ---------------------------------------------------------------------------

fn default_call_depth() -> u32 {
    1
}

/// The files, functions, modules and tests believed affected by a diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CausalChain {
    pub diff_id: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    /// Function or type names, optionally `module:name`.
    #[serde(default)]
    pub affected_functions: Vec<String>,
    #[serde(default)]
    pub affected_modules: Vec<String>,
    #[serde(default = "default_call_depth")]
    pub call_depth: u32,
    #[serde(default)]
    pub test_files: Vec<String>,
    #[serde(default = "Utc::now")]
    pub extracted_at: DateTime<Utc>,
}

/// Elements two causal chains have in common.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CausalOverlap {
    pub files: Vec<String>,
    pub functions: Vec<String>,
    pub modules: Vec<String>,
}

impl CausalOverlap {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.functions.is_empty() && self.modules.is_empty()
    }
}

fn intersect(a: &[String], b: &[String]) -> Vec<String> {
    let left: BTreeSet<&String> = a.iter().collect();
    let right: BTreeSet<&String> = b.iter().collect();
    left.intersection(&right).map(|s| s.to_string()).collect()
}

impl CausalChain {
    pub fn new(diff_id: impl Into<String>) -> Self {
        Self {
            diff_id: diff_id.into(),
            affected_files: Vec::new(),
            affected_functions: Vec::new(),
            affected_modules: Vec::new(),
            call_depth: default_call_depth(),
            test_files: Vec::new(),
            extracted_at: Utc::now(),
        }
    }

    pub fn get_overlap(&self, other: &CausalChain) -> CausalOverlap {
        CausalOverlap {
            files: intersect(&self.affected_files, &other.affected_files),
            functions: intersect(&self.affected_functions, &other.affected_functions),
            modules: intersect(&self.affected_modules, &other.affected_modules),
        }
    }

    pub fn overlaps_with(&self, other: &CausalChain) -> bool {
        !self.get_overlap(other).is_empty()
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// A patch submitted by a producer instead of a direct commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diff {
    /// `diff-` + truncated SHA-256 of `content`.
    pub id: String,
    pub work_id: String,
    pub producer_id: String,
    /// Raw `git diff` text.
    pub content: String,
    pub description: String,
    pub status: DiffStatus,
    /// Incremented on every status transition.
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub files_added: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_deleted: Vec<String>,
    #[serde(default)]
    pub line_changes: BTreeMap<String, Vec<LineChange>>,

    #[serde(default)]
    pub causal_chain: Option<CausalChain>,

    #[serde(default)]
    pub verification: Option<VerificationResult>,
    #[serde(default)]
    pub verification_error: Option<String>,

    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Diff {
    /// Deterministic id for a patch body.
    pub fn id_for(content: &str) -> String {
        format!("diff-{}", short_sha256(content, 12))
    }

    /// Build a pending diff from `git diff` output.
    pub fn from_patch(
        work_id: impl Into<String>,
        producer_id: impl Into<String>,
        content: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let summary = patch::parse_patch(&content);
        Self {
            id: Self::id_for(&content),
            work_id: work_id.into(),
            producer_id: producer_id.into(),
            content,
            description: description.into(),
            status: DiffStatus::Pending,
            version: 0,
            files_added: summary.files_added,
            files_modified: summary.files_modified,
            files_deleted: summary.files_deleted,
            line_changes: summary.line_changes,
            causal_chain: None,
            verification: None,
            verification_error: None,
            submitted_at: Utc::now(),
            verified_at: None,
            merged_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_causal_chain(mut self, chain: CausalChain) -> Self {
        self.causal_chain = Some(chain);
        self
    }

    /// Added, modified and deleted files combined.
    pub fn all_affected_files(&self) -> BTreeSet<&str> {
        self.files_added
            .iter()
            .chain(&self.files_modified)
            .chain(&self.files_deleted)
            .map(String::as_str)
            .collect()
    }

    /// The hash part of the id, without the `diff-` prefix.
    pub fn hash_part(&self) -> &str {
        self.id.strip_prefix("diff-").unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Granularity at which two diffs collide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    FileOverlap,
    LineOverlap,
    Semantic,
    Causal,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileOverlap => write!(f, "file_overlap"),
            Self::LineOverlap => write!(f, "line_overlap"),
            Self::Semantic => write!(f, "semantic"),
            Self::Causal => write!(f, "causal"),
        }
    }
}

/// How a pair of conflicting diffs should be sequenced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Apply the earlier-submitted diff first, then the other.
    Sequential,
    /// Combine hunks, then re-verify the result.
    Interleave,
    /// Wait for a human or policy decision.
    Escalate,
    /// Drop the later submission; its record carries the reason.
    Reject,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Interleave => write!(f, "interleave"),
            Self::Escalate => write!(f, "escalate"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "interleave" => Ok(Self::Interleave),
            "escalate" => Ok(Self::Escalate),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown strategy '{}': use sequential, interleave, escalate or reject",
                other
            )),
        }
    }
}

/// A detected incompatibility between two diffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub diff_a_id: String,
    pub diff_b_id: String,
    pub conflict_type: ConflictType,
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub affected_lines: BTreeMap<String, Vec<(u32, u32)>>,
    #[serde(default)]
    pub description: String,
    pub suggested_strategy: MergeStrategy,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolution: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    /// `conflict-` + the leading hash characters of both sides.
    pub fn id_for(a: &Diff, b: &Diff) -> String {
        let prefix = |s: &str| s.chars().take(8).collect::<String>();
        format!("conflict-{}-{}", prefix(a.hash_part()), prefix(b.hash_part()))
    }

    pub fn new(a: &Diff, b: &Diff, conflict_type: ConflictType, strategy: MergeStrategy) -> Self {
        Self {
            id: Self::id_for(a, b),
            diff_a_id: a.id.clone(),
            diff_b_id: b.id.clone(),
            conflict_type,
            affected_files: Vec::new(),
            affected_lines: BTreeMap::new(),
            description: String::new(),
            suggested_strategy: strategy,
            resolved: false,
            resolution: None,
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge result
// ---------------------------------------------------------------------------

/// Outcome of folding several verified diffs into one combined patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub id: String,
    pub diff_ids: Vec<String>,
    pub combined_diff: String,
    pub commit_message: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub conflicts_resolved: Vec<String>,
    #[serde(default)]
    pub verification_passed: bool,
    /// Set once the combined patch is committed.
    #[serde(default)]
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MergeResult {
    /// `merge-` + hash of the ids in the exact order given.
    pub fn id_for(diff_ids: &[String]) -> String {
        format!("merge-{}", short_sha256(&diff_ids.join("-"), 8))
    }

    pub fn failed(diff_ids: &[String], error: impl Into<String>) -> Self {
        Self {
            id: Self::id_for(diff_ids),
            diff_ids: diff_ids.to_vec(),
            combined_diff: String::new(),
            commit_message: String::new(),
            success: false,
            error: Some(error.into()),
            conflicts_resolved: Vec::new(),
            verification_passed: false,
            commit_sha: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Verification result
// ---------------------------------------------------------------------------

/// Pass/fail and error excerpts of one scoped check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    /// The tool was missing and the check was waved through.
    #[serde(default)]
    pub degraded: bool,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            degraded: false,
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Self {
            passed: false,
            errors,
            degraded: false,
        }
    }

    pub fn degraded() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            degraded: true,
        }
    }
}

impl Default for CheckOutcome {
    fn default() -> Self {
        Self::pass()
    }
}

/// Outcome of the scoped test run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestOutcome {
    #[serde(flatten)]
    pub check: CheckOutcome,
    #[serde(default)]
    pub run: u32,
    #[serde(default)]
    pub failed: u32,
}

/// What a verification actually looked at.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationScope {
    pub modules: Vec<String>,
    pub tests: Vec<String>,
}

/// Result of one causal-slice verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub diff_id: String,
    pub passed: bool,
    pub duration_secs: f64,
    /// Set when the scratch workspace could not be prepared.
    #[serde(default)]
    pub setup_error: Option<String>,
    #[serde(default)]
    pub typecheck: CheckOutcome,
    #[serde(default)]
    pub lint: CheckOutcome,
    #[serde(default)]
    pub tests: TestOutcome,
    #[serde(default)]
    pub scope: VerificationScope,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl VerificationResult {
    pub fn new(diff_id: impl Into<String>) -> Self {
        Self {
            diff_id: diff_id.into(),
            passed: false,
            duration_secs: 0.0,
            setup_error: None,
            typecheck: CheckOutcome::pass(),
            lint: CheckOutcome::pass(),
            tests: TestOutcome::default(),
            scope: VerificationScope::default(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Every error excerpt, setup error first.
    pub fn all_errors(&self) -> Vec<String> {
        self.setup_error
            .iter()
            .cloned()
            .chain(self.typecheck.errors.iter().cloned())
            .chain(self.lint.errors.iter().cloned())
            .chain(self.tests.check.errors.iter().cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Bus summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffCounts {
    pub pending: usize,
    pub verified: usize,
    pub rejected: usize,
    pub merged: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictCounts {
    pub total: usize,
    pub unresolved: usize,
}

/// Aggregate counts across all partitions, computed on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusStatus {
    pub initialized: bool,
    pub diffs: DiffCounts,
    pub conflicts: ConflictCounts,
    pub merges: usize,
    pub commits_ready: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = concat!(
        "diff --git a/src/app.py b/src/app.py\n--- a/src/app.py\n",
        "+++ b/src/app.py\n@@ -1,3 +1,4 @@\n import os\n+import sys\n x = 1\n",
        " y = 2\n",
    );

    #[test]
    fn test_status_graph() {
        use DiffStatus::*;
        assert!(Pending.can_become(Verifying));
        assert!(Verifying.can_become(Verified));
        assert!(Verified.can_become(Merged));
        assert!(Verified.can_become(Rejected));
        assert!(!Pending.can_become(Verified));
        assert!(!Verified.can_become(Pending));
        for next in [Pending, Verifying, Verified, Rejected, Conflicted, Merged] {
            assert!(!Rejected.can_become(next), "rejected -> {}", next);
            assert!(!Merged.can_become(next), "merged -> {}", next);
        }
        assert!(Rejected.is_terminal() && Merged.is_terminal());
        assert!(!Verified.is_terminal());
    }

    #[test]
    fn test_identical_content_same_id() {
        let a = Diff::from_patch("w1", "p1", PATCH, "first");
        let b = Diff::from_patch("w2", "p2", PATCH, "second");
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("diff-"));
        assert_eq!(a.id.len(), "diff-".len() + 12);
    }

    #[test]
    fn test_different_content_different_id() {
        let a = Diff::from_patch("w1", "p1", PATCH, "");
        let b = Diff::from_patch("w1", "p1", format!("{}+z = 3\n", PATCH), "");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_merge_id_is_order_sensitive() {
        let ids = vec!["diff-aaa".to_string(), "diff-bbb".to_string()];
        let reversed = vec!["diff-bbb".to_string(), "diff-aaa".to_string()];
        assert_eq!(MergeResult::id_for(&ids), MergeResult::id_for(&ids));
        // Same set, different order: the id changes (not canonicalized).
        assert_ne!(MergeResult::id_for(&ids), MergeResult::id_for(&reversed));
        assert!(MergeResult::id_for(&ids).starts_with("merge-"));
    }

    #[test]
    fn test_conflict_id_uses_hash_prefixes() {
        let a = Diff::from_patch("w1", "p1", PATCH, "");
        let b = Diff::from_patch("w2", "p2", format!("{}+z = 3\n", PATCH), "");
        let id = Conflict::id_for(&a, &b);
        assert_eq!(
            id,
            format!("conflict-{}-{}", &a.hash_part()[..8], &b.hash_part()[..8])
        );
    }

    #[test]
    fn test_status_partitions() {
        assert_eq!(DiffStatus::Pending.partition(), Partition::Pending);
        assert_eq!(DiffStatus::Verifying.partition(), Partition::Pending);
        assert_eq!(DiffStatus::Verified.partition(), Partition::Verified);
        assert_eq!(DiffStatus::Rejected.partition(), Partition::Rejected);
        assert_eq!(DiffStatus::Merged.partition(), Partition::Merged);
    }

    #[test]
    fn test_causal_overlap() {
        let mut a = CausalChain::new("diff-a");
        a.affected_modules = vec!["pkg.core".into(), "pkg.util".into()];
        let mut b = CausalChain::new("diff-b");
        b.affected_modules = vec!["pkg.util".into()];
        let mut c = CausalChain::new("diff-c");
        c.affected_modules = vec!["other".into()];

        assert!(a.overlaps_with(&b));
        assert_eq!(a.get_overlap(&b).modules, vec!["pkg.util".to_string()]);
        assert!(!a.overlaps_with(&c));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("SEQUENTIAL".parse::<MergeStrategy>(), Ok(MergeStrategy::Sequential));
        assert!("merge".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_verification_errors_collected() {
        let mut result = VerificationResult::new("diff-x");
        result.setup_error = Some("no apply".into());
        result.lint = CheckOutcome::fail(vec!["E501".into()]);
        assert_eq!(result.all_errors(), vec!["no apply".to_string(), "E501".to_string()]);
    }
}
