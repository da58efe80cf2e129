//! Multi-level conflict detection between submitted diffs.
//!
//! Levels, short-circuiting at the first that applies:
//! 1. file overlap (disjoint touched-file sets never conflict),
//! 2. delete/modify on a shared file,
//! 3. hunk ranges within [`LINE_BUFFER`] lines of each other,
//! 4. file overlap without line overlap.
//!
//! A causal-chain level exists separately ([`ConflictDetector::analyze_causal`])
//! and only joins the batch path when enabled with
//! [`ConflictDetector::with_causal_checks`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{CausalChain, CausalOverlap, Conflict, ConflictType, Diff, MergeStrategy};

/// Lines of patch context; hunks closer than this collide.
pub const LINE_BUFFER: u32 = 3;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How dangerous a conflict is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    /// Same file, different sections.
    Low,
    /// Shared causal chain, no shared file.
    Medium,
    /// Same lines (within the context buffer).
    High,
    /// Delete/modify.
    Critical,
}

impl std::fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Detailed result of analysing one pair of diffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub conflict: Conflict,
    pub severity: ConflictSeverity,
    pub auto_resolvable: bool,
    pub suggested_strategy: MergeStrategy,
    pub resolution_steps: Vec<String>,
    pub risk_factors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless pairwise and batch conflict analysis.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    causal_checks: bool,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also run the causal-chain level for pairs that share no file.
    pub fn with_causal_checks(mut self, enabled: bool) -> Self {
        self.causal_checks = enabled;
        self
    }

    /// Analyze two diffs. `None` means they do not conflict.
    pub fn analyze_pair(&self, a: &Diff, b: &Diff) -> Option<ConflictAnalysis> {
        let files_a = a.all_affected_files();
        let files_b = b.all_affected_files();
        let overlapping: BTreeSet<&str> = files_a.intersection(&files_b).copied().collect();

        if overlapping.is_empty() {
            if self.causal_checks {
                return self.analyze_causal(a, b);
            }
            return None;
        }

        if let Some(analysis) = check_delete_modify(a, b, &overlapping) {
            return Some(analysis);
        }

        let line_conflicts = check_line_overlap(a, b, &overlapping);
        let files_list = join(overlapping.iter().copied());

        let (severity, auto_resolvable, strategy, conflict_type, risk_factors) =
            if line_conflicts.is_empty() {
                (
                    ConflictSeverity::Low,
                    true,
                    MergeStrategy::Sequential,
                    ConflictType::FileOverlap,
                    vec![format!("Same files but different sections: {}", files_list)],
                )
            } else {
                (
                    ConflictSeverity::High,
                    false,
                    MergeStrategy::Escalate,
                    ConflictType::LineOverlap,
                    vec![
                        format!(
                            "Same lines modified in: {}",
                            join(line_conflicts.keys().map(String::as_str))
                        ),
                        "Manual review required to determine correct merge order".to_string(),
                    ],
                )
            };

        let mut conflict = Conflict::new(a, b, conflict_type, strategy);
        conflict.affected_files = overlapping.iter().map(|f| f.to_string()).collect();
        conflict.description = describe(a, b, &overlapping, &line_conflicts);
        conflict.affected_lines = line_conflicts;

        debug!(
            conflict_id = %conflict.id,
            kind = %conflict.conflict_type,
            %severity,
            "conflict detected"
        );

        Some(ConflictAnalysis {
            conflict,
            severity,
            auto_resolvable,
            suggested_strategy: strategy,
            resolution_steps: resolution_steps(strategy, a, b),
            risk_factors,
        })
    }

    /// Every distinct unordered pair, most severe first.
    ///
    /// The sort is stable, so pairs of equal severity keep scan order.
    pub fn analyze_all(&self, diffs: &[Diff]) -> Vec<ConflictAnalysis> {
        let mut analyses = Vec::new();
        for (i, a) in diffs.iter().enumerate() {
            for b in &diffs[i + 1..] {
                if let Some(analysis) = self.analyze_pair(a, b) {
                    analyses.push(analysis);
                }
            }
        }
        analyses.sort_by_key(|analysis| Reverse(analysis.severity));

        if !analyses.is_empty() {
            info!(diffs = diffs.len(), conflicts = analyses.len(), "conflict analysis complete");
        }
        analyses
    }

    /// MEDIUM-severity analysis of two diffs whose causal chains overlap.
    ///
    /// Both diffs must carry a causal chain. This level does not look at
    /// file overlap; [`analyze_pair`](Self::analyze_pair) only consults it
    /// for pairs that share no file.
    pub fn analyze_causal(&self, a: &Diff, b: &Diff) -> Option<ConflictAnalysis> {
        let chain_a = a.causal_chain.as_ref()?;
        let chain_b = b.causal_chain.as_ref()?;
        let overlap = check_causal_conflict(chain_a, chain_b)?;

        let strategy = MergeStrategy::Interleave;
        let mut conflict = Conflict::new(a, b, ConflictType::Causal, strategy);
        conflict.affected_files = overlap.files.clone();
        conflict.description = format!(
            "Causal conflict between {} and {}\nShared modules: {}\nShared functions: {}",
            a.work_id,
            b.work_id,
            join(overlap.modules.iter().map(String::as_str)),
            join(overlap.functions.iter().map(String::as_str)),
        );

        debug!(conflict_id = %conflict.id, "causal conflict detected");

        Some(ConflictAnalysis {
            conflict,
            severity: ConflictSeverity::Medium,
            auto_resolvable: true,
            suggested_strategy: strategy,
            resolution_steps: resolution_steps(strategy, a, b),
            risk_factors: vec![
                "Changes affect same code paths - verification must run both".to_string(),
            ],
        })
    }
}

/// Overlap between two causal chains, or `None` when they are independent.
pub fn check_causal_conflict(a: &CausalChain, b: &CausalChain) -> Option<CausalOverlap> {
    let overlap = a.get_overlap(b);
    if overlap.is_empty() {
        None
    } else {
        Some(overlap)
    }
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

fn check_delete_modify(
    a: &Diff,
    b: &Diff,
    overlapping: &BTreeSet<&str>,
) -> Option<ConflictAnalysis> {
    let contains = |list: &[String], path: &str| list.iter().any(|p| p == path);

    let path = overlapping.iter().copied().find(|path| {
        (contains(&a.files_deleted, path) && contains(&b.files_modified, path))
            || (contains(&b.files_deleted, path) && contains(&a.files_modified, path))
    })?;

    let strategy = MergeStrategy::Escalate;
    let mut conflict = Conflict::new(a, b, ConflictType::Semantic, strategy);
    conflict.affected_files = vec![path.to_string()];
    conflict.description = format!(
        "Delete/modify conflict: one diff deletes {}, other modifies it",
        path
    );

    debug!(conflict_id = %conflict.id, path, "delete/modify conflict detected");

    Some(ConflictAnalysis {
        conflict,
        severity: ConflictSeverity::Critical,
        auto_resolvable: false,
        suggested_strategy: strategy,
        resolution_steps: vec![
            "Determine if file should be deleted or kept".to_string(),
            "If kept, merge the modification".to_string(),
            "If deleted, discard the modification".to_string(),
        ],
        risk_factors: vec![
            "One worker deleted a file another modified".to_string(),
            "Cannot auto-resolve - requires human decision".to_string(),
        ],
    })
}

/// Ranges conflict unless they stay disjoint after padding by [`LINE_BUFFER`].
fn ranges_collide(start_a: u32, end_a: u32, start_b: u32, end_b: u32) -> bool {
    !(end_a.saturating_add(LINE_BUFFER) < start_b || end_b.saturating_add(LINE_BUFFER) < start_a)
}

fn check_line_overlap(
    a: &Diff,
    b: &Diff,
    overlapping: &BTreeSet<&str>,
) -> BTreeMap<String, Vec<(u32, u32)>> {
    let mut result: BTreeMap<String, Vec<(u32, u32)>> = BTreeMap::new();

    for path in overlapping {
        let (Some(lines_a), Some(lines_b)) = (a.line_changes.get(*path), b.line_changes.get(*path))
        else {
            continue;
        };
        for la in lines_a {
            for lb in lines_b {
                if ranges_collide(la.start, la.end, lb.start, lb.end) {
                    // Buffer-only hits have no literal intersection; keep
                    // the gap between them as an ordered range.
                    let lo = la.start.max(lb.start);
                    let hi = la.end.min(lb.end);
                    result
                        .entry(path.to_string())
                        .or_default()
                        .push((lo.min(hi), lo.max(hi)));
                }
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(", ")
}

fn describe(
    a: &Diff,
    b: &Diff,
    overlapping: &BTreeSet<&str>,
    line_conflicts: &BTreeMap<String, Vec<(u32, u32)>>,
) -> String {
    let mut parts = vec![
        format!("Conflict between {} and {}", a.work_id, b.work_id),
        format!("Files affected: {}", join(overlapping.iter().copied())),
    ];
    if !line_conflicts.is_empty() {
        parts.push("Line-level conflicts:".to_string());
        for (path, ranges) in line_conflicts {
            let ranges: Vec<String> = ranges.iter().map(|(s, e)| format!("{}-{}", s, e)).collect();
            parts.push(format!("  {}: lines {}", path, ranges.join(", ")));
        }
    }
    parts.join("\n")
}

/// Step-by-step script for carrying out `strategy` on the pair.
pub fn resolution_steps(strategy: MergeStrategy, a: &Diff, b: &Diff) -> Vec<String> {
    let (first, second) = if b.submitted_at < a.submitted_at {
        (b, a)
    } else {
        (a, b)
    };
    match strategy {
        MergeStrategy::Sequential => vec![
            format!(
                "Apply {} first (submitted: {})",
                first.id,
                first.submitted_at.to_rfc3339()
            ),
            format!("Then apply {}", second.id),
            "Run verification on combined result".to_string(),
        ],
        MergeStrategy::Interleave => vec![
            "Combine hunks from both diffs into one patch".to_string(),
            "Review merge result for correctness".to_string(),
            "Run verification on merged result".to_string(),
        ],
        MergeStrategy::Escalate => vec![
            "Present conflict for review".to_string(),
            "Show both diffs side-by-side".to_string(),
            "Wait for resolution decision".to_string(),
            "Apply chosen resolution".to_string(),
        ],
        MergeStrategy::Reject => vec![
            format!("Reject {} (later submission)", second.id),
            format!("Keep {}", first.id),
            "Notify worker of rejection with reason".to_string(),
            "Worker can re-submit after rebasing".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineChange, LineChangeKind};

    fn diff(id: &str, modified: &[&str], deleted: &[&str]) -> Diff {
        let mut d = Diff::from_patch("work-".to_string() + id, "p", id, "");
        d.id = format!("diff-{}", id);
        d.files_modified = modified.iter().map(|s| s.to_string()).collect();
        d.files_deleted = deleted.iter().map(|s| s.to_string()).collect();
        d
    }

    fn with_lines(mut d: Diff, path: &str, ranges: &[(u32, u32)]) -> Diff {
        d.line_changes.insert(
            path.to_string(),
            ranges
                .iter()
                .map(|(s, e)| LineChange::new(*s, *e, LineChangeKind::Modify))
                .collect(),
        );
        d
    }

    #[test]
    fn test_disjoint_files_no_conflict() {
        let a = diff("aaaaaaaa1111", &["a.py"], &[]);
        let b = diff("bbbbbbbb2222", &["b.py"], &[]);
        assert!(ConflictDetector::new().analyze_pair(&a, &b).is_none());
    }

    #[test]
    fn test_delete_modify_is_critical() {
        let a = with_lines(diff("aaaaaaaa1111", &[], &["shared.py"]), "shared.py", &[(0, 0)]);
        let b = with_lines(diff("bbbbbbbb2222", &["shared.py"], &[]), "shared.py", &[(5, 9)]);

        let analysis = ConflictDetector::new().analyze_pair(&a, &b).unwrap();
        assert_eq!(analysis.severity, ConflictSeverity::Critical);
        assert_eq!(analysis.suggested_strategy, MergeStrategy::Escalate);
        assert!(!analysis.auto_resolvable);
        assert_eq!(analysis.conflict.conflict_type, ConflictType::Semantic);
        assert_eq!(analysis.conflict.affected_files, vec!["shared.py".to_string()]);
        assert_eq!(analysis.resolution_steps.len(), 3);
    }

    #[test]
    fn test_delete_modify_either_direction() {
        let a = diff("aaaaaaaa1111", &["x.py"], &[]);
        let b = diff("bbbbbbbb2222", &[], &["x.py"]);
        let analysis = ConflictDetector::new().analyze_pair(&a, &b).unwrap();
        assert_eq!(analysis.severity, ConflictSeverity::Critical);
    }

    #[test]
    fn test_file_overlap_without_lines_is_low() {
        let a = with_lines(diff("aaaaaaaa1111", &["m.py"], &[]), "m.py", &[(1, 5)]);
        let b = with_lines(diff("bbbbbbbb2222", &["m.py"], &[]), "m.py", &[(40, 45)]);

        let analysis = ConflictDetector::new().analyze_pair(&a, &b).unwrap();
        assert_eq!(analysis.severity, ConflictSeverity::Low);
        assert_eq!(analysis.suggested_strategy, MergeStrategy::Sequential);
        assert!(analysis.auto_resolvable);
        assert_eq!(analysis.conflict.conflict_type, ConflictType::FileOverlap);
        assert!(analysis.conflict.affected_lines.is_empty());
    }

    #[test]
    fn test_lines_within_buffer_collide() {
        // 10..12 and 15..18 do not intersect but are 3 lines apart.
        let a = with_lines(diff("aaaaaaaa1111", &["m.py"], &[]), "m.py", &[(10, 12)]);
        let b = with_lines(diff("bbbbbbbb2222", &["m.py"], &[]), "m.py", &[(15, 18)]);

        let analysis = ConflictDetector::new().analyze_pair(&a, &b).unwrap();
        assert_eq!(analysis.severity, ConflictSeverity::High);
        assert_eq!(analysis.conflict.conflict_type, ConflictType::LineOverlap);
        assert_eq!(analysis.suggested_strategy, MergeStrategy::Escalate);
        assert_eq!(analysis.conflict.affected_lines["m.py"], vec![(12, 15)]);
    }

    #[test]
    fn test_lines_just_outside_buffer() {
        let a = with_lines(diff("aaaaaaaa1111", &["m.py"], &[]), "m.py", &[(10, 12)]);
        let b = with_lines(diff("bbbbbbbb2222", &["m.py"], &[]), "m.py", &[(16, 18)]);
        let analysis = ConflictDetector::new().analyze_pair(&a, &b).unwrap();
        assert_eq!(analysis.severity, ConflictSeverity::Low);
    }

    #[test]
    fn test_analyze_all_sorted_by_severity() {
        let low_a = with_lines(diff("aaaaaaaa1111", &["low.py"], &[]), "low.py", &[(1, 2)]);
        let low_b = with_lines(diff("bbbbbbbb2222", &["low.py"], &[]), "low.py", &[(50, 52)]);
        let crit = diff("cccccccc3333", &[], &["low.py"]);

        let analyses = ConflictDetector::new().analyze_all(&[low_a, low_b, crit]);
        assert_eq!(analyses.len(), 3);
        assert_eq!(analyses[0].severity, ConflictSeverity::Critical);
        assert_eq!(analyses[1].severity, ConflictSeverity::Critical);
        assert_eq!(analyses[2].severity, ConflictSeverity::Low);
    }

    #[test]
    fn test_causal_level_is_opt_in() {
        let mut a = diff("aaaaaaaa1111", &["pkg/a.py"], &[]);
        let mut b = diff("bbbbbbbb2222", &["pkg/b.py"], &[]);
        let mut chain_a = CausalChain::new(&a.id);
        chain_a.affected_modules = vec!["pkg.core".into()];
        let mut chain_b = CausalChain::new(&b.id);
        chain_b.affected_modules = vec!["pkg.core".into()];
        a.causal_chain = Some(chain_a);
        b.causal_chain = Some(chain_b);

        assert!(ConflictDetector::new().analyze_pair(&a, &b).is_none());

        let analysis = ConflictDetector::new()
            .with_causal_checks(true)
            .analyze_pair(&a, &b)
            .unwrap();
        assert_eq!(analysis.severity, ConflictSeverity::Medium);
        assert_eq!(analysis.conflict.conflict_type, ConflictType::Causal);
        assert_eq!(analysis.suggested_strategy, MergeStrategy::Interleave);
    }

    #[test]
    fn test_check_causal_conflict_none_when_independent() {
        let mut a = CausalChain::new("diff-a");
        a.affected_functions = vec!["parse".into()];
        let mut b = CausalChain::new("diff-b");
        b.affected_functions = vec!["render".into()];
        assert!(check_causal_conflict(&a, &b).is_none());

        b.affected_functions.push("parse".into());
        let overlap = check_causal_conflict(&a, &b).unwrap();
        assert_eq!(overlap.functions, vec!["parse".to_string()]);
    }

    #[test]
    fn test_reject_steps_name_later_submission() {
        let a = diff("aaaaaaaa1111", &["m.py"], &[]);
        let mut b = diff("bbbbbbbb2222", &["m.py"], &[]);
        b.submitted_at = a.submitted_at + chrono::Duration::seconds(5);
        let steps = resolution_steps(MergeStrategy::Reject, &b, &a);
        assert_eq!(steps[0], format!("Reject {} (later submission)", b.id));
        assert_eq!(steps[1], format!("Keep {}", a.id));
    }
}
