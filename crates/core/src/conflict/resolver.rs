//! Resolution policies consulted by the orchestrator for each detected
//! conflict.

use tracing::debug;

use super::detector::{ConflictAnalysis, ConflictSeverity};
use crate::models::MergeStrategy;

/// Decides which strategy to apply to a detected conflict.
///
/// Returning [`MergeStrategy::Escalate`] leaves the conflict unresolved for
/// a human (or a later policy) to decide.
pub trait ResolutionPolicy: Send + Sync {
    fn choose(&self, analysis: &ConflictAnalysis) -> MergeStrategy;
}

/// Auto-apply the suggested strategy only for low-severity conflicts
/// flagged auto-resolvable; escalate everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolutionPolicy;

impl ResolutionPolicy for DefaultResolutionPolicy {
    fn choose(&self, analysis: &ConflictAnalysis) -> MergeStrategy {
        let strategy = if analysis.severity == ConflictSeverity::Low && analysis.auto_resolvable {
            analysis.suggested_strategy
        } else {
            MergeStrategy::Escalate
        };
        debug!(
            conflict_id = %analysis.conflict.id,
            severity = %analysis.severity,
            %strategy,
            "resolution policy decision"
        );
        strategy
    }
}

/// Adapts a closure into a [`ResolutionPolicy`].
pub struct FnPolicy<F>(pub F);

impl<F> ResolutionPolicy for FnPolicy<F>
where
    F: Fn(&ConflictAnalysis) -> MergeStrategy + Send + Sync,
{
    fn choose(&self, analysis: &ConflictAnalysis) -> MergeStrategy {
        (self.0)(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conflict, ConflictType, Diff};

    fn analysis(severity: ConflictSeverity, auto_resolvable: bool) -> ConflictAnalysis {
        let a = Diff::from_patch("w1", "p1", "a", "");
        let b = Diff::from_patch("w2", "p2", "b", "");
        ConflictAnalysis {
            conflict: Conflict::new(&a, &b, ConflictType::FileOverlap, MergeStrategy::Sequential),
            severity,
            auto_resolvable,
            suggested_strategy: MergeStrategy::Sequential,
            resolution_steps: Vec::new(),
            risk_factors: Vec::new(),
        }
    }

    #[test]
    fn test_default_policy_applies_low_auto_resolvable() {
        let policy = DefaultResolutionPolicy;
        assert_eq!(
            policy.choose(&analysis(ConflictSeverity::Low, true)),
            MergeStrategy::Sequential
        );
    }

    #[test]
    fn test_default_policy_escalates_everything_else() {
        let policy = DefaultResolutionPolicy;
        assert_eq!(
            policy.choose(&analysis(ConflictSeverity::Low, false)),
            MergeStrategy::Escalate
        );
        // Causal conflicts are auto-resolvable but not low.
        assert_eq!(
            policy.choose(&analysis(ConflictSeverity::Medium, true)),
            MergeStrategy::Escalate
        );
        assert_eq!(
            policy.choose(&analysis(ConflictSeverity::Critical, false)),
            MergeStrategy::Escalate
        );
    }

    #[test]
    fn test_closure_policy() {
        let policy = FnPolicy(|_: &ConflictAnalysis| MergeStrategy::Reject);
        assert_eq!(
            policy.choose(&analysis(ConflictSeverity::High, false)),
            MergeStrategy::Reject
        );
    }
}
