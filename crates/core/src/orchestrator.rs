//! Orchestrator: drives diffs from submission to commit.
//!
//! One cycle runs three phases:
//!
//! 1. **Verify** every pending diff (bounded parallelism, results recorded
//!    in submission order).
//! 2. **Detect** conflicts among verified diffs and let the resolution
//!    policy settle the ones it can.
//! 3. **Commit** the verified set as one combined patch, only when
//!    auto-commit is on and no conflict anywhere is left unresolved.
//!
//! Cycles are serialized by a running flag released through a drop guard,
//! so the flag is freed even if a cycle panics.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{Bus, TransitionPayload};
use crate::config::AppConfig;
use crate::conflict::{
    ConflictAnalysis, ConflictDetector, DefaultResolutionPolicy, ResolutionPolicy,
};
use crate::errors::{BusError, CoreError, PipelineError};
use crate::git::{CommitIdentity, CommitOutcome, GitClient};
use crate::models::{
    BusStatus, CausalChain, Conflict, Diff, DiffStatus, MergeResult, MergeStrategy, Partition,
    VerificationResult,
};
use crate::verify::{added_definitions, CausalSliceVerifier};

// ---------------------------------------------------------------------------
// Results and status
// ---------------------------------------------------------------------------

/// Summary of one orchestration cycle (or one interactive resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub diffs_processed: usize,
    pub diffs_verified: usize,
    pub diffs_rejected: usize,
    /// Conflicts first recorded during this cycle.
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    /// Unresolved conflicts in the whole bus when the commit phase was
    /// considered.
    pub unresolved_conflicts: usize,
    pub commits_created: usize,
    /// Merge records written this cycle, successful or not.
    pub merges: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
}

impl OrchestrationResult {
    fn start() -> Self {
        Self {
            diffs_processed: 0,
            diffs_verified: 0,
            diffs_rejected: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            unresolved_conflicts: 0,
            commits_created: 0,
            merges: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_secs: 0.0,
        }
    }

    fn finish(mut self) -> Self {
        let now = Utc::now();
        self.duration_secs = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        self.completed_at = Some(now);
        self
    }

    /// Nothing was pending at the start of the cycle.
    pub fn is_idle(&self) -> bool {
        self.diffs_processed == 0
    }
}

/// Running totals since the orchestrator was created.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub diffs_processed: usize,
    pub conflicts_detected: usize,
    pub commits_made: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub repo_path: String,
    pub auto_commit: bool,
    pub bus: BusStatus,
    pub stats: OrchestratorStats,
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Hooks invoked as diffs move through the pipeline.
///
/// Both methods default to no-ops. They run on the cycle's task, so they
/// should return quickly.
pub trait PipelineObserver: Send + Sync {
    fn on_verification_complete(&self, _diff: &Diff, _result: &VerificationResult) {}

    fn on_commit(&self, _merge: &MergeResult) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    diffs_processed: AtomicUsize,
    conflicts_detected: AtomicUsize,
    commits_made: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> OrchestratorStats {
        OrchestratorStats {
            diffs_processed: self.diffs_processed.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            commits_made: self.commits_made.load(Ordering::Relaxed),
        }
    }
}

/// Coordinates the bus, the verifier, the conflict detector and the
/// repository.
pub struct Orchestrator {
    bus: Bus,
    repo_path: PathBuf,
    verifier: Arc<CausalSliceVerifier>,
    detector: ConflictDetector,
    policy: Arc<dyn ResolutionPolicy>,
    observer: Arc<dyn PipelineObserver>,
    identity: CommitIdentity,
    auto_commit: bool,
    commit_lock: Mutex<()>,
    running: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
    counters: Counters,
}

impl Orchestrator {
    /// Create an orchestrator with the default policy, no observer and
    /// auto-commit off.
    pub fn new(bus: Bus, verifier: CausalSliceVerifier) -> Self {
        let repo_path = verifier.repo_path().to_path_buf();
        Self {
            bus,
            repo_path,
            verifier: Arc::new(verifier),
            detector: ConflictDetector::new(),
            policy: Arc::new(DefaultResolutionPolicy),
            observer: Arc::new(NoopObserver),
            identity: CommitIdentity::default(),
            auto_commit: false,
            commit_lock: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
            counters: Counters::default(),
        }
    }

    /// Build from configuration, opening (and repairing) the configured bus.
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let bus = Bus::open(config.bus_root())?;
        let verifier = CausalSliceVerifier::new(&config.repo.path, config.verify.clone());
        Ok(Self::new(bus, verifier)
            .with_detector(
                ConflictDetector::new().with_causal_checks(config.conflicts.causal_level),
            )
            .with_identity(config.commit.identity())
            .with_auto_commit(config.commit.auto_commit))
    }

    pub fn with_policy(mut self, policy: Arc<dyn ResolutionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_identity(mut self, identity: CommitIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn acquire_running(&self) -> Result<RunningGuard, CoreError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::AlreadyRunning {
                started_at: self.started_at.to_rfc3339(),
            });
        }
        Ok(RunningGuard(self.running.clone()))
    }

    /// Run one full cycle: verify, detect and resolve, then commit.
    ///
    /// Only an uninitialized bus, bus I/O failures and a concurrent cycle
    /// are errors. Everything else is reported on the result.
    #[instrument(skip(self), fields(repo = %self.repo_path.display()))]
    pub async fn process_pending(&self) -> Result<OrchestrationResult, CoreError> {
        let _guard = self.acquire_running()?;
        let mut result = OrchestrationResult::start();

        let newly_verified = self.verify_pending(&mut result).await?;

        let verified = self.bus.list_verified()?;
        if newly_verified > 0 && verified.len() > 1 {
            self.detect_and_resolve(&verified, &mut result)?;
        }

        if self.auto_commit {
            self.retire_obsolete_conflicts()?;
            let unresolved = self.bus.unresolved_conflict_count()?;
            result.unresolved_conflicts = unresolved;
            if unresolved > 0 {
                info!(unresolved, "commit blocked by unresolved conflicts");
            } else {
                self.commit_verified(&mut result).await?;
            }
        }

        let result = result.finish();
        self.counters
            .diffs_processed
            .fetch_add(result.diffs_processed, Ordering::Relaxed);
        if !result.is_idle() || result.commits_created > 0 {
            info!(
                processed = result.diffs_processed,
                verified = result.diffs_verified,
                rejected = result.diffs_rejected,
                conflicts = result.conflicts_detected,
                commits = result.commits_created,
                duration_secs = result.duration_secs,
                "orchestration cycle complete"
            );
        }
        Ok(result)
    }

    /// Phase 1. Returns how many diffs became verified.
    ///
    /// Only diffs this orchestrator manages to claim are verified. A
    /// `verifying` record is picked up again only when its claim was
    /// abandoned.
    async fn verify_pending(&self, result: &mut OrchestrationResult) -> Result<usize, CoreError> {
        let mut claims = Vec::new();
        for diff in self.bus.list(Partition::Pending)? {
            if let Some(claim) = self.bus.claim(&diff.id)? {
                claims.push(claim);
            }
        }
        result.diffs_processed = claims.len();
        if claims.is_empty() {
            return Ok(0);
        }
        let diffs: Vec<Diff> = claims.iter().map(|c| c.diff.clone()).collect();

        let semaphore = Arc::new(Semaphore::new(self.verifier.max_parallel()));
        let mut tasks = JoinSet::new();
        for (index, diff) in diffs.iter().cloned().enumerate() {
            let verifier = self.verifier.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, verifier.verify(&diff).await)
            });
        }

        let mut outcomes: Vec<Option<VerificationResult>> = vec![None; diffs.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!(error = %e, "verification task failed"),
            }
        }

        let mut newly_verified = 0;
        for (diff, outcome) in diffs.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| {
                let mut failed = VerificationResult::new(&diff.id);
                failed.passed = false;
                failed.setup_error = Some("verification task failed".to_string());
                failed.completed_at = Some(Utc::now());
                failed
            });

            let (status, payload) = if outcome.passed {
                let mut payload = TransitionPayload::verified(outcome.clone());
                if diff.causal_chain.is_none() {
                    payload = payload.with_causal_chain(chain_from_result(diff, &outcome));
                }
                (DiffStatus::Verified, payload)
            } else {
                let errors = outcome.all_errors();
                let message = if errors.is_empty() {
                    "verification failed".to_string()
                } else {
                    errors.join("; ")
                };
                info!(diff_id = %diff.id, error = %message, "diff rejected");
                (DiffStatus::Rejected, TransitionPayload::rejected(outcome.clone(), message))
            };

            let payload = payload.at_version(diff.version);
            let stored =
                match self.bus.transition(&diff.id, &[DiffStatus::Verifying], status, payload) {
                    Ok(stored) => stored,
                    Err(BusError::StaleTransition { actual, .. }) => {
                        warn!(
                            diff_id = %diff.id,
                            %actual,
                            "diff changed during verification, result discarded"
                        );
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
            if stored.status == DiffStatus::Verified {
                newly_verified += 1;
                result.diffs_verified += 1;
            } else {
                result.diffs_rejected += 1;
            }
            self.observer.on_verification_complete(&stored, &outcome);
        }
        drop(claims);
        Ok(newly_verified)
    }

    /// Phase 2.
    fn detect_and_resolve(
        &self,
        verified: &[Diff],
        result: &mut OrchestrationResult,
    ) -> Result<(), CoreError> {
        for analysis in self.detector.analyze_all(verified) {
            if !self.bus.record_conflict(&analysis.conflict)? {
                debug!(conflict_id = %analysis.conflict.id, "conflict already recorded");
                continue;
            }
            result.conflicts_detected += 1;
            self.counters.conflicts_detected.fetch_add(1, Ordering::Relaxed);

            let strategy = self.policy.choose(&analysis);
            if strategy == MergeStrategy::Escalate {
                warn!(
                    conflict_id = %analysis.conflict.id,
                    severity = %analysis.severity,
                    "conflict escalated"
                );
                continue;
            }
            self.apply_resolution(
                &analysis.conflict,
                strategy,
                &format!("Auto-resolved with strategy: {}", strategy),
            )?;
            result.conflicts_resolved += 1;
        }
        Ok(())
    }

    /// Mark a conflict resolved. `Reject` also rejects the later of the two
    /// diffs.
    fn apply_resolution(
        &self,
        conflict: &Conflict,
        strategy: MergeStrategy,
        text: &str,
    ) -> Result<(), CoreError> {
        let resolved = self.bus.resolve_conflict(&conflict.id, strategy, text)?;
        info!(conflict_id = %resolved.id, %strategy, "conflict resolved");
        if strategy != MergeStrategy::Reject {
            return Ok(());
        }

        let a = self.bus.get(&resolved.diff_a_id)?;
        let b = self.bus.get(&resolved.diff_b_id)?;
        let later = match (a, b) {
            (Some(a), Some(b)) => {
                if (b.submitted_at, &b.id) >= (a.submitted_at, &a.id) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        };
        let Some(diff) = later else {
            return Ok(());
        };

        let from = [DiffStatus::Pending, DiffStatus::Verifying, DiffStatus::Verified];
        let payload = TransitionPayload {
            error: Some(format!("rejected by resolution of {}", resolved.id)),
            ..TransitionPayload::default()
        };
        match self.bus.transition(&diff.id, &from, DiffStatus::Rejected, payload) {
            Ok(_) => {
                info!(
                    diff_id = %diff.id,
                    conflict_id = %resolved.id,
                    "diff rejected by resolution"
                );
            }
            Err(BusError::StaleTransition { actual, .. }) => {
                debug!(diff_id = %diff.id, %actual, "diff already settled, nothing to reject");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Resolve open conflicts that name a rejected, merged or vanished diff.
    ///
    /// Such a conflict can no longer be acted on and would otherwise block
    /// every commit.
    fn retire_obsolete_conflicts(&self) -> Result<usize, CoreError> {
        let mut retired = 0;
        for conflict in self.bus.list_conflicts(Some(false))? {
            let mut gone = None;
            for id in [&conflict.diff_a_id, &conflict.diff_b_id] {
                match self.bus.get(id)? {
                    Some(diff) if diff.status.is_terminal() => {
                        gone = Some(format!("{} is {}", id, diff.status));
                    }
                    None => gone = Some(format!("{} no longer exists", id)),
                    Some(_) => {}
                }
            }
            let Some(reason) = gone else {
                continue;
            };
            self.bus.resolve_conflict(
                &conflict.id,
                MergeStrategy::Reject,
                &format!("Obsolete: {}", reason),
            )?;
            info!(conflict_id = %conflict.id, %reason, "obsolete conflict retired");
            retired += 1;
        }
        Ok(retired)
    }

    /// Phase 3 over every verified diff, read under the commit lock.
    async fn commit_verified(&self, result: &mut OrchestrationResult) -> Result<(), CoreError> {
        let _local = self.commit_lock.lock().await;
        let _shared = self.bus.lock_commit().await?;

        // Another process may have merged part of the set before we got the
        // lock.
        let mut verified = self.bus.list_verified()?;
        if verified.is_empty() {
            return Ok(());
        }
        // Earlier submissions apply first.
        verified.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));

        let merge = self.merge_and_commit(&verified).await?;
        result.merges.push(merge.id.clone());
        if merge.success {
            result.commits_created += 1;
        } else if let Some(error) = &merge.error {
            result.errors.push(error.clone());
        }
        Ok(())
    }

    /// Combine, apply and commit `diffs`. The caller holds the commit locks.
    #[instrument(skip(self, diffs), fields(diffs = diffs.len()))]
    async fn merge_and_commit(&self, diffs: &[Diff]) -> Result<MergeResult, CoreError> {
        let ids: Vec<String> = diffs.iter().map(|d| d.id.clone()).collect();
        let mut merge = self.bus.merge_diffs(&ids, None)?;
        if !merge.success {
            return Ok(merge);
        }

        let members: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let settled: Vec<Conflict> = self
            .bus
            .list_conflicts(Some(true))?
            .into_iter()
            .filter(|c| {
                members.contains(c.diff_a_id.as_str()) && members.contains(c.diff_b_id.as_str())
            })
            .collect();
        merge.conflicts_resolved = settled.iter().map(|c| c.id.clone()).collect();

        if settled.iter().any(|c| c.suggested_strategy == MergeStrategy::Interleave) {
            let combined = Diff::from_patch(&merge.id, "ariadne", merge.combined_diff.clone(), "");
            let check = self.verifier.verify(&combined).await;
            if !check.passed {
                let detail = check.all_errors().join("; ");
                let error = format!("combined diff failed verification: {}", detail);
                return self.fail_merge(merge, error);
            }
        }

        let commit_dir = self.bus.prepare_commit(&merge, &self.repo_path)?;
        let patch_file = commit_dir.join("combined.diff");
        let message =
            std::fs::read_to_string(commit_dir.join("message.md")).map_err(BusError::from)?;

        let git = match GitClient::new(&self.repo_path) {
            Ok(git) => git,
            Err(e) => {
                return self.fail_merge(merge, PipelineError::Commit(e.to_string()).to_string())
            }
        };
        if let Err(e) = git.apply_patch_file(&patch_file).await {
            return self.fail_merge(merge, PipelineError::MergeApply(e.to_string()).to_string());
        }

        match git.commit_all(&message, &self.identity) {
            Ok(CommitOutcome::Committed(sha)) => merge.commit_sha = Some(sha),
            Ok(CommitOutcome::NothingToCommit) => {
                info!(merge_id = %merge.id, "merge produced no changes")
            }
            Err(e) => {
                if let Err(revert) = git.revert_patch_file(&patch_file).await {
                    error!(error = %revert, "failed to revert combined diff after commit failure");
                }
                return self.fail_merge(merge, PipelineError::Commit(e.to_string()).to_string());
            }
        }

        for diff in diffs {
            let payload = TransitionPayload::default().at_version(diff.version);
            let merged =
                self.bus.transition(&diff.id, &[DiffStatus::Verified], DiffStatus::Merged, payload);
            match merged {
                Ok(_) => {}
                Err(BusError::StaleTransition { actual, .. }) => {
                    error!(
                        diff_id = %diff.id,
                        %actual,
                        merge_id = %merge.id,
                        "diff changed while its merge was committed"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        merge.verification_passed = true;
        self.bus.save_merge(&merge)?;
        self.counters.commits_made.fetch_add(1, Ordering::Relaxed);
        info!(
            merge_id = %merge.id,
            sha = merge.commit_sha.as_deref().unwrap_or("-"),
            "merge committed"
        );
        self.observer.on_commit(&merge);
        Ok(merge)
    }

    fn fail_merge(&self, mut merge: MergeResult, error: String) -> Result<MergeResult, CoreError> {
        warn!(merge_id = %merge.id, %error, "merge failed");
        merge.success = false;
        merge.error = Some(error);
        self.bus.save_merge(&merge)?;
        Ok(merge)
    }

    // -- interactive --------------------------------------------------------

    /// Conflicts among pending and verified diffs that need a human.
    ///
    /// Conflicts between two verified diffs are recorded so they can be
    /// resolved by id. Pairs involving a pending diff are only reported:
    /// that diff may still be rejected. Resolved conflicts are left out.
    pub fn pending_conflicts(&self) -> Result<Vec<ConflictAnalysis>, CoreError> {
        let mut diffs = self.bus.list(Partition::Pending)?;
        diffs.extend(self.bus.list_verified()?);
        if diffs.len() < 2 {
            return Ok(Vec::new());
        }
        let verified: BTreeSet<String> = diffs
            .iter()
            .filter(|d| d.status == DiffStatus::Verified)
            .map(|d| d.id.clone())
            .collect();

        let mut open = Vec::new();
        for analysis in self.detector.analyze_all(&diffs) {
            if analysis.auto_resolvable {
                continue;
            }
            let conflict = &analysis.conflict;
            if verified.contains(&conflict.diff_a_id) && verified.contains(&conflict.diff_b_id) {
                self.bus.record_conflict(conflict)?;
            }
            let resolved = self
                .bus
                .get_conflict(&conflict.id)?
                .is_some_and(|c| c.resolved);
            if !resolved {
                open.push(analysis);
            }
        }
        Ok(open)
    }

    /// Apply operator decisions, then commit if nothing is left unresolved.
    ///
    /// `Escalate` entries leave their conflict open. Committing happens even
    /// when auto-commit is off.
    pub async fn resolve_and_commit(
        &self,
        resolutions: &BTreeMap<String, MergeStrategy>,
    ) -> Result<OrchestrationResult, CoreError> {
        let _guard = self.acquire_running()?;
        let mut result = OrchestrationResult::start();

        for (id, strategy) in resolutions {
            if *strategy == MergeStrategy::Escalate {
                result.errors.push(format!("conflict {} left escalated", id));
                continue;
            }
            let Some(conflict) = self.bus.get_conflict(id)? else {
                result.errors.push(format!("conflict not found: {}", id));
                continue;
            };
            let text = format!("Resolved by operator with strategy: {}", strategy);
            self.apply_resolution(&conflict, *strategy, &text)?;
            result.conflicts_resolved += 1;
        }

        self.retire_obsolete_conflicts()?;
        let unresolved = self.bus.unresolved_conflict_count()?;
        result.unresolved_conflicts = unresolved;
        if unresolved > 0 {
            result
                .errors
                .push(PipelineError::ConflictUnresolved { count: unresolved }.to_string());
            return Ok(result.finish());
        }

        self.commit_verified(&mut result).await?;
        Ok(result.finish())
    }

    pub fn status(&self) -> Result<OrchestratorStatus, CoreError> {
        Ok(OrchestratorStatus {
            running: self.is_running(),
            repo_path: self.repo_path.display().to_string(),
            auto_commit: self.auto_commit,
            bus: self.bus.status_summary()?,
            stats: self.counters.snapshot(),
        })
    }
}

/// Clears the running flag on drop.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Depth-1 chain from what verification already resolved.
fn chain_from_result(diff: &Diff, result: &VerificationResult) -> CausalChain {
    let mut chain = CausalChain::new(&diff.id);
    chain.affected_files = diff.all_affected_files().into_iter().map(str::to_string).collect();
    chain.affected_functions = added_definitions(&diff.content);
    chain.affected_modules = result.scope.modules.clone();
    chain.test_files = result.scope.tests.clone();
    chain.call_depth = 1;
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifyConfig;
    use crate::conflict::{ConflictSeverity, FnPolicy};
    use crate::git::git_available;
    use std::fs;
    use std::sync::Mutex as StdMutex;

    const EDIT_A: &str =
        "diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-a\n+A\n";
    const EDIT_B: &str =
        "diff --git a/b.txt b/b.txt\n--- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-b\n+B\n";
    const DELETE_A: &str = concat!(
        "diff --git a/a.txt b/a.txt\ndeleted file mode 100644\n",
        "--- a/a.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-a\n",
    );

    fn missing_tools() -> VerifyConfig {
        VerifyConfig {
            typecheck_cmd: vec!["ariadne-missing-typecheck".into()],
            lint_cmd: vec!["ariadne-missing-lint".into()],
            test_cmd: vec!["ariadne-missing-tests".into()],
            ..VerifyConfig::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: PathBuf,
        orchestrator: Orchestrator,
    }

    fn fixture(auto_commit: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        git2::Repository::init(&repo).unwrap();
        fs::write(repo.join("a.txt"), "a\n").unwrap();
        fs::write(repo.join("b.txt"), "b\n").unwrap();
        GitClient::new(&repo)
            .unwrap()
            .commit_all("initial", &CommitIdentity::default())
            .unwrap();

        let bus = Bus::new(dir.path().join("bus"));
        bus.initialize().unwrap();
        let orchestrator = Orchestrator::new(bus, CausalSliceVerifier::new(&repo, missing_tools()))
            .with_auto_commit(auto_commit);
        Fixture {
            _dir: dir,
            repo,
            orchestrator,
        }
    }

    const EDIT_TOP: &str = concat!(
        "diff --git a/c.py b/c.py\n--- a/c.py\n+++ b/c.py\n",
        "@@ -1,3 +1,3 @@\n-line1\n+LINE1\n line2\n line3\n",
    );
    const EDIT_MIDDLE: &str = concat!(
        "diff --git a/c.py b/c.py\n--- a/c.py\n+++ b/c.py\n",
        "@@ -18,5 +18,5 @@\n line18\n line19\n-line20\n+LINE20\n line21\n line22\n",
    );

    fn numbered(lines: usize) -> String {
        (1..=lines).map(|i| format!("line{}\n", i)).collect()
    }

    fn commit_file(repo: &Path, name: &str, content: &str) {
        fs::write(repo.join(name), content).unwrap();
        GitClient::new(repo)
            .unwrap()
            .commit_all(&format!("add {}", name), &CommitIdentity::default())
            .unwrap();
    }

    /// Verify a diff without going through an orchestrator.
    fn mark_verified(bus: &Bus, id: &str) {
        let claim = bus.claim(id).unwrap().unwrap();
        let payload = TransitionPayload::verified(VerificationResult::new(id))
            .at_version(claim.diff.version);
        bus.transition(id, &[DiffStatus::Verifying], DiffStatus::Verified, payload)
            .unwrap();
    }

    #[derive(Default)]
    struct Recorder {
        verified: StdMutex<Vec<(String, bool)>>,
        commits: StdMutex<Vec<String>>,
    }

    impl PipelineObserver for Recorder {
        fn on_verification_complete(&self, diff: &Diff, result: &VerificationResult) {
            self.verified.lock().unwrap().push((diff.id.clone(), result.passed));
        }

        fn on_commit(&self, merge: &MergeResult) {
            self.commits.lock().unwrap().push(merge.id.clone());
        }
    }

    #[tokio::test]
    async fn test_empty_cycle_is_idle() {
        let fx = fixture(true);
        let result = fx.orchestrator.process_pending().await.unwrap();
        assert!(result.is_idle());
        assert_eq!(result.commits_created, 0);
        assert!(result.merges.is_empty());
        assert!(result.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_uninitialized_bus_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Bus::new(dir.path().join("nowhere")),
            CausalSliceVerifier::new(dir.path(), missing_tools()),
        );
        let err = orchestrator.process_pending().await.unwrap_err();
        assert!(matches!(err, CoreError::Bus(BusError::NotInitialized(_))));
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_disjoint_diffs_commit_together() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let recorder = Arc::new(Recorder::default());
        let fx = fixture(true);
        let orchestrator = fx.orchestrator.with_observer(recorder.clone());
        let bus = orchestrator.bus().clone();
        let a = bus.submit_patch("w1", "p1", EDIT_A, "uppercase a", None).unwrap();
        let b = bus.submit_patch("w2", "p2", EDIT_B, "uppercase b", None).unwrap();

        let result = orchestrator.process_pending().await.unwrap();
        assert_eq!(result.diffs_processed, 2);
        assert_eq!(result.diffs_verified, 2);
        assert_eq!(result.conflicts_detected, 0);
        assert_eq!(result.commits_created, 1, "errors: {:?}", result.errors);

        assert_eq!(fs::read_to_string(fx.repo.join("a.txt")).unwrap(), "A\n");
        assert_eq!(fs::read_to_string(fx.repo.join("b.txt")).unwrap(), "B\n");
        for id in [&a, &b] {
            let diff = bus.get(id).unwrap().unwrap();
            assert_eq!(diff.status, DiffStatus::Merged);
            assert!(diff.merged_at.is_some());
            assert!(diff.causal_chain.is_some());
        }

        let merge = bus.get_merge(&result.merges[0]).unwrap().unwrap();
        assert!(merge.success);
        assert!(merge.verification_passed);
        let sha = merge.commit_sha.clone().unwrap();
        let repo = git2::Repository::open(&fx.repo).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.id().to_string(), sha);
        assert!(head.message().unwrap().contains("- uppercase a"));

        assert_eq!(recorder.verified.lock().unwrap().len(), 2);
        assert_eq!(*recorder.commits.lock().unwrap(), vec![merge.id.clone()]);
        assert_eq!(orchestrator.status().unwrap().stats.commits_made, 1);
    }

    #[tokio::test]
    async fn test_auto_commit_off_leaves_verified() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(false);
        let bus = fx.orchestrator.bus().clone();
        let id = bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();

        let result = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(result.diffs_verified, 1);
        assert_eq!(result.commits_created, 0);
        assert_eq!(bus.get(&id).unwrap().unwrap().status, DiffStatus::Verified);
        assert_eq!(fs::read_to_string(fx.repo.join("a.txt")).unwrap(), "a\n");
    }

    #[tokio::test]
    async fn test_non_applying_diff_is_rejected() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let bus = fx.orchestrator.bus().clone();
        let bad = "diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-zzz\n+A\n";
        let id = bus.submit_patch("w1", "p1", bad, "", None).unwrap();

        let result = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(result.diffs_rejected, 1);
        assert_eq!(result.commits_created, 0);

        let diff = bus.get(&id).unwrap().unwrap();
        assert_eq!(diff.status, DiffStatus::Rejected);
        assert!(diff
            .verification_error
            .unwrap()
            .starts_with("workspace setup failed:"));
    }

    #[tokio::test]
    async fn test_critical_conflict_blocks_commit_until_resolved() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let bus = fx.orchestrator.bus().clone();
        let edit = bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();
        let delete = bus.submit_patch("w2", "p2", DELETE_A, "", None).unwrap();

        let result = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(result.diffs_verified, 2);
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 0);
        assert_eq!(result.unresolved_conflicts, 1);
        assert_eq!(result.commits_created, 0);

        let open = fx.orchestrator.pending_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, ConflictSeverity::Critical);
        let conflict_id = open[0].conflict.id.clone();

        // A second cycle neither re-counts nor commits.
        let again = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(again.conflicts_detected, 0);
        assert_eq!(again.commits_created, 0);

        let mut decisions = BTreeMap::new();
        decisions.insert(conflict_id.clone(), MergeStrategy::Reject);
        let resolved = fx.orchestrator.resolve_and_commit(&decisions).await.unwrap();
        assert_eq!(resolved.conflicts_resolved, 1);
        assert_eq!(resolved.commits_created, 1, "errors: {:?}", resolved.errors);

        // The later submission was dropped, the earlier one committed.
        let later = bus.get(&delete).unwrap().unwrap();
        assert_eq!(later.status, DiffStatus::Rejected);
        assert_eq!(bus.get(&edit).unwrap().unwrap().status, DiffStatus::Merged);
        assert_eq!(fs::read_to_string(fx.repo.join("a.txt")).unwrap(), "A\n");
        assert!(fx.orchestrator.pending_conflicts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_escalated_resolution_keeps_commit_blocked() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let bus = fx.orchestrator.bus().clone();
        bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();
        bus.submit_patch("w2", "p2", DELETE_A, "", None).unwrap();
        fx.orchestrator.process_pending().await.unwrap();
        let conflict = bus.list_conflicts(Some(false)).unwrap().remove(0);

        let mut decisions = BTreeMap::new();
        decisions.insert(conflict.id.clone(), MergeStrategy::Escalate);
        let result = fx.orchestrator.resolve_and_commit(&decisions).await.unwrap();
        assert_eq!(result.commits_created, 0);
        assert_eq!(result.unresolved_conflicts, 1);
        assert!(result
            .errors
            .contains(&"cannot commit: 1 unresolved conflict(s) remain".to_string()));
    }

    #[tokio::test]
    async fn test_custom_policy_resolves_in_cycle() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let orchestrator = fx
            .orchestrator
            .with_policy(Arc::new(FnPolicy(|_: &ConflictAnalysis| MergeStrategy::Reject)));
        let bus = orchestrator.bus().clone();
        bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();
        let delete = bus.submit_patch("w2", "p2", DELETE_A, "", None).unwrap();

        let result = orchestrator.process_pending().await.unwrap();
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(result.commits_created, 1, "errors: {:?}", result.errors);

        let conflict = bus.list_conflicts(Some(true)).unwrap().remove(0);
        assert_eq!(
            conflict.resolution.as_deref(),
            Some("Auto-resolved with strategy: reject")
        );
        assert_eq!(bus.get(&delete).unwrap().unwrap().status, DiffStatus::Rejected);
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_diff_verified() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let bus = fx.orchestrator.bus().clone();
        let id = bus.submit_patch("w1", "p1", EDIT_B, "", None).unwrap();
        let verifier = CausalSliceVerifier::new(&fx.repo, missing_tools());
        let manual = Orchestrator::new(bus.clone(), verifier);
        manual.process_pending().await.unwrap();
        assert_eq!(bus.get(&id).unwrap().unwrap().status, DiffStatus::Verified);

        // The repository drifts between verification and commit.
        fs::write(fx.repo.join("b.txt"), "drift\n").unwrap();

        let result = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(result.commits_created, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("failed to apply combined diff:"));
        assert_eq!(bus.get(&id).unwrap().unwrap().status, DiffStatus::Verified);
        let merge = bus.get_merge(&result.merges[0]).unwrap().unwrap();
        assert!(!merge.success);
        assert_eq!(fs::read_to_string(fx.repo.join("b.txt")).unwrap(), "drift\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interleaved_pair_failing_combined_check_is_not_committed() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        commit_file(&fx.repo, "c.py", &numbered(30));
        let bus = fx.orchestrator.bus().clone();

        // Each edit passes alone; the lint only fails when both are present.
        let config = VerifyConfig {
            lint_cmd: vec![
                "sh".into(),
                "-c".into(),
                "if grep -q LINE1 \"$1\" && grep -q LINE20 \"$1\"; then \
                 echo \"$1: edits clash\"; exit 1; fi"
                    .into(),
                "lint".into(),
            ],
            ..missing_tools()
        };
        let verifier = CausalSliceVerifier::new(&fx.repo, config);
        let orchestrator = Orchestrator::new(bus.clone(), verifier)
            .with_auto_commit(true)
            .with_policy(Arc::new(FnPolicy(|_: &ConflictAnalysis| MergeStrategy::Interleave)));
        let top = bus.submit_patch("w1", "p1", EDIT_TOP, "", None).unwrap();
        let middle = bus.submit_patch("w2", "p2", EDIT_MIDDLE, "", None).unwrap();

        let result = orchestrator.process_pending().await.unwrap();
        assert_eq!(result.diffs_verified, 2);
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(result.commits_created, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("combined diff failed verification:"));
        assert!(result.errors[0].contains("edits clash"));

        let merge = bus.get_merge(&result.merges[0]).unwrap().unwrap();
        assert!(!merge.success);
        assert!(merge.commit_sha.is_none());
        for id in [&top, &middle] {
            assert_eq!(bus.get(id).unwrap().unwrap().status, DiffStatus::Verified);
        }
        assert_eq!(fs::read_to_string(fx.repo.join("c.py")).unwrap(), numbered(30));
        let repo = git2::Repository::open(&fx.repo).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert!(head.message().unwrap().starts_with("add c.py"));
    }

    #[tokio::test]
    async fn test_one_new_diff_against_one_old_runs_detection() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(false);
        let bus = fx.orchestrator.bus().clone();
        let old = bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();
        mark_verified(&bus, &old);
        let new = bus.submit_patch("w2", "p2", DELETE_A, "", None).unwrap();

        let result = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(result.diffs_processed, 1);
        assert_eq!(result.diffs_verified, 1);
        assert_eq!(result.conflicts_detected, 1);

        let conflict = bus.list_conflicts(Some(false)).unwrap().remove(0);
        let mut pair = [conflict.diff_a_id, conflict.diff_b_id];
        pair.sort();
        let mut expected = [old, new];
        expected.sort();
        assert_eq!(pair, expected);
    }

    #[tokio::test]
    async fn test_no_new_verification_skips_detection() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(false);
        let bus = fx.orchestrator.bus().clone();
        for patch in [EDIT_A, DELETE_A] {
            let id = bus.submit_patch("w1", "p1", patch, "", None).unwrap();
            mark_verified(&bus, &id);
        }

        let result = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(result.diffs_processed, 0);
        assert_eq!(result.conflicts_detected, 0);
        assert!(bus.list_conflicts(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_orchestrators_commit_a_diff_once() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let bus = fx.orchestrator.bus().clone();
        let other = Orchestrator::new(
            Bus::new(bus.root()),
            CausalSliceVerifier::new(&fx.repo, missing_tools()),
        )
        .with_auto_commit(true);
        let id = bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();

        let (first, second) =
            tokio::join!(fx.orchestrator.process_pending(), other.process_pending());
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.diffs_processed + second.diffs_processed, 1);
        assert_eq!(first.diffs_verified + second.diffs_verified, 1);
        assert_eq!(first.merges.len() + second.merges.len(), 1);
        assert_eq!(
            first.commits_created + second.commits_created,
            1,
            "errors: {:?} {:?}",
            first.errors,
            second.errors
        );

        let diff = bus.get(&id).unwrap().unwrap();
        assert_eq!(diff.status, DiffStatus::Merged);
        assert_eq!(fs::read_to_string(fx.repo.join("a.txt")).unwrap(), "A\n");
        let repo = git2::Repository::open(&fx.repo).unwrap();
        let mut walk = repo.revwalk().unwrap();
        walk.push_head().unwrap();
        assert_eq!(walk.count(), 2);

        // Nothing is left for either side to pick up.
        for orchestrator in [&fx.orchestrator, &other] {
            let later = orchestrator.process_pending().await.unwrap();
            assert!(later.is_idle());
            assert!(later.merges.is_empty());
        }
        assert_eq!(bus.get(&id).unwrap().unwrap().status, DiffStatus::Merged);
    }

    #[tokio::test]
    async fn test_claimed_diff_is_skipped_until_abandoned() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let bus = fx.orchestrator.bus().clone();
        let id = bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();
        let claim = bus.claim(&id).unwrap().unwrap();

        let skipped = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(skipped.diffs_processed, 0);
        assert_eq!(skipped.commits_created, 0);
        assert_eq!(bus.get(&id).unwrap().unwrap().status, DiffStatus::Verifying);

        // The claimant goes away mid-verification.
        drop(claim);
        let recovered = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(recovered.diffs_processed, 1);
        assert_eq!(recovered.diffs_verified, 1);
        assert_eq!(recovered.commits_created, 1, "errors: {:?}", recovered.errors);
        assert_eq!(bus.get(&id).unwrap().unwrap().status, DiffStatus::Merged);
    }

    #[tokio::test]
    async fn test_conflict_with_rejected_diff_stops_blocking() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(true);
        let bus = fx.orchestrator.bus().clone();
        let edit = bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();
        let delete = bus.submit_patch("w2", "p2", DELETE_A, "", None).unwrap();
        let blocked = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(blocked.unresolved_conflicts, 1);

        let payload = TransitionPayload {
            error: Some("withdrawn".into()),
            ..TransitionPayload::default()
        };
        bus.transition(&delete, &[DiffStatus::Verified], DiffStatus::Rejected, payload)
            .unwrap();

        let result = fx.orchestrator.process_pending().await.unwrap();
        assert_eq!(result.unresolved_conflicts, 0);
        assert_eq!(result.commits_created, 1, "errors: {:?}", result.errors);
        assert_eq!(bus.get(&edit).unwrap().unwrap().status, DiffStatus::Merged);

        let conflict = bus.list_conflicts(None).unwrap().remove(0);
        assert!(conflict.resolved);
        let resolution = conflict.resolution.unwrap();
        assert!(resolution.starts_with("Obsolete:"), "{}", resolution);
        assert!(resolution.contains(&delete));
    }

    #[tokio::test]
    async fn test_conflicts_with_pending_diffs_are_reported_not_recorded() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let fx = fixture(false);
        let bus = fx.orchestrator.bus().clone();
        bus.submit_patch("w1", "p1", EDIT_A, "", None).unwrap();
        bus.submit_patch("w2", "p2", DELETE_A, "", None).unwrap();

        let open = fx.orchestrator.pending_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, ConflictSeverity::Critical);
        assert!(bus.list_conflicts(None).unwrap().is_empty());

        fx.orchestrator.process_pending().await.unwrap();
        let open = fx.orchestrator.pending_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(bus.list_conflicts(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_refused() {
        let fx = fixture(false);
        let _guard = fx.orchestrator.acquire_running().unwrap();
        assert!(fx.orchestrator.status().unwrap().running);
        let err = fx.orchestrator.process_pending().await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRunning { .. }));
    }
}
