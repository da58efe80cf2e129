//! Causal-slice verification of a single diff.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, instrument};

use super::checks::CheckCommand;
use super::scope::{extract_causal_chain, ScopeRules};
use super::workspace::ScratchWorkspace;
use crate::config::VerifyConfig;
use crate::models::{
    CausalChain, CheckOutcome, Diff, TestOutcome, VerificationResult, VerificationScope,
};

/// Verifies diffs by exercising only the code they touch.
///
/// Each call copies the repository into a scratch directory, applies the
/// patch there and runs type-check, lint and test commands scoped to the
/// diff's causal chain. A missing tool counts as a pass, which weakens the
/// guarantee on machines without it; that case is logged at `warn`.
#[derive(Debug, Clone)]
pub struct CausalSliceVerifier {
    repo_path: PathBuf,
    config: VerifyConfig,
    rules: ScopeRules,
}

impl CausalSliceVerifier {
    pub fn new(repo_path: impl Into<PathBuf>, config: VerifyConfig) -> Self {
        let rules = ScopeRules::from(&config);
        Self {
            repo_path: repo_path.into(),
            config,
            rules,
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn max_parallel(&self) -> usize {
        self.config.max_parallel.max(1)
    }

    pub fn rules(&self) -> &ScopeRules {
        &self.rules
    }

    /// The diff's precomputed chain, or one derived against the repository.
    pub fn causal_chain_for(&self, diff: &Diff) -> CausalChain {
        match &diff.causal_chain {
            Some(chain) => chain.clone(),
            None => extract_causal_chain(diff, &self.repo_path, &self.rules),
        }
    }

    fn typecheck_cmd(&self) -> CheckCommand {
        CheckCommand::new(
            "typecheck",
            self.config.typecheck_cmd.clone(),
            Duration::from_secs(self.config.typecheck_timeout_secs),
        )
    }

    fn lint_cmd(&self) -> CheckCommand {
        CheckCommand::new(
            "lint",
            self.config.lint_cmd.clone(),
            Duration::from_secs(self.config.lint_timeout_secs),
        )
    }

    fn test_cmd(&self) -> CheckCommand {
        CheckCommand::new(
            "tests",
            self.config.test_cmd.clone(),
            Duration::from_secs(self.config.test_timeout_secs),
        )
    }

    /// Verify `diff`. Never fails: every outcome is in the result.
    #[instrument(skip_all, fields(diff_id = %diff.id))]
    pub async fn verify(&self, diff: &Diff) -> VerificationResult {
        let started = Instant::now();
        let mut result = VerificationResult::new(&diff.id);

        let prepared =
            ScratchWorkspace::prepare(&self.repo_path, &self.config.exclude, &diff.content).await;
        let workspace = match prepared {
            Ok(ws) => ws,
            Err(e) => {
                info!(error = %e, "verification aborted");
                result.setup_error = Some(e.to_string());
                result.passed = false;
                finish(&mut result, started);
                return result;
            }
        };
        let repo = workspace.repo();

        let (modules, tests) = match &diff.causal_chain {
            Some(chain) => (chain.affected_modules.clone(), chain.test_files.clone()),
            None => {
                let chain = extract_causal_chain(diff, repo, &self.rules);
                (chain.affected_modules, chain.test_files)
            }
        };

        let mut module_files: Vec<String> = Vec::new();
        for file in modules.iter().filter_map(|m| self.rules.module_file(repo, m)) {
            if !module_files.contains(&file) {
                module_files.push(file);
            }
        }
        let changed_files: Vec<String> = diff
            .all_affected_files()
            .into_iter()
            .filter(|f| self.rules.is_source(f) && repo.join(f).is_file())
            .map(str::to_string)
            .collect();
        let test_files: Vec<String> = tests
            .iter()
            .filter(|t| repo.join(t).is_file())
            .cloned()
            .collect();

        let typecheck = self.typecheck_cmd();
        let lint = self.lint_cmd();
        let test = self.test_cmd();

        let (typecheck_outcome, lint_outcome, test_outcome) = tokio::join!(
            async {
                if module_files.is_empty() {
                    CheckOutcome::pass()
                } else {
                    typecheck.outcome(typecheck.run(repo, &module_files).await)
                }
            },
            async {
                if changed_files.is_empty() {
                    CheckOutcome::pass()
                } else {
                    lint.outcome(lint.run(repo, &changed_files).await)
                }
            },
            async {
                // No matched tests is a pass.
                if test_files.is_empty() {
                    TestOutcome::default()
                } else {
                    test.test_outcome(test.run(repo, &test_files).await)
                }
            },
        );

        result.typecheck = typecheck_outcome;
        result.lint = lint_outcome;
        result.tests = test_outcome;
        result.scope = VerificationScope {
            modules,
            tests: test_files,
        };
        result.passed = result.typecheck.passed && result.lint.passed && result.tests.check.passed;

        drop(workspace);
        finish(&mut result, started);
        info!(
            passed = result.passed,
            duration_secs = result.duration_secs,
            "verification complete"
        );
        result
    }
}

fn finish(result: &mut VerificationResult, started: Instant) {
    result.completed_at = Some(Utc::now());
    result.duration_secs = started.elapsed().as_secs_f64();
}
