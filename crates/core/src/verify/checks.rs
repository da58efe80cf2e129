//! External check invocation with per-check time bounds.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex_lite::Regex;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::errors::PipelineError;
use crate::models::{CheckOutcome, TestOutcome};

/// Error excerpts kept per check.
const MAX_ERROR_LINES: usize = 50;

/// A configured check: program, fixed arguments and time bound.
#[derive(Debug, Clone)]
pub struct CheckCommand {
    /// `typecheck`, `lint` or `tests`; used in logs and synthetic errors.
    pub name: &'static str,
    pub argv: Vec<String>,
    pub timeout: Duration,
}

/// What happened when a check ran.
#[derive(Debug)]
pub enum CheckRun {
    Completed {
        success: bool,
        stdout: String,
        stderr: String,
    },
    /// The program does not exist on this machine.
    ToolMissing,
    TimedOut,
    /// Spawn or wait failed for any other reason.
    Failed(String),
}

impl CheckCommand {
    pub fn new(name: &'static str, argv: Vec<String>, timeout: Duration) -> Self {
        Self { name, argv, timeout }
    }

    /// Run the command in `workdir` with `files` appended.
    ///
    /// The child is killed if the time bound expires.
    #[instrument(skip(self, files), fields(check = self.name, files = files.len()))]
    pub async fn run(&self, workdir: &Path, files: &[String]) -> CheckRun {
        let Some((program, args)) = self.argv.split_first() else {
            return CheckRun::Failed(format!("{}: empty command", self.name));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(files)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CheckRun::ToolMissing,
            Err(e) => return CheckRun::Failed(format!("failed to execute {}: {}", program, e)),
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                debug!(status = ?output.status.code(), "check finished");
                CheckRun::Completed {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }
            }
            Ok(Err(e)) => CheckRun::Failed(format!("failed to wait for {}: {}", program, e)),
            Err(_) => CheckRun::TimedOut,
        }
    }

    fn timeout_error(&self) -> String {
        PipelineError::CheckTimeout {
            check: self.name.to_string(),
            secs: self.timeout.as_secs(),
        }
        .to_string()
    }

    fn log_missing(&self) {
        let tool = self.argv.first().cloned().unwrap_or_default();
        warn!(
            check = self.name,
            "{}; treating check as passed",
            PipelineError::CheckToolUnavailable { tool }
        );
    }

    /// Turn a run into a pass/fail outcome for typecheck and lint.
    pub fn outcome(&self, run: CheckRun) -> CheckOutcome {
        match run {
            CheckRun::Completed { success: true, .. } => CheckOutcome::pass(),
            CheckRun::Completed { stdout, stderr, .. } => {
                let mut errors = non_empty_lines(&stdout);
                if errors.is_empty() {
                    errors = non_empty_lines(&stderr);
                }
                if errors.is_empty() {
                    errors.push(format!("{} failed", self.name));
                }
                CheckOutcome::fail(errors)
            }
            CheckRun::ToolMissing => {
                self.log_missing();
                CheckOutcome::degraded()
            }
            CheckRun::TimedOut => CheckOutcome::fail(vec![self.timeout_error()]),
            CheckRun::Failed(msg) => CheckOutcome::fail(vec![msg]),
        }
    }

    /// Turn a run into a test outcome, parsing pass/fail counts.
    pub fn test_outcome(&self, run: CheckRun) -> TestOutcome {
        match run {
            CheckRun::Completed {
                success,
                stdout,
                stderr,
            } => {
                let (passed, failed) = parse_test_counts(&stdout);
                let check = if success {
                    CheckOutcome::pass()
                } else {
                    let mut errors: Vec<String> = stdout
                        .lines()
                        .filter(|l| l.contains("FAILED") || l.contains("ERROR"))
                        .map(|l| l.trim().to_string())
                        .take(MAX_ERROR_LINES)
                        .collect();
                    if errors.is_empty() {
                        errors = non_empty_lines(&stderr);
                    }
                    if errors.is_empty() {
                        errors.push(format!("{} failed", self.name));
                    }
                    CheckOutcome::fail(errors)
                };
                TestOutcome {
                    check,
                    run: passed + failed,
                    failed,
                }
            }
            CheckRun::ToolMissing => {
                self.log_missing();
                TestOutcome {
                    check: CheckOutcome::degraded(),
                    ..TestOutcome::default()
                }
            }
            other => TestOutcome {
                check: self.outcome(other),
                ..TestOutcome::default()
            },
        }
    }
}

fn non_empty_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .take(MAX_ERROR_LINES)
        .collect()
}

fn count_re(which: &'static str) -> &'static Regex {
    static PASSED: OnceLock<Regex> = OnceLock::new();
    static FAILED: OnceLock<Regex> = OnceLock::new();
    let cell = if which == "passed" { &PASSED } else { &FAILED };
    cell.get_or_init(|| Regex::new(&format!(r"(\d+) {}", which)).expect("static count regex"))
}

/// `(passed, failed)` from a pytest-style summary line.
pub fn parse_test_counts(output: &str) -> (u32, u32) {
    let grab = |which| {
        count_re(which)
            .captures(output)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    (grab("passed"), grab("failed"))
}
