//! Polling loop for daemon mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::orchestrator::Orchestrator;

/// Shared shutdown flag checked by the polling loop.
pub type ShutdownFlag = Arc<AtomicBool>;

pub fn new_shutdown_flag() -> ShutdownFlag {
    Arc::new(AtomicBool::new(false))
}

pub fn is_shutdown_requested(flag: &ShutdownFlag) -> bool {
    flag.load(Ordering::SeqCst)
}

/// Loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonOptions {
    pub poll_interval: Duration,
    /// Stop after this many consecutive idle cycles.
    pub max_idle_cycles: Option<u32>,
}

impl From<&DaemonConfig> for DaemonOptions {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_idle_cycles: config.max_idle_cycles,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    Idle,
}

/// Totals over a whole daemon run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonSummary {
    pub cycles: u64,
    pub diffs_processed: usize,
    pub commits_created: usize,
    pub failed_cycles: u64,
    pub stop_reason: StopReason,
}

/// Run orchestration cycles until shutdown or until `max_idle_cycles`
/// consecutive cycles found nothing pending.
///
/// A failing cycle is logged and counts as idle; the loop keeps going.
pub async fn run_daemon(
    orchestrator: &Orchestrator,
    options: DaemonOptions,
    shutdown: ShutdownFlag,
) -> DaemonSummary {
    info!(
        interval_secs = options.poll_interval.as_secs(),
        max_idle = ?options.max_idle_cycles,
        "starting daemon loop"
    );

    let mut summary = DaemonSummary {
        cycles: 0,
        diffs_processed: 0,
        commits_created: 0,
        failed_cycles: 0,
        stop_reason: StopReason::Shutdown,
    };
    let mut idle_cycles: u32 = 0;

    loop {
        if is_shutdown_requested(&shutdown) {
            info!("shutdown requested, exiting daemon loop");
            break;
        }

        summary.cycles += 1;
        let idle = match orchestrator.process_pending().await {
            Ok(result) => {
                summary.diffs_processed += result.diffs_processed;
                summary.commits_created += result.commits_created;
                for err in &result.errors {
                    error!(error = %err, "cycle reported an error");
                }
                result.is_idle()
            }
            Err(e) => {
                error!(error = %e, "orchestration cycle failed");
                summary.failed_cycles += 1;
                true
            }
        };

        idle_cycles = if idle { idle_cycles + 1 } else { 0 };
        if let Some(max) = options.max_idle_cycles {
            if idle_cycles >= max {
                info!(idle_cycles, "idle limit reached, exiting daemon loop");
                summary.stop_reason = StopReason::Idle;
                break;
            }
        }

        // Sleep in short steps so shutdown is noticed promptly.
        let step = options.poll_interval.min(Duration::from_millis(250));
        let mut slept = Duration::ZERO;
        while slept < options.poll_interval {
            if is_shutdown_requested(&shutdown) {
                break;
            }
            tokio::time::sleep(step).await;
            slept += step;
        }
    }

    info!(
        cycles = summary.cycles,
        processed = summary.diffs_processed,
        commits = summary.commits_created,
        "daemon stopped"
    );
    summary
}
