//! Ariadne command-line tool.
//!
//! Provides subcommands for initializing a diff bus, submitting patches,
//! running orchestration cycles (once or as a daemon), inspecting diffs and
//! conflicts, and applying operator resolutions.

mod signals;
mod style;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use ariadne_core::bus::Bus;
use ariadne_core::config::{AppConfig, LOCAL_CONFIG_FILE};
use ariadne_core::models::{BusStatus, MergeStrategy, Partition};
use ariadne_core::orchestrator::{OrchestrationResult, Orchestrator};
use ariadne_core::scheduler::{run_daemon, DaemonOptions};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Ariadne command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "ariadne",
    version,
    about = "Coordinate, verify and merge diffs from parallel workers"
)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to ./ariadne.toml, then the platform config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Repository the commit phase mutates (overrides [repo] path).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Bus root directory (overrides [bus] root).
    #[arg(long, global = true)]
    bus: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the bus directory layout.
    Init,

    /// Show bus counts.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Submit a patch read from a file or stdin.
    Submit {
        #[arg(long)]
        work_id: String,

        #[arg(long)]
        producer: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Patch file; stdin when omitted.
        #[arg(long)]
        patch: Option<PathBuf>,
    },

    /// Run one orchestration cycle.
    Process {
        /// Commit verified diffs when no conflict is unresolved.
        #[arg(long)]
        auto_commit: bool,
    },

    /// Run orchestration cycles until interrupted.
    Daemon {
        /// Seconds between cycles.
        #[arg(long)]
        interval: Option<u64>,

        #[arg(long)]
        auto_commit: bool,

        /// Stop after this many consecutive idle cycles.
        #[arg(long)]
        max_idle: Option<u32>,

        /// Log filter, e.g. `info` or `ariadne_core=debug`.
        #[arg(long)]
        log_level: Option<String>,
    },

    /// List diffs in one partition.
    Diffs {
        /// pending, verified, rejected or merged.
        partition: Partition,
    },

    /// List recorded conflicts.
    Conflicts {
        /// Only conflicts awaiting a decision.
        #[arg(long)]
        unresolved: bool,

        /// Analyze pending and verified diffs instead of listing records.
        #[arg(long, conflicts_with = "unresolved")]
        scan: bool,
    },

    /// Resolve one conflict and attempt the commit.
    Resolve {
        /// Conflict ID.
        id: String,

        /// sequential, interleave, escalate or reject.
        #[arg(long)]
        strategy: MergeStrategy,
    },

    /// Check the configuration and print the effective values.
    Validate,

    /// Delete every record in the bus and reinitialize it.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    let level = match &cli.command {
        Commands::Daemon { log_level, .. } => log_level
            .clone()
            .unwrap_or_else(|| config.daemon.log_level.clone()),
        _ => "warn".to_string(),
    };
    init_logging(&level);

    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Status { json } => cmd_status(&config, json),
        Commands::Submit {
            work_id,
            producer,
            description,
            patch,
        } => cmd_submit(&config, &work_id, &producer, &description, patch.as_deref()),
        Commands::Process { auto_commit } => cmd_process(config, auto_commit).await,
        Commands::Daemon {
            interval,
            auto_commit,
            max_idle,
            ..
        } => cmd_daemon(config, interval, auto_commit, max_idle).await,
        Commands::Diffs { partition } => cmd_diffs(&config, partition),
        Commands::Conflicts { unresolved, scan } => {
            if scan {
                cmd_scan_conflicts(&config)
            } else {
                cmd_conflicts(&config, unresolved)
            }
        }
        Commands::Resolve { id, strategy } => cmd_resolve(&config, id, strategy).await,
        Commands::Validate => cmd_validate(&config),
        Commands::Reset { yes } => cmd_reset(&config, yes),
    }
}

fn init_logging(level: &str) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("ariadne").join("config.toml"));
    }
    candidates
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => AppConfig::load_first(&config_candidates())
            .context("failed to load configuration file")?
            .0,
    };

    if let Some(repo) = &cli.repo {
        config.repo.path = repo.clone();
    }
    if let Some(bus) = &cli.bus {
        config.bus.root = Some(bus.clone());
    }
    Ok(config)
}

fn open_bus(config: &AppConfig) -> Result<Bus> {
    let root = config.bus_root();
    Bus::open(&root).with_context(|| format!("failed to open bus at {}", root.display()))
}

fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    config.validate().context("invalid configuration")?;
    Orchestrator::from_config(config).context("failed to set up orchestrator")
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} {msg}") {
        let ticks = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
        spinner.set_style(style.tick_strings(&ticks));
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(config: &AppConfig) -> Result<()> {
    let bus = Bus::new(config.bus_root());
    let manifest = bus.initialize().context("failed to initialize bus")?;

    println!("{}", style::success(&format!("Bus ready at {}", bus.root().display())));
    println!("  Created  : {}", manifest.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Version  : {}", manifest.version);
    Ok(())
}

fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let bus = Bus::new(config.bus_root());
    let status = bus.status_summary().context("failed to read bus status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("{}", style::header("Ariadne Bus"));
    println!("  Root       {}", bus.root().display());
    println!("  Repository {}", config.repo.path.display());
    if !status.initialized {
        println!();
        println!("  {}", style::dim("Bus not initialized. Run 'ariadne init' first."));
        println!();
        return Ok(());
    }
    println!();
    println!("{}", status_table(&status));
    println!();
    Ok(())
}

fn status_table(status: &BusStatus) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Item", "Count"]);
    let rows = [
        ("Pending diffs", status.diffs.pending),
        ("Verified diffs", status.diffs.verified),
        ("Rejected diffs", status.diffs.rejected),
        ("Merged diffs", status.diffs.merged),
        ("Conflicts", status.conflicts.total),
        ("Unresolved conflicts", status.conflicts.unresolved),
        ("Merges", status.merges),
        ("Prepared commits", status.commits_ready),
    ];
    for (label, count) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(count)]);
    }
    table
}

fn cmd_submit(
    config: &AppConfig,
    work_id: &str,
    producer: &str,
    description: &str,
    patch: Option<&Path>,
) -> Result<()> {
    let content = match patch {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read patch {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read patch from stdin")?;
            buf
        }
    };
    if content.trim().is_empty() {
        anyhow::bail!("patch is empty");
    }

    let bus = open_bus(config)?;
    let id = bus
        .submit_patch(work_id, producer, &content, description, None)
        .context("failed to submit diff")?;
    println!("{}", id);
    Ok(())
}

async fn cmd_process(mut config: AppConfig, auto_commit: bool) -> Result<()> {
    config.commit.auto_commit |= auto_commit;
    let orchestrator = build_orchestrator(&config)?;

    let spinner = spinner("Processing pending diffs...");
    let result = orchestrator.process_pending().await;
    spinner.finish_and_clear();

    let result = result.context("orchestration cycle failed")?;
    print_result(&result)?;
    Ok(())
}

fn print_result(result: &OrchestrationResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    for err in &result.errors {
        eprintln!("{}", style::error(err));
    }
    Ok(())
}

async fn cmd_daemon(
    mut config: AppConfig,
    interval: Option<u64>,
    auto_commit: bool,
    max_idle: Option<u32>,
) -> Result<()> {
    if let Some(secs) = interval {
        config.daemon.poll_interval_secs = secs;
    }
    if max_idle.is_some() {
        config.daemon.max_idle_cycles = max_idle;
    }
    config.commit.auto_commit |= auto_commit;

    let orchestrator = build_orchestrator(&config)?;
    let shutdown = signals::setup_signal_handlers();

    println!(
        "{}",
        style::success(&format!(
            "Daemon started (every {}s, auto-commit {})",
            config.daemon.poll_interval_secs,
            if orchestrator.auto_commit() { "on" } else { "off" }
        ))
    );

    let summary = run_daemon(&orchestrator, DaemonOptions::from(&config.daemon), shutdown).await;

    println!(
        "{}",
        style::success(&format!(
            "Daemon stopped after {} cycle(s): {} diff(s) processed, {} commit(s)",
            summary.cycles, summary.diffs_processed, summary.commits_created
        ))
    );
    if summary.failed_cycles > 0 {
        println!(
            "{}",
            style::warn(&format!("{} cycle(s) failed; see the log", summary.failed_cycles))
        );
    }
    Ok(())
}

fn cmd_diffs(config: &AppConfig, partition: Partition) -> Result<()> {
    let bus = open_bus(config)?;
    let diffs = bus
        .list(partition)
        .with_context(|| format!("failed to list {} diffs", partition))?;

    if diffs.is_empty() {
        println!("{}", style::dim(&format!("No {} diffs.", partition)));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Status", "Work", "Producer", "Files", "Submitted", "Note"]);

    for diff in &diffs {
        let files = diff.all_affected_files().into_iter().collect::<Vec<_>>().join(", ");
        let note = match &diff.verification_error {
            Some(error) => truncate(error, 60),
            None => truncate(&diff.description, 60),
        };
        table.add_row(vec![
            Cell::new(&diff.id),
            Cell::new(style::status(diff.status)),
            Cell::new(&diff.work_id),
            Cell::new(&diff.producer_id),
            Cell::new(files),
            Cell::new(diff.submitted_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(note),
        ]);
    }

    println!("{}", table);
    println!("{} {} diff(s)", diffs.len(), partition);
    Ok(())
}

fn cmd_conflicts(config: &AppConfig, unresolved: bool) -> Result<()> {
    let bus = open_bus(config)?;
    let filter = unresolved.then_some(false);
    let conflicts = bus.list_conflicts(filter).context("failed to list conflicts")?;

    if conflicts.is_empty() {
        println!("{}", style::success("No conflicts"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Type", "Diff A", "Diff B", "Files", "Strategy", "State"]);

    for c in &conflicts {
        table.add_row(vec![
            Cell::new(&c.id),
            Cell::new(c.conflict_type),
            Cell::new(&c.diff_a_id),
            Cell::new(&c.diff_b_id),
            Cell::new(c.affected_files.join(", ")),
            Cell::new(c.suggested_strategy),
            Cell::new(style::resolved(c.resolved)),
        ]);
    }

    println!("{}", table);
    println!("{} conflict(s)", conflicts.len());
    Ok(())
}

fn cmd_scan_conflicts(config: &AppConfig) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let open = orchestrator
        .pending_conflicts()
        .context("failed to analyze conflicts")?;

    if open.is_empty() {
        println!("{}", style::success("No conflicts need a decision"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Severity", "Diff A", "Diff B", "Files", "Strategy", "State"]);

    let bus = orchestrator.bus();
    for analysis in &open {
        let c = &analysis.conflict;
        let recorded = bus.get_conflict(&c.id).context("failed to read conflict")?.is_some();
        let state = if recorded {
            "recorded".to_string()
        } else {
            style::dim("awaiting verification")
        };
        table.add_row(vec![
            Cell::new(&c.id),
            Cell::new(analysis.severity),
            Cell::new(&c.diff_a_id),
            Cell::new(&c.diff_b_id),
            Cell::new(c.affected_files.join(", ")),
            Cell::new(c.suggested_strategy),
            Cell::new(state),
        ]);
    }

    println!("{}", table);
    println!("{} conflict(s) need a decision", open.len());
    Ok(())
}

async fn cmd_resolve(config: &AppConfig, id: String, strategy: MergeStrategy) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    if orchestrator
        .bus()
        .get_conflict(&id)
        .context("failed to read conflict")?
        .is_none()
    {
        anyhow::bail!("conflict '{}' not found", id);
    }

    let mut decisions = BTreeMap::new();
    decisions.insert(id.clone(), strategy);

    let spinner = spinner("Resolving and committing...");
    let result = orchestrator.resolve_and_commit(&decisions).await;
    spinner.finish_and_clear();
    let result = result.context("resolution failed")?;

    if result.conflicts_resolved > 0 {
        println!("{}", style::success(&format!("Conflict {} resolved ({})", id, strategy)));
    }
    if result.commits_created > 0 {
        println!("{}", style::success("Verified diffs committed"));
    }
    for err in &result.errors {
        println!("{}", style::warn(err));
    }
    Ok(())
}

fn cmd_validate(config: &AppConfig) -> Result<()> {
    match config.validate() {
        Ok(()) => println!("{}", style::success("Configuration is valid")),
        Err(e) => {
            println!("{}", style::error(&e.to_string()));
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("  Repository    : {}", config.repo.path.display());
    println!("  Bus root      : {}", config.bus_root().display());
    println!("  Typecheck     : {}", config.verify.typecheck_cmd.join(" "));
    println!("  Lint          : {}", config.verify.lint_cmd.join(" "));
    println!("  Tests         : {}", config.verify.test_cmd.join(" "));
    println!("  Parallelism   : {}", config.verify.max_parallel);
    println!(
        "  Causal level  : {}",
        if config.conflicts.causal_level { "on" } else { "off" }
    );
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Auto-commit   : {}", if config.commit.auto_commit { "on" } else { "off" });
    println!(
        "  Commit author : {} <{}>",
        config.commit.author_name, config.commit.author_email
    );
    Ok(())
}

fn cmd_reset(config: &AppConfig, yes: bool) -> Result<()> {
    let bus = Bus::new(config.bus_root());
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete every diff, conflict and merge under {}?",
                bus.root().display()
            ))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !confirmed {
            println!("{}", style::dim("Reset cancelled."));
            return Ok(());
        }
    }

    bus.reset().context("failed to reset bus")?;
    println!("{}", style::success(&format!("Bus reset at {}", bus.root().display())));
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
