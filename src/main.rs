//! Sumi-Strata main entry point
//!
//! This is the command-line interface for the Sumi-Strata archive scheduler.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sumi_strata::archive::JobOutcome;
use sumi_strata::config::{load_config_with_hash, Config};
use sumi_strata::detect::format_change_report;
use sumi_strata::output::{generate_report, load_statistics, print_statistics, write_markdown_report};
use sumi_strata::reanalysis::{acknowledge, pending_signals};
use sumi_strata::scheduler::{CrawlTarget, DispatchItem, DispatchPlan, ManualCrawl};
use sumi_strata::state::CrawlEngine;
use sumi_strata::storage::{SqliteStorage, Storage};
use sumi_strata::Scheduler;
use tracing_subscriber::EnvFilter;

/// Sumi-Strata: versioned web archival for tracked project sites
///
/// Sumi-Strata crawls project websites on adaptive schedules, stores every
/// capture as a WARC artifact, and compares consecutive snapshots to flag
/// significant changes for reanalysis. Without a mode flag it runs as a
/// scheduler daemon until interrupted.
#[derive(Parser, Debug)]
#[command(name = "sumi-strata")]
#[command(version = "1.0.0")]
#[command(about = "Versioned web archival for tracked project sites", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Show what the next dispatch cycle would crawl and skip
    #[arg(long, group = "mode")]
    dry_run: bool,

    /// List queued and running jobs plus due work
    #[arg(long, group = "mode")]
    list_pending: bool,

    /// Create default schedules for configured projects and exit
    #[arg(long, group = "mode")]
    init_schedules: bool,

    /// Show statistics from the database and exit
    #[arg(long, group = "mode")]
    stats: bool,

    /// Write the markdown archive report and exit
    #[arg(long, group = "mode")]
    export_report: bool,

    /// Crawl a project (by code) or a URL now
    #[arg(long, value_name = "PROJECT_CODE|URL", group = "mode")]
    crawl: Option<String>,

    /// List changes awaiting reanalysis
    #[arg(long, group = "mode")]
    reanalysis: bool,

    /// Clear the reanalysis flag of a change record
    #[arg(long, value_name = "CHANGE_ID", requires = "reanalysis")]
    acknowledge: Option<i64>,

    /// Crawl engine for --crawl (simple, browsertrix, brozzler)
    #[arg(long, value_parser = parse_engine, requires = "crawl")]
    engine: Option<CrawlEngine>,

    /// Maximum link depth for --crawl
    #[arg(long, requires = "crawl")]
    max_depth: Option<u32>,

    /// Maximum pages for --crawl
    #[arg(long, requires = "crawl")]
    max_pages: Option<u32>,

    /// Override the concurrent crawl ceiling
    #[arg(long)]
    max_concurrent: Option<usize>,
}

fn parse_engine(value: &str) -> Result<CrawlEngine, String> {
    CrawlEngine::from_db_string(&value.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown engine '{}'", value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if let Some(max) = cli.max_concurrent {
        if max == 0 {
            bail!("--max-concurrent must be at least 1");
        }
        config.scheduler.max_concurrent_crawls = max;
    }

    if cli.stats {
        handle_stats(&config)
    } else if cli.export_report {
        handle_export_report(&config)
    } else if cli.reanalysis {
        handle_reanalysis(&config, cli.acknowledge)
    } else if cli.dry_run {
        handle_dry_run(config)
    } else if cli.list_pending {
        handle_list_pending(config)
    } else if cli.init_schedules {
        handle_init_schedules(config)
    } else if let Some(target) = cli.crawl.as_deref() {
        let request = ManualCrawl {
            target: CrawlTarget::parse(target),
            engine: cli.engine,
            max_depth: cli.max_depth,
            max_pages: cli.max_pages,
        };
        handle_crawl(config, request).await
    } else {
        handle_daemon(config).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_strata=info,warn"),
            1 => EnvFilter::new("sumi_strata=debug,info"),
            2 => EnvFilter::new("sumi_strata=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn open_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let path = &config.storage.database_path;
    SqliteStorage::new(Path::new(path)).with_context(|| format!("failed to open database {}", path))
}

fn print_plan(plan: &DispatchPlan) {
    if plan.is_empty() {
        println!("Nothing is due.");
        return;
    }

    println!("Would dispatch ({}):", plan.dispatch.len());
    for item in &plan.dispatch {
        match item {
            DispatchItem::Retry(job) => println!(
                "  - retry {} {} (attempt {} of {})",
                job.id,
                job.seed_url,
                job.retry_count + 1,
                job.max_retries
            ),
            DispatchItem::Scheduled(due) => println!(
                "  - {} {} ({}, priority {})",
                due.project_code, due.seed_url, due.schedule.frequency, due.schedule.priority
            ),
        }
    }

    if !plan.skipped.is_empty() {
        println!("\nWould skip ({}):", plan.skipped.len());
        for (due, reason) in &plan.skipped {
            println!("  - {} {}: {}", due.project_code, due.seed_url, reason);
        }
    }
}

/// Handles the --dry-run mode: shows the next cycle without crawling
fn handle_dry_run(config: Config) -> anyhow::Result<()> {
    println!("=== Sumi-Strata Dry Run ===\n");
    println!("Database: {}", config.storage.database_path);
    println!(
        "Concurrency: {} crawls, poll every {}s\n",
        config.scheduler.max_concurrent_crawls, config.scheduler.poll_interval_secs
    );

    let scheduler = Scheduler::from_config(config)?;
    let plan = scheduler.dry_run()?;
    print_plan(&plan);
    Ok(())
}

/// Handles the --list-pending mode
fn handle_list_pending(config: Config) -> anyhow::Result<()> {
    let scheduler = Scheduler::from_config(config)?;
    let overview = scheduler.list_pending()?;

    println!("Running ({}):", overview.in_progress.len());
    for job in &overview.in_progress {
        println!(
            "  - {} {} (started {})",
            job.id,
            job.seed_url,
            job.started_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    println!("\nQueued ({}):", overview.pending_jobs.len());
    for job in &overview.pending_jobs {
        println!(
            "  - {} {} (not before {})",
            job.id,
            job.seed_url,
            job.next_scheduled_run
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "now".to_string())
        );
    }
    println!();

    print_plan(&overview.plan);
    Ok(())
}

/// Handles the --init-schedules mode
fn handle_init_schedules(config: Config) -> anyhow::Result<()> {
    let scheduler = Scheduler::from_config(config)?;
    let created = scheduler.init_schedules()?;
    println!("✓ Created {} default schedules", created);
    Ok(())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);
    let storage = open_storage(config)?;
    let stats = load_statistics(&storage, 10)?;
    print_statistics(&stats);
    Ok(())
}

/// Handles the --export-report mode: writes the markdown report
fn handle_export_report(config: &Config) -> anyhow::Result<()> {
    println!("=== Exporting Archive Report ===\n");
    println!("Database: {}", config.storage.database_path);
    println!("Output: {}", config.storage.report_path);
    println!();

    let storage = open_storage(config)?;
    tracing::info!("Loading archive data from database...");
    let report = generate_report(&storage, 20)?;
    write_markdown_report(&report, Path::new(&config.storage.report_path))?;

    println!("✓ Report exported to: {}", config.storage.report_path);
    Ok(())
}

/// Handles the --reanalysis mode: lists or acknowledges flagged changes
fn handle_reanalysis(config: &Config, acknowledge_id: Option<i64>) -> anyhow::Result<()> {
    let mut storage = open_storage(config)?;

    if let Some(change_id) = acknowledge_id {
        acknowledge(&mut storage, change_id)?;
        println!("✓ Change {} acknowledged", change_id);
        return Ok(());
    }

    let threshold = config.detection.significance_threshold;
    let signals = pending_signals(&storage, threshold)?;
    println!("Changes awaiting reanalysis ({}):\n", signals.len());
    for signal in &signals {
        let change = storage.change_for_new_snapshot(signal.new_snapshot_id)?;
        println!("[{}] {} {}", signal.change_id, signal.project_code, signal.seed_url);
        if let Some(change) = change {
            println!("{}", format_change_report(&change));
        }
    }
    Ok(())
}

/// Handles the --crawl mode: one manual crawl, then exit
async fn handle_crawl(config: Config, request: ManualCrawl) -> anyhow::Result<()> {
    let scheduler = Scheduler::from_config(config)?;
    scheduler.sync_projects()?;

    let result = scheduler.trigger_manual(&request).await?;
    match (&result.outcome, result.snapshot_version()) {
        (JobOutcome::Completed { processing_error, .. }, Some(version)) => {
            println!("✓ Job {} captured snapshot v{}", result.job_id, version);
            if let Some(change) = result.change() {
                println!("{}", format_change_report(change));
            }
            if let Some(error) = processing_error {
                println!("! Snapshot left incomplete: {}", error);
            }
        }
        (JobOutcome::Failed { message, .. }, _) => {
            bail!("job {} failed: {}", result.job_id, message);
        }
        (JobOutcome::Cancelled, _) => {
            bail!("job {} was cancelled", result.job_id);
        }
        (_, None) => {
            bail!("job {} completed but no snapshot was recorded", result.job_id);
        }
    }
    Ok(())
}

/// Runs the scheduler until Ctrl-C
async fn handle_daemon(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        "Tracking {} configured projects; database {}",
        config.projects.len(),
        config.storage.database_path
    );

    let scheduler = Arc::new(Scheduler::from_config(config)?);

    let signal_target = Arc::clone(&scheduler);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                signal_target.request_shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    scheduler.run_daemon().await?;
    tracing::info!("Scheduler stopped");
    Ok(())
}
