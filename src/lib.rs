// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod executor;
pub mod hooks;
pub mod logging;
pub mod perform;
pub mod policy;
pub mod queue;
pub mod shutdown;
pub mod supervisor;
pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::config::{ConfigFile, load_and_validate};
use crate::executor::ProcessBackend;
use crate::executor::child::run_executor_main;
use crate::hooks::CommandHooks;
use crate::queue::{Job, JobQueue, SpoolQueue};
use crate::shutdown::{ShutdownController, signals};
use crate::supervisor::{OrphanRecovery, SupervisorSettings, WorkerSupervisor};

/// High-level entry point used by `main.rs`.
///
/// Loads the config, then dispatches on the subcommand. `work` wires
/// together:
/// - the spool queue under `worker.queue_dir`
/// - the process backend (re-executing this binary in executor mode)
/// - command hooks
/// - OS signal handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = Path::new(&args.config);
    let cfg = load_and_validate(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    match args.command {
        Command::Work { interval, dry_run } => {
            let interval = interval.unwrap_or(cfg.worker.interval);
            if dry_run {
                print_dry_run(&cfg, interval);
                return Ok(());
            }
            work(config_path, &cfg, interval).await
        }
        Command::Enqueue { command } => {
            let queue = open_queue(&cfg).await?;
            let job = Job::new(command);
            queue.enqueue(job.clone()).await?;
            println!("{}", job.id);
            Ok(())
        }
        Command::Status => print_status(&open_queue(&cfg).await?).await,
        Command::Recover => {
            let queue = Arc::new(open_queue(&cfg).await?);
            let recovered = OrphanRecovery::new(queue, std::process::id())
                .recover(None)
                .await?;
            println!("recovered {recovered} orphaned job(s)");
            Ok(())
        }
        Command::Executor => run_executor_main(&cfg)
            .await
            .context("executor process failed"),
    }
}

async fn open_queue(cfg: &ConfigFile) -> Result<SpoolQueue> {
    SpoolQueue::open(&cfg.worker.queue_dir)
        .await
        .with_context(|| format!("opening queue at {}", cfg.worker.queue_dir.display()))
}

async fn work(config_path: &Path, cfg: &ConfigFile, interval: Duration) -> Result<()> {
    let queue = Arc::new(open_queue(cfg).await?);

    let shutdown = ShutdownController::new(cfg.shutdown);
    let _signals = signals::listen(shutdown.clone()).context("installing signal handlers")?;

    // Executors may run with a different working directory than ours.
    let config_path = std::path::absolute(config_path)?;
    let backend = ProcessBackend::current_exe(&config_path, cfg.worker.handshake_timeout)?;
    let hooks = Arc::new(CommandHooks::new(cfg.hooks.clone()));

    let mut supervisor = WorkerSupervisor::new(
        backend,
        queue,
        hooks,
        shutdown,
        cfg.fork,
        SupervisorSettings::from(&cfg.worker),
    );
    let summary = supervisor.run(interval).await?;

    info!(
        forks = summary.forks,
        processed = summary.jobs_processed,
        orphans = summary.orphans_recovered,
        stop = ?summary.stop,
        "work finished"
    );
    Ok(())
}

async fn print_status(queue: &SpoolQueue) -> Result<()> {
    let stats = queue.stats().await?;
    println!("queue: {}", queue.root().display());
    println!("  pending: {}", stats.pending);
    println!("  claimed: {}", stats.claimed);
    println!("  done:    {}", stats.done);
    println!("  failed:  {}", stats.failed);
    if stats.rejected > 0 {
        println!("  rejected: {}", stats.rejected);
    }

    let claims = queue.claims().await?;
    if !claims.is_empty() {
        println!();
        println!("claims ({}):", claims.len());
        for claim in claims {
            println!(
                "  - {} executor={} claimed_at_ms={} cmd: {}",
                claim.job.id, claim.executor, claim.claimed_at_ms, claim.job.payload
            );
        }
    }
    Ok(())
}

/// Simple dry-run output: print the effective policies.
fn print_dry_run(cfg: &ConfigFile, interval: Duration) {
    println!("multifork dry-run");
    println!("  worker.queue_dir = {}", cfg.worker.queue_dir.display());
    println!("  worker.interval = {}", humantime::format_duration(interval));
    println!(
        "  worker.handshake_timeout = {}",
        humantime::format_duration(cfg.worker.handshake_timeout)
    );
    println!(
        "  worker.max_fork_failures = {} (retry after {})",
        cfg.worker.max_fork_failures,
        humantime::format_duration(cfg.worker.fork_retry_delay)
    );
    println!();

    println!("fork:");
    match cfg.fork.time_limit() {
        Some(limit) => println!("  seconds_per_fork: {}", humantime::format_duration(limit)),
        None => println!("  seconds_per_fork: unlimited"),
    }
    match cfg.fork.job_limit() {
        Some(limit) => println!("  jobs_per_fork: {limit}"),
        None => println!("  jobs_per_fork: unlimited"),
    }
    if !cfg.fork.start_lag.is_zero() {
        println!("  start_lag: {}", humantime::format_duration(cfg.fork.start_lag));
    }

    println!("shutdown:");
    println!("  term_child: {}", cfg.shutdown.term_child);
    println!("  graceful_term: {}", cfg.shutdown.graceful_term);
    println!(
        "  term_timeout: {}",
        humantime::format_duration(cfg.shutdown.term_timeout)
    );

    let hooks = [
        ("before_fork", &cfg.hooks.before_fork),
        ("after_fork", &cfg.hooks.after_fork),
        ("before_child_exit", &cfg.hooks.before_child_exit),
    ];
    if hooks.iter().any(|(_, cmd)| cmd.is_some()) {
        println!("hooks:");
        for (name, cmd) in hooks {
            if let Some(cmd) = cmd {
                println!("  {name}: {cmd}");
            }
        }
    }

    debug!("dry-run complete (no execution)");
}
