#![forbid(unsafe_code)]

//! `forcequit`: process lifecycle CLI.
//!
//! Lists running processes with their classification, terminates them
//! singly or in bulk, restarts restart-capable ones, and can run the
//! registry and governor in the foreground while logging every change.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use forcequit::config::GlobalConfig;
use forcequit::config_watcher::ConfigWatcher;
use forcequit::host::system::{SystemHost, SystemSampler};
use forcequit::models::process::{Classification, ProcessEvent};
use forcequit::models::termination::BulkSummary;
use forcequit::orchestrator::observer::TracingObserver;
use forcequit::orchestrator::restart::NoStateHooks;
use forcequit::orchestrator::Orchestrator;
use forcequit::{AppError, Result};

/// Upper bound on waiting for the first process scan.
const INITIAL_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "forcequit", about = "Process lifecycle and restart orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List running processes with their classification.
    List {
        /// Print the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Terminate every terminable process, preserving protected and unknown ones.
    QuitAll {
        /// Confirm the bulk termination.
        #[arg(long)]
        yes: bool,
    },

    /// Terminate one process.
    Terminate {
        /// Process id.
        pid: u32,
    },

    /// Restart one restart-capable process.
    Restart {
        /// Process id.
        pid: u32,
    },

    /// Run the registry and governor, logging changes until interrupted.
    Watch,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!("configuration loaded");

    // ── Build orchestrator ──────────────────────────────
    let ct = CancellationToken::new();
    let host = Arc::new(SystemHost::new(ct.clone()));
    let orchestrator = Orchestrator::new(
        &config,
        host,
        Arc::new(SystemSampler::new()),
        Arc::new(NoStateHooks),
        Arc::new(TracingObserver),
    )?;

    // The first scan must land before any command reads the registry.
    let mut events = orchestrator.registry.observe();
    let handles = orchestrator.start(&ct);
    let _ = tokio::time::timeout(INITIAL_SCAN_TIMEOUT, async {
        while orchestrator.registry.is_empty() && events.recv().await.is_some() {}
    })
    .await;
    drop(events);

    let outcome = match args.command {
        Command::List { json } => list(&orchestrator, json),
        Command::QuitAll { yes } => quit_all(&orchestrator, yes).await,
        Command::Terminate { pid } => terminate(&orchestrator, pid).await,
        Command::Restart { pid } => restart(&orchestrator, pid).await,
        Command::Watch => watch(&orchestrator, args.config.as_deref()).await,
    };

    ct.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            error!(%err, "background task failed");
        }
    }
    outcome
}

fn list(orchestrator: &Orchestrator, json: bool) -> Result<()> {
    let snapshot = orchestrator.registry.snapshot();
    if json {
        let rendered = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| AppError::Io(format!("failed to render snapshot: {err}")))?;
        println!("{rendered}");
        return Ok(());
    }

    println!("{:>8}  {:<11}  {:>10}  NAME", "PID", "CLASS", "RSS_KIB");
    for handle in &snapshot {
        println!(
            "{:>8}  {:<11}  {:>10}  {}",
            handle.process_id,
            handle.classification.as_str(),
            handle.resource_sample.resident_bytes / 1024,
            handle.display_name
        );
    }
    Ok(())
}

async fn quit_all(orchestrator: &Orchestrator, yes: bool) -> Result<()> {
    let snapshot = orchestrator.registry.snapshot();
    let preserved = snapshot
        .iter()
        .filter(|h| h.classification != Classification::Terminable)
        .count();

    if !yes {
        let terminable = snapshot.len() - preserved;
        println!("{terminable} process(es) would be terminated, {preserved} preserved.");
        println!("Re-run with --yes to proceed.");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("interrupt received, cancelling queued terminations");
        interrupt.cancel();
    });

    let attempts = orchestrator.termination.terminate_all(|_| true, &cancel).await;
    cancel.cancel();

    let summary = BulkSummary::tally(&attempts, preserved);
    for attempt in attempts.iter().filter(|a| !a.is_confirmed()) {
        println!(
            "failed: {} (pid {}): {:?}",
            attempt.target.display_name, attempt.target.process_id, attempt.failure
        );
    }
    println!(
        "Processes quit: {}  Failed: {}  Preserved: {}",
        summary.confirmed, summary.failed, summary.preserved
    );
    Ok(())
}

async fn terminate(orchestrator: &Orchestrator, pid: u32) -> Result<()> {
    let handle = orchestrator
        .registry
        .get(pid)
        .ok_or_else(|| AppError::NotFound(format!("no process with pid {pid}")))?;
    let attempt = orchestrator.termination.terminate(handle).await;
    match &attempt.failure {
        None => println!("terminated {} (pid {pid})", attempt.target.display_name),
        Some(reason) => println!(
            "failed to terminate {} (pid {pid}): {reason:?}",
            attempt.target.display_name
        ),
    }
    Ok(())
}

async fn restart(orchestrator: &Orchestrator, pid: u32) -> Result<()> {
    let handle = orchestrator
        .registry
        .get(pid)
        .ok_or_else(|| AppError::NotFound(format!("no process with pid {pid}")))?;
    let session = orchestrator.restart.restart(handle)?.wait().await?;

    let replacement = session
        .replacement
        .as_ref()
        .map_or_else(|| "-".to_owned(), |h| h.process_id.to_string());
    println!(
        "restart {}: {} (new pid {replacement})",
        session.id,
        session.step.as_str()
    );
    if let Some(failure) = &session.failure {
        println!("  {}: {}", failure.step.as_str(), failure.reason);
    }
    Ok(())
}

async fn watch(orchestrator: &Orchestrator, config_path: Option<&std::path::Path>) -> Result<()> {
    let _watcher = match config_path {
        Some(path) => Some(ConfigWatcher::new(path, orchestrator.registry.clone())?),
        None => None,
    };

    let mut processes = orchestrator.registry.observe();
    let mut throttle = orchestrator.governor.subscribe();
    info!(known = orchestrator.registry.len(), "watching processes");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            Some(event) = processes.recv() => match event {
                ProcessEvent::Added(h) => info!(pid = h.process_id, name = %h.display_name, class = h.classification.as_str(), "added"),
                ProcessEvent::Removed(h) => info!(pid = h.process_id, name = %h.display_name, "removed"),
                ProcessEvent::Updated(h) => tracing::debug!(pid = h.process_id, class = h.classification.as_str(), "updated"),
            },
            Some(level) = throttle.recv() => {
                info!(level = level.as_str(), interval = ?orchestrator.registry.reconcile_interval(), "throttle level");
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
