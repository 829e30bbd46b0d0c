//! Launcher Updater - command line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use launcher_updater::{
    backup::collect_install_files,
    config::Config,
    orchestrator::{SelfUpdater, UpdateOrchestrator, UpdateServices},
    sources::p2p::{seed_router, SeedIndex},
    transfer::{format_bytes, format_duration},
    utils::{self, shutdown::ShutdownCoordinator},
    UpdateEvent,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the update plan and whether a launcher update exists
    Check,
    /// Apply every pending version
    Update,
    /// Update the launcher package itself
    SelfUpdate,
    /// Restore the backup taken for a version
    Rollback { version: String },
    /// Inspect or prune backups
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Probe every mirror and print pool statistics
    Mirrors,
    /// Serve installed files to peers until interrupted
    Seed {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    List,
    Cleanup {
        /// Backups to keep (defaults to backup.keep_count)
        #[arg(short, long)]
        keep: Option<usize>,
    },
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("launcher-updater v{}", env!("CARGO_PKG_VERSION"));

    let services = Arc::new(UpdateServices::from_config(&config)?);

    match args.command {
        Command::Check => check(services).await,
        Command::Update => update(services).await,
        Command::SelfUpdate => {
            match SelfUpdater::new(services).apply().await? {
                Some(version) => println!("Launcher updated to {} (restart to apply)", version),
                None => println!("Launcher is up to date"),
            }
            Ok(())
        }
        Command::Rollback { version } => {
            let report = UpdateOrchestrator::new(services).rollback(&version).await?;
            println!(
                "Rolled back to {}: {}/{} files restored",
                report.version, report.restored, report.total
            );
            for path in report.failed {
                println!("  not restored: {}", path.display());
            }
            Ok(())
        }
        Command::Backups { action } => backups(&services, &config, action),
        Command::Mirrors => {
            let healthy = services.sources.check_all().await;
            let stats = services.sources.stats().await;
            println!("{} of {} mirrors healthy", healthy, stats.total_mirrors);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Seed { port } => seed(services, &config, port).await,
    }
}

async fn check(services: Arc<UpdateServices>) -> Result<()> {
    let orchestrator = UpdateOrchestrator::new(services.clone());
    let check = orchestrator.check().await?;
    if check.plan.is_empty() {
        println!("Up to date ({}; remote {})", check.current, check.latest);
    } else {
        println!("{} -> {}: {}", check.current, check.latest, check.plan.join(", "));
    }

    match SelfUpdater::new(services).check().await {
        Ok(launcher) if launcher.update_available => println!(
            "Launcher update available: {} -> {}",
            launcher.current,
            launcher.latest.unwrap_or_default()
        ),
        Ok(launcher) => println!("Launcher {} is current", launcher.current),
        Err(e) => tracing::warn!("Launcher update check failed: {}", e),
    }
    Ok(())
}

async fn update(services: Arc<UpdateServices>) -> Result<()> {
    let orchestrator = Arc::new(UpdateOrchestrator::new(services.clone()));

    let mut events = services.events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UpdateEvent::TransferProgress(p)) => {
                    tracing::info!(
                        "{:>5.1}% {} of {} at {}, {} left",
                        p.percent,
                        format_bytes(p.transferred_bytes),
                        format_bytes(p.total_bytes),
                        p.speed,
                        format_duration(p.eta_seconds)
                    );
                }
                Ok(UpdateEvent::PhaseChanged { version, phase }) => {
                    tracing::info!("[{}] {:?}", version.unwrap_or_default(), phase);
                }
                Ok(UpdateEvent::Completed { .. }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::debug!("Dropped {} progress events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();
    let canceller = orchestrator.clone();
    let watcher = tokio::spawn(async move {
        shutdown.wait_for_signal().await;
        canceller.cancel().await;
    });

    let outcome = orchestrator.run().await;
    token.cancel();
    let _ = watcher.await;
    let _ = printer.await;

    println!("{}", outcome.message);
    if !outcome.success {
        anyhow::bail!("update did not complete");
    }
    Ok(())
}

fn backups(services: &UpdateServices, config: &Config, action: BackupAction) -> Result<()> {
    let rollback = services
        .rollback
        .as_ref()
        .context("backups are disabled in the configuration")?;
    let vault = rollback.vault();

    match action {
        BackupAction::List => {
            for record in vault.list_backups()? {
                println!(
                    "{:<24} {}  {:>6} files  {:>10}  {}",
                    record.version,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.files_count,
                    format_bytes(record.size_bytes),
                    record.description
                );
            }
        }
        BackupAction::Cleanup { keep } => {
            let removed = vault.cleanup_old_backups(keep.unwrap_or(config.backup.keep_count))?;
            println!("Removed {} old backup(s)", removed);
        }
        BackupAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&vault.storage_stats()?)?);
        }
    }
    Ok(())
}

async fn seed(services: Arc<UpdateServices>, config: &Config, port: Option<u16>) -> Result<()> {
    let index = Arc::new(SeedIndex::new());
    let install_dir = config.updater.install_dir.clone();
    let files = tokio::task::spawn_blocking(move || collect_install_files(&install_dir)).await??;
    for file in &files {
        if let Err(e) = index.add_file(file).await {
            tracing::warn!("Not seeding {}: {}", file.display(), e);
        }
    }
    tracing::info!("Seeding {} file(s)", index.len().await);

    if let Some(peers) = &services.peers {
        match peers.announce(&index).await {
            Ok(known) => tracing::info!("Tracker knows {} peer(s)", known),
            Err(e) => tracing::warn!("Tracker announce failed: {}", e),
        }
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.p2p.port)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();
    let server = axum::serve(listener, seed_router(index))
        .with_graceful_shutdown(async move { token.cancelled().await });
    let server_handle = tokio::spawn(async move { server.await });

    shutdown.wait_for_signal().await;

    match tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Seed server stopped"),
        Ok(Ok(Err(e))) => tracing::error!("Seed server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Seed server task panicked: {}", e),
        Err(_) => tracing::warn!("Seed server shutdown timeout, forcing exit"),
    }
    Ok(())
}
