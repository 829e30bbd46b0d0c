mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::config::PublisherConfig;
use crate::state::AppState;
use clap::{Parser, Subcommand};
use launcher_updater::fs::atomic::write_atomic;
use launcher_updater::integrity::signing::{Signer, DEFAULT_KEY_BITS, PUBLIC_KEY_FILE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "release-publisher")]
#[command(about = "Builds, signs and serves launcher releases")]
struct Args {
    /// Release directory (overrides PUBLISHER_RELEASE_DIR)
    #[arg(short, long)]
    release_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a signing key pair
    Keygen {
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,

        /// Replace an existing key pair
        #[arg(long)]
        force: bool,
    },
    /// Publish a release tree as a new version
    Publish {
        source: PathBuf,

        #[arg(long)]
        version: String,

        /// Also point version.txt at this release
        #[arg(long)]
        current: bool,
    },
    /// Build a delta package between two release trees
    Delta {
        old: PathBuf,
        new: PathBuf,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },
    /// Point launchers at an already published version
    SetCurrent { version: String },
    /// Serve the release directory over HTTP
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = PublisherConfig::from_env();
    if let Some(dir) = args.release_dir {
        config.release_dir = dir;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    match args.command {
        Command::Keygen { bits, force } => {
            if config.keys_dir.join(PUBLIC_KEY_FILE).exists() && !force {
                anyhow::bail!(
                    "keys already exist in {} (use --force to replace)",
                    config.keys_dir.display()
                );
            }
            let signer = Signer::generate(bits)?;
            signer.save_keys(&config.keys_dir)?;
            publish_public_key(&signer, &config.release_dir)?;
        }
        Command::Publish {
            source,
            version,
            current,
        } => {
            let signer = load_signer(&config);
            let report = services::publish::publish_release(
                &source,
                &version,
                &config.release_dir,
                &config.files_list_prefix,
                signer.as_ref(),
            )?;
            if let Some(signer) = &signer {
                publish_public_key(signer, &config.release_dir)?;
            }
            if current {
                services::publish::set_current_version(
                    &config.release_dir,
                    &version,
                    config.launcher_version.as_deref(),
                )?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Delta { old, new, from, to } => {
            let signer = load_signer(&config);
            match services::publish::publish_delta(
                &old,
                &new,
                &from,
                &to,
                &config.release_dir,
                signer.as_ref(),
            )? {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => println!("Delta {} -> {} not beneficial, skipped", from, to),
            }
        }
        Command::SetCurrent { version } => {
            services::publish::set_current_version(
                &config.release_dir,
                &version,
                config.launcher_version.as_deref(),
            )?;
        }
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await?;
        }
    }

    Ok(())
}

/// Releases are signed only when a key pair exists.
fn load_signer(config: &PublisherConfig) -> Option<Signer> {
    match Signer::load(&config.keys_dir) {
        Ok(signer) => Some(signer),
        Err(e) => {
            tracing::warn!(
                "No signing key in {} ({}), publishing unsigned",
                config.keys_dir.display(),
                e
            );
            None
        }
    }
}

/// Launchers fetch the verification key next to the releases.
fn publish_public_key(signer: &Signer, release_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(release_dir)?;
    write_atomic(
        &release_dir.join(PUBLIC_KEY_FILE),
        signer.public_key_pem()?.as_bytes(),
    )?;
    Ok(())
}

async fn serve(config: PublisherConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.release_dir)?;
    tracing::info!(
        "Serving releases from {} on port {}",
        config.release_dir.display(),
        config.port
    );

    let state = Arc::new(AppState::new(config.clone()));
    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let cancel = CancellationToken::new();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
