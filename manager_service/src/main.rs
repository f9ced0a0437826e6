//! Tunnel Manager Service
//!
//! This is the privileged daemon of the tunnel client. Unprivileged UIs
//! connect to its Unix Domain Socket to control the tunnel, query update
//! status and receive state-change notifications.

use clap::Parser;
use manager_service::{ManagerService, ShutdownReason};
use shared_utils::config::{Config, ConfigError};
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// Command-line arguments for the manager service
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the Unix Domain Socket for IPC (overrides the configuration)
    #[clap(short, long)]
    socket_path: Option<PathBuf>,

    /// Log level (overrides the configuration)
    #[clap(short, long)]
    log_level: Option<String>,

    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to daily files in this directory
    #[clap(long)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[clap(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config_result = Config::load(&config_path);
    let mut config = match &config_result {
        Ok(config) => config.clone(),
        Err(_) => Config::default().with_env_overrides()?,
    };
    if let Some(socket_path) = args.socket_path {
        config.manager.socket_path = socket_path;
    }

    // Initialize tracing-based logging
    let level = parse_level(args.log_level.as_deref().unwrap_or(&config.log_level));
    let _guard = init_logging(LogOptions {
        level,
        json_format: args.json_logs,
        log_dir: args.log_dir.clone(),
    });

    info!("Tunnel Manager Service starting up");

    match config_result {
        Ok(_) => info!("Loaded configuration from {}", config_path.display()),
        Err(ConfigError::FileNotFound(_)) => {
            info!(
                "No configuration at {}, using defaults",
                config_path.display()
            );
        }
        Err(e) => {
            warn!(
                "Failed to load configuration from {}: {}",
                config_path.display(),
                e
            );
            warn!("Using default configuration");
        }
    }
    debug!("Socket path: {}", config.manager.socket_path.display());
    debug!("Admin UIDs: {:?}", config.manager.admin_uids);
    debug!("Admin GIDs: {:?}", config.manager.admin_gids);

    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root; privileged tunnel operations may fail");
    }

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    };

    let reason = ManagerService::new(config.manager).run(shutdown).await?;
    if reason == ShutdownReason::Quit {
        info!("Shut down at the request of a client");
    }

    info!("Tunnel Manager Service shut down");
    Ok(())
}
