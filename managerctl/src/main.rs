use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use manager_ipc::messages::{DownloadProgress, NotificationEvent, NotificationKind};
use manager_ipc::{ManagerClient, TunnelConfig};
use serde::Serialize;
use shared_utils::config::{Config, ManagerConfig};
use shared_utils::logging::{init_logging, LogOptions};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  managerctl update-state --output json\n  managerctl tunnel up --name office --endpoint vpn.example.com:51820 --dns 10.0.0.53\n  managerctl watch --count 5\n  managerctl quit --stop-tunnels")]
struct Args {
    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "warn",
        env = "TUNNEL_MANAGER_CTL_LOG_LEVEL"
    )]
    log_level: LogLevelArg,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Manager service socket (default: from the configuration file)
    #[arg(short, long, env = "TUNNEL_MANAGER_SOCKET_PATH")]
    socket: Option<PathBuf>,

    /// Configuration file used to find the socket
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the update state of the manager service
    UpdateState,
    /// Install the pending update and follow its progress
    Update {
        /// Give up waiting for progress after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Control the tunnel
    Tunnel {
        #[command(subcommand)]
        action: TunnelCmd,
    },
    /// Print notifications as they arrive
    Watch {
        /// Stop after this many notifications
        #[arg(long)]
        count: Option<usize>,
    },
    /// Ask the manager service to shut down
    Quit {
        /// Tear the tunnel down before quitting
        #[arg(long)]
        stop_tunnels: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TunnelCmd {
    Up {
        /// Tunnel name
        #[arg(long)]
        name: String,
        /// Server endpoint (host:port)
        #[arg(long)]
        endpoint: String,
        /// DNS servers to use while connected
        #[arg(long, value_delimiter = ',')]
        dns: Vec<String>,
        /// Interface MTU
        #[arg(long)]
        mtu: Option<u32>,
    },
    Down,
    Status,
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: &'a str,
}

fn print_msg(fmt: OutputFormat, status: &str, detail: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{status}: {detail}"),
        OutputFormat::Json => {
            let msg = Message { status, detail };
            println!("{}", serde_json::to_string_pretty(&msg)?);
        }
    }
    Ok(())
}

fn print_event(fmt: OutputFormat, event: &NotificationEvent) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{}", describe_event(event)),
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
    }
    Ok(())
}

fn describe_event(event: &NotificationEvent) -> String {
    match event {
        NotificationEvent::UpdateFound(state) => format!("update: {state}"),
        NotificationEvent::UpdateProgress(progress) => describe_progress(progress),
        NotificationEvent::ManagerStopping => "manager: stopping".to_string(),
        NotificationEvent::TunnelStateChanged(state) => format!("tunnel: {state}"),
    }
}

fn describe_progress(progress: &DownloadProgress) -> String {
    if let Some(error) = &progress.error {
        return format!("progress: {} failed: {error}", progress.activity);
    }
    let mut line = format!("progress: {}", progress.activity);
    if progress.bytes_total > 0 {
        line.push_str(&format!(
            " ({}/{} bytes)",
            progress.bytes_downloaded, progress.bytes_total
        ));
    }
    if progress.complete {
        line.push_str(" [complete]");
    }
    line
}

fn resolve_socket(args: &Args) -> PathBuf {
    if let Some(socket) = &args.socket {
        return socket.clone();
    }
    let path = args.config.clone().unwrap_or_else(Config::default_path);
    match Config::load(&path) {
        Ok(config) => config.manager.socket_path,
        Err(e) => {
            debug!("Using default socket ({})", e);
            ManagerConfig::default().socket_path
        }
    }
}

/// Forward notifications of the given kinds into a channel
fn forward(
    client: &ManagerClient,
    kinds: &[NotificationKind],
) -> mpsc::UnboundedReceiver<NotificationEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in kinds {
        let tx = tx.clone();
        client.subscribe(*kind, move |event| {
            let _ = tx.send(event);
        });
    }
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level: tracing::Level = args.log_level.into();
    let _guard = init_logging(LogOptions {
        level,
        json_format: args.json_logs,
        ..Default::default()
    });

    let socket = resolve_socket(&args);
    let client = ManagerClient::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;

    match args.command {
        Command::UpdateState => {
            let state = client.update_state().await?;
            print_msg(args.output, "ok", &state.to_string())?;
        }
        Command::Update { timeout_secs } => {
            let mut progress = forward(&client, &[NotificationKind::UpdateProgress]);
            client.trigger_update().await?;
            let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    Some(event) = progress.recv() => {
                        print_event(args.output, &event)?;
                        if let NotificationEvent::UpdateProgress(p) = &event {
                            if p.is_final() {
                                break;
                            }
                        }
                    }
                    _ = &mut deadline => {
                        print_msg(
                            args.output,
                            "timeout",
                            "no further progress; updates require an elevated session",
                        )?;
                        break;
                    }
                }
            }
        }
        Command::Tunnel { action } => match action {
            TunnelCmd::Up {
                name,
                endpoint,
                dns,
                mtu,
            } => {
                let config = TunnelConfig {
                    name,
                    endpoint,
                    dns_servers: dns,
                    mtu,
                };
                client.start_tunnel(config).await?;
                let state = client.tunnel_state().await?;
                print_msg(args.output, "ok", &format!("tunnel {state}"))?;
            }
            TunnelCmd::Down => {
                client.stop_tunnel().await?;
                let state = client.tunnel_state().await?;
                print_msg(args.output, "ok", &format!("tunnel {state}"))?;
            }
            TunnelCmd::Status => {
                let state = client.tunnel_state().await?;
                print_msg(args.output, "ok", &state.to_string())?;
            }
        },
        Command::Watch { count } => {
            let mut events = forward(
                &client,
                &[
                    NotificationKind::UpdateFound,
                    NotificationKind::UpdateProgress,
                    NotificationKind::ManagerStopping,
                    NotificationKind::TunnelStateChanged,
                ],
            );
            let mut seen = 0;
            while let Some(event) = events.recv().await {
                print_event(args.output, &event)?;
                seen += 1;
                if count.is_some_and(|limit| seen >= limit)
                    || event == NotificationEvent::ManagerStopping
                {
                    break;
                }
            }
        }
        Command::Quit { stop_tunnels } => {
            let already_quit = client.quit(stop_tunnels).await?;
            let detail = if already_quit {
                "manager service was already quitting"
            } else {
                "manager service is shutting down"
            };
            print_msg(args.output, "ok", detail)?;
        }
    }

    client.close().await?;
    info!("managerctl command completed");
    Ok(())
}
