//! Edge VPN control daemon (edgevpnd)
//!
//! Supervises ocserv, answers its authentication callbacks, allocates
//! per-group virtual addresses and reconciles online sessions.
//!
//! # Usage
//!
//! ```bash
//! # Run the control plane (default subcommand)
//! sudo edgevpnd --config /etc/edgevpn/edgevpn.toml
//!
//! # Print the ocserv configuration that would be generated
//! edgevpnd render-config
//!
//! # Inspect state
//! edgevpnd status
//! edgevpnd list-leases --group default
//! edgevpnd list-online
//! edgevpnd audit-log --limit 20
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use libedgevpn::daemon::{check_binary_available, template};
use libedgevpn::error::EdgeError;
use libedgevpn::{
    router, Allocator, AuthCallbackHandler, DaemonControl, DaemonState, ExternalStatePoller,
    IdleReaper, Occtl, Scheduler, ServerConfig, SessionManager, SessionRegistry, SessionSettings,
    Store, Supervisor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "/etc/edgevpn/edgevpn.toml";

/// Edge VPN control daemon
#[derive(Parser, Debug)]
#[command(name = "edgevpnd")]
#[command(version)]
#[command(about = "Control plane for an ocserv VPN edge", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane until SIGINT/SIGTERM
    Run,
    /// Print the effective configuration as TOML
    ShowConfig,
    /// Print the generated ocserv configuration
    RenderConfig,
    /// Ask the VPN daemon for its status
    Status,
    /// List address leases of a group
    ListLeases {
        /// Group name
        #[arg(long, default_value = "default")]
        group: String,
    },
    /// List online sessions
    ListOnline,
    /// Show recent authentication attempts
    AuditLog {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Disconnect a user through the daemon and clear their session
    Disconnect {
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = ServerConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::RenderConfig => {
            let params = template::DaemonConfigParams::from_config(&config);
            print!("{}", template::generate_config(&params)?);
            Ok(())
        }
        Commands::Status => status(&config).await,
        Commands::ListLeases { group } => list_leases(&config, &group).await,
        Commands::ListOnline => list_online(&config).await,
        Commands::AuditLog { limit } => audit_log(&config, limit).await,
        Commands::Disconnect { username } => disconnect(&config, &username).await,
    }
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "edgevpnd={},libedgevpn={},tower_http={}",
            log_level, log_level, log_level
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &ServerConfig) -> anyhow::Result<Store> {
    Store::open(&config.server.db_path)
        .await
        .with_context(|| format!("opening database {}", config.server.db_path.display()))
}

fn session_manager(config: &ServerConfig, store: &Store) -> Arc<SessionManager> {
    let control: Arc<dyn DaemonControl> = Arc::new(Occtl::new(config.daemon.control_binary.clone()));
    Arc::new(SessionManager::new(
        store.clone(),
        Arc::new(Allocator::new(store.clone())),
        Arc::new(SessionRegistry::new()),
        control,
        SessionSettings {
            device: config.daemon.device.clone(),
            mtu: config.network.mtu,
        },
    ))
}

async fn run(mut config: ServerConfig) -> anyhow::Result<()> {
    info!("Starting Edge VPN control daemon (edgevpnd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - the VPN daemon may fail to start");
        }
    }

    config.ensure_directories()?;
    let store = open_store(&config).await?;
    config.apply_overrides(&store.settings().await?);
    config.validate()?;

    let sessions = session_manager(&config, &store);

    // The daemon may be restarted later with SIGHUP, so launch failures are not fatal
    let supervisor = Supervisor::new(config.clone(), store.clone());
    if !check_binary_available(&config.daemon.binary).await {
        warn!("{} not found in PATH", config.daemon.binary);
    }
    if let Err(e) = supervisor.start().await {
        error!("VPN daemon not started: {}", e);
    }

    let mut scheduler = Scheduler::new();
    scheduler.spawn(
        Arc::new(ExternalStatePoller::new(sessions.clone())),
        Duration::from_secs(config.intervals.poll_secs),
    );
    scheduler.spawn(
        Arc::new(IdleReaper::new(sessions.clone(), config.system.idle_timeout)),
        Duration::from_secs(config.intervals.reap_secs),
    );

    let handler = Arc::new(AuthCallbackHandler::new(
        store.clone(),
        sessions.clone(),
        config.network.dns.clone(),
        config.network.mtu,
    ));
    let listener = tokio::net::TcpListener::bind(config.server.callback_listen)
        .await
        .with_context(|| format!("binding {}", config.server.callback_listen))?;
    info!("Callbacks listening on http://{}", config.server.callback_listen);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(handler))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    info!("Edge VPN control daemon is ready");
    if let Err(e) = handle_signals(&supervisor).await {
        error!("Signal handler error: {}", e);
    }

    info!("Shutting down...");
    scheduler.shutdown().await;

    let _ = stop_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Callback server error: {}", e),
        Err(e) => warn!("Callback server task failed: {}", e),
    }

    match supervisor.stop().await {
        Ok(()) | Err(EdgeError::NotRunning) => {}
        Err(e) => warn!("Failed to stop VPN daemon: {}", e),
    }

    store.close().await;
    info!("Edge VPN control daemon stopped");
    Ok(())
}

/// Wait for SIGINT/SIGTERM. SIGHUP starts the VPN daemon again if it is down.
async fn handle_signals(supervisor: &Supervisor) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                return Ok(());
            }
            _ = sighup.recv() => {
                if supervisor.state() == DaemonState::Stopped {
                    info!("Received SIGHUP, starting VPN daemon");
                    if let Err(e) = supervisor.start().await {
                        error!("VPN daemon not started: {}", e);
                    }
                } else {
                    info!("Received SIGHUP, VPN daemon already {:?}", supervisor.state());
                }
            }
        }
    }
}

async fn status(config: &ServerConfig) -> anyhow::Result<()> {
    let control = Occtl::new(config.daemon.control_binary.clone());
    let status = control.show_status().await;

    println!("Daemon:       {}", if status.running { "running" } else { "stopped" });
    match status.active_users {
        Some(count) => println!("Active users: {}", count),
        None => println!("Active users: -"),
    }
    if let Some(error) = status.error {
        println!("Error:        {}", error);
    }
    Ok(())
}

async fn list_leases(config: &ServerConfig, group: &str) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let group = store
        .group_by_name(group)
        .await?
        .ok_or_else(|| EdgeError::NotFound(format!("group {}", group)))?;

    let allocator = Allocator::new(store.clone());
    println!("{:<16} {:<24} ALLOCATED", "ADDRESS", "USERNAME");
    for lease in allocator.leases(group.id).await? {
        println!(
            "{:<16} {:<24} {}",
            lease.address.to_string(),
            lease.username,
            lease.allocated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn list_online(config: &ServerConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    println!(
        "{:<20} {:<12} {:<16} {:<16} {:>12} {:>12} CONNECTED",
        "USERNAME", "GROUP", "VIRTUAL IP", "REMOTE IP", "UPLOAD", "DOWNLOAD"
    );
    for row in store.online().await? {
        println!(
            "{:<20} {:<12} {:<16} {:<16} {:>12} {:>12} {}",
            row.username,
            row.group_name,
            row.virtual_ip,
            row.remote_ip,
            row.total_upload,
            row.total_download,
            row.connected_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn audit_log(config: &ServerConfig, limit: u32) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    for record in store.recent_audit(limit).await? {
        println!(
            "{} {:<8} {:<20} {:<16} {} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.action,
            record.username,
            record.remote_ip,
            if record.success { "ok  " } else { "FAIL" },
            record.message
        );
    }
    Ok(())
}

async fn disconnect(config: &ServerConfig, username: &str) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let sessions = session_manager(config, &store);
    if sessions.force_disconnect(username).await? {
        println!("Disconnected {}", username);
    } else {
        println!("{} had no open session", username);
    }
    Ok(())
}
