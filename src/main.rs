//! ProxyChan - Entry Point
//!
//! CLI for running the proxy and administering its store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use proxychan::admin;
use proxychan::config::{Mode, RunArgs};
use proxychan::connection::ConnectionRegistry;
use proxychan::dialer::{load_chain_config, BaseDialer, DialPlan, DirectDialer, TorDialer};
use proxychan::error::CliError;
use proxychan::policy::{DestPolicy, SourcePolicy};
use proxychan::server::{HttpServer, ServerState, SocksServer};
use proxychan::store::FileStore;
use proxychan::util::init_tracing;
use proxychan::VERSION;

/// ProxyChan - SOCKS5/HTTP CONNECT tunneling proxy
#[derive(Parser)]
#[command(name = "proxychan")]
#[command(version = VERSION)]
#[command(about = "SOCKS5 and HTTP CONNECT tunneling proxy with chained egress")]
struct Cli {
    /// Override the state directory (store, admin secret)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run(RunArgs),
    /// Create a user (active by default)
    AddUser { username: String, password: String },
    /// Delete a user
    RemoveUser { username: String },
    /// List users and their active flag
    ListUsers,
    /// Mark a user active
    ActivateUser { username: String },
    /// Mark a user inactive without deleting it
    DeactivateUser { username: String },
    /// Allow a source IP or CIDR
    AllowIp { cidr: String },
    /// Disable a source allowlist entry
    BlockIp { cidr: String },
    /// Hard-delete a source allowlist entry
    DeleteAllowedIp { cidr: String },
    /// Disable every non-localhost allowlist entry
    ClearAllowlist,
    /// List source allowlist entries
    ListAllowed,
    /// Add or re-enable a destination deny rule (IP, CIDR, domain, or
    /// .suffix)
    BlockDest { pattern: String },
    /// Disable a destination deny rule
    AllowDest { pattern: String },
    /// Hard-delete a destination deny rule
    DeleteDest { pattern: String },
    /// List destination deny rules
    ListDest,
    /// Show active connections grouped by source IP (requires a running
    /// proxy)
    Connections,
}

fn main() {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    let result = match cli.command {
        Commands::Run(args) => run_server(args, data_dir),
        command => admin_command(command, data_dir),
    };

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(e.exit_code());
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("proxychan");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("proxychan");
    }
    PathBuf::from(".proxychan")
}

#[tokio::main]
async fn run_server(args: RunArgs, data_dir: PathBuf) -> Result<(), CliError> {
    init_tracing("info", "pretty").map_err(|e| CliError::Runtime(e.to_string()))?;

    args.validate()?;

    info!(version = VERSION, data_dir = %data_dir.display(), "Starting ProxyChan");

    let store = Arc::new(FileStore::open(&data_dir)?);
    let source_policy = Arc::new(SourcePolicy::from_store(&store)?);
    let dest_policy = Arc::new(DestPolicy::from_store(&store)?);
    let registry = ConnectionRegistry::new();

    let hops = if args.dynamic_chain {
        load_chain_config(&PathBuf::from(&args.chain_config))?.chain
    } else {
        Vec::new()
    };

    let base = match args.mode {
        Mode::Direct => BaseDialer::Direct(DirectDialer::new(args.connect_timeout)),
        Mode::Tor => BaseDialer::Tor(TorDialer::new(args.tor_socks.clone(), args.connect_timeout)),
    };

    let plan = if hops.is_empty() {
        DialPlan::new(base)
    } else {
        DialPlan::chained(base, hops)?
    };

    let require_auth = args.require_auth();

    let state = Arc::new(ServerState {
        plan,
        store: store.clone(),
        source_policy: source_policy.clone(),
        dest_policy: dest_policy.clone(),
        registry: registry.clone(),
        require_auth,
        idle_timeout: args.idle_timeout,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(
        source_policy
            .clone()
            .run_poller(store.clone(), shutdown_rx.clone()),
    );
    tokio::spawn(
        dest_policy
            .clone()
            .run_poller(store.clone(), shutdown_rx.clone()),
    );

    let socks = SocksServer::bind(&args.listen, state.clone())
        .await
        .map_err(|e| CliError::Runtime(format!("{e:#}")))?;
    let http = if args.http_listen.is_empty() {
        None
    } else {
        Some(
            HttpServer::bind(&args.http_listen, state.clone())
                .await
                .map_err(|e| CliError::Runtime(format!("{e:#}")))?,
        )
    };

    let secret = store.admin_secret()?;
    admin::start_admin_server(
        admin::ADMIN_ADDR.parse().expect("static addr parses"),
        registry.clone(),
        secret,
    )
    .map_err(|e| CliError::Runtime(format!("failed to start admin endpoint: {e}")))?;

    info!(
        listen = %args.listen,
        http_listen = %args.http_listen,
        mode = ?args.mode,
        require_auth,
        "proxy started"
    );

    let socks_task = tokio::spawn(socks.run(shutdown_rx.clone()));
    let http_task = http.map(|server| tokio::spawn(server.run(shutdown_rx.clone())));

    shutdown_signal().await;
    info!("Shutdown signal received, draining tunnels in place");
    let _ = shutdown_tx.send(true);

    if let Ok(Err(e)) = socks_task.await {
        error!(error = %e, "SOCKS5 listener error");
    }
    if let Some(task) = http_task {
        if let Ok(Err(e)) = task.await {
            error!(error = %e, "HTTP listener error");
        }
    }

    info!("Server stopped");
    Ok(())
}

fn admin_command(command: Commands, data_dir: PathBuf) -> Result<(), CliError> {
    let store = FileStore::open(&data_dir)?;

    match command {
        Commands::Run(_) => unreachable!("run is dispatched separately"),
        Commands::AddUser { username, password } => {
            store.add_user(&username, &password)?;
            println!("user {username} created");
        }
        Commands::RemoveUser { username } => {
            store.remove_user(&username)?;
            println!("user {username} removed");
        }
        Commands::ListUsers => {
            let users = store.list_users();
            if users.is_empty() {
                println!("no users");
            }
            for (name, active) in users {
                let status = if active { "active" } else { "inactive" };
                println!("{name}\t{status}");
            }
        }
        Commands::ActivateUser { username } => {
            store.set_active(&username, true)?;
            println!("user {username} activated");
        }
        Commands::DeactivateUser { username } => {
            store.set_active(&username, false)?;
            println!("user {username} deactivated");
        }
        Commands::AllowIp { cidr } => {
            let stored = store.allow_ip(&cidr)?;
            println!("allowed {stored}");
        }
        Commands::BlockIp { cidr } => {
            let stored = store.block_ip(&cidr)?;
            println!("blocked {stored}");
        }
        Commands::DeleteAllowedIp { cidr } => {
            let stored = store.delete_allowed_ip(&cidr)?;
            println!("deleted {stored}");
        }
        Commands::ClearAllowlist => {
            store.clear_allowlist()?;
            println!("allowlist cleared (localhost entries kept)");
        }
        Commands::ListAllowed => {
            for (cidr, enabled) in store.list_allowlist() {
                let status = if enabled { "enabled" } else { "disabled" };
                println!("{cidr}\t{status}");
            }
        }
        Commands::BlockDest { pattern } => {
            let (stored, kind) = store.block_dest(&pattern)?;
            println!("blocked {stored} ({})", kind.as_str());
        }
        Commands::AllowDest { pattern } => {
            let stored = store.allow_dest(&pattern)?;
            println!("unblocked {stored}");
        }
        Commands::DeleteDest { pattern } => {
            let stored = store.delete_dest(&pattern)?;
            println!("deleted {stored}");
        }
        Commands::ListDest => {
            for rule in store.list_denylist() {
                let status = if rule.enabled { "enabled" } else { "disabled" };
                println!("{}\t{}\t{}", rule.pattern, rule.kind.as_str(), status);
            }
        }
        Commands::Connections => {
            let secret = store.admin_secret()?;
            let addr = admin::ADMIN_ADDR.parse().expect("static addr parses");
            let groups = admin::fetch_connections_by_ip(addr, &secret)
                .map_err(|e| CliError::External(e.to_string()))?;
            if groups.is_empty() {
                println!("no active connections");
            }
            for group in groups {
                println!("{} ({} connections)", group.source_ip, group.count);
                for conn in group.conns {
                    let user = if conn.username.is_empty() {
                        "-".to_string()
                    } else {
                        conn.username
                    };
                    println!("  [{}] {} -> {}", conn.id, user, conn.destination);
                }
            }
        }
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
