use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cracklord::config::{DispatcherConfig, QueueConfig, TlsConfig, DEFAULT_RESOURCE_PORT};
use cracklord::dashboard;
use cracklord::grpc::server::ResourceServer;
use cracklord::scheduler::manager::DIRECT_MANAGER;
use cracklord::scheduler::{DirectManager, Queue};
use cracklord::shutdown::install_shutdown_handler;
use cracklord::tool::timer::TimerTool;
use cracklord::worker::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "cracklord")]
#[command(version)]
#[command(about = "Queue and resource servers for distributed password recovery jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the queue: scheduler, keeper and optional dashboard
    Queue(QueueArgs),

    /// Run a resource server hosting the built-in tools
    Resource(ResourceArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct TlsArgs {
    /// Enable mutual TLS between queue and resources
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Fall back to plaintext when --tls is given but certs are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

impl From<TlsArgs> for TlsConfig {
    fn from(args: TlsArgs) -> Self {
        TlsConfig {
            enabled: args.tls,
            ca_cert_path: args.ca_cert,
            cert_path: args.cert,
            key_path: args.key,
            allow_insecure: args.allow_insecure,
        }
    }
}

// =============================================================================
// Queue Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct QueueArgs {
    /// Seconds between keeper ticks
    #[arg(long, default_value = "30")]
    keeper_interval: u64,

    /// Per-call RPC timeout in seconds
    #[arg(long, default_value = "10")]
    rpc_timeout: u64,

    /// Seconds a finished job is kept before it is purged (0 keeps forever)
    #[arg(long, default_value = "604800")]
    purge_after: u64,

    /// Snapshot file used for crash recovery
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// SQLite database mirroring job records
    #[arg(long)]
    job_db: Option<PathBuf>,

    /// Address for the read-only dashboard (optional)
    #[arg(long)]
    dashboard_addr: Option<SocketAddr>,

    /// Shared token presented to every resource
    #[arg(long, env = "CRACKLORD_AUTH_TOKEN")]
    auth_token: String,

    /// Resource to connect at startup, as "name=address" (repeatable)
    #[arg(long = "resource", value_parser = parse_resource)]
    resources: Vec<(String, String)>,

    #[command(flatten)]
    tls: TlsArgs,
}

// =============================================================================
// Resource Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct ResourceArgs {
    /// Address to serve the resource RPC service on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_RESOURCE_PORT)))]
    listen: SocketAddr,

    /// Token the queue must present
    #[arg(long, env = "CRACKLORD_AUTH_TOKEN")]
    auth_token: String,

    /// Tick of the timer test tool, in milliseconds
    #[arg(long, default_value = "1000")]
    timer_tick_ms: u64,

    #[command(flatten)]
    tls: TlsArgs,
}

fn parse_resource(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, address)) if !name.is_empty() && !address.is_empty() => {
            Ok((name.to_string(), address.to_string()))
        }
        _ => Err(format!("expected name=address, got '{}'", s)),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Queue Server
// =============================================================================

async fn run_queue(args: QueueArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = QueueConfig {
        keeper_interval: Duration::from_secs(args.keeper_interval.max(1)),
        rpc_timeout: Duration::from_secs(args.rpc_timeout.max(1)),
        purge_after: (args.purge_after > 0).then(|| Duration::from_secs(args.purge_after)),
        state_file: args.state_file,
        job_db: args.job_db,
        tls: args.tls.into(),
        ..QueueConfig::default()
    };

    tracing::info!(
        keeper_interval_secs = config.keeper_interval.as_secs(),
        state_file = ?config.state_file,
        job_db = ?config.job_db,
        dashboard_addr = ?args.dashboard_addr,
        tls_enabled = config.tls.enabled,
        "Starting queue"
    );

    let queue = Queue::new(config).await?;
    queue
        .add_resource_manager(Arc::new(DirectManager::new(&queue, args.auth_token)))
        .await?;

    for (name, address) in args.resources {
        let params = BTreeMap::from([("address".to_string(), address.clone())]);
        match queue
            .add_managed_resource(DIRECT_MANAGER, &name, &address, params)
            .await
        {
            Ok(id) => tracing::info!(resource_id = %id, name, address, "Resource connected"),
            Err(e) => tracing::error!(name, address, error = %e, "Failed to add resource"),
        }
    }

    let shutdown = install_shutdown_handler()?;
    let dashboard = args.dashboard_addr.map(|addr| {
        tokio::spawn(dashboard::run_dashboard(addr, queue.clone(), shutdown.clone()))
    });

    shutdown.cancelled().await;

    let jobs = queue.quit().await;
    tracing::info!(jobs = jobs.len(), "Queue shut down");
    if let Some(dashboard) = dashboard {
        let _ = dashboard.await;
    }
    Ok(())
}

// =============================================================================
// Resource Server
// =============================================================================

async fn run_resource(args: ResourceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = DispatcherConfig {
        listen_addr: args.listen,
        auth_token: args.auth_token,
        timer_tick: Duration::from_millis(args.timer_tick_ms.max(1)),
        tls: args.tls.into(),
    };

    let dispatcher = Dispatcher::new(config.auth_token.clone())
        .with_tool(Arc::new(TimerTool::cpu(config.timer_tick)))
        .with_tool(Arc::new(TimerTool::gpu(config.timer_tick)));

    let shutdown = install_shutdown_handler()?;
    ResourceServer::new(config, Arc::new(dispatcher))
        .run(shutdown)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Queue(queue_args) => run_queue(queue_args).await?,
        Commands::Resource(resource_args) => run_resource(resource_args).await?,
    }
    Ok(())
}
