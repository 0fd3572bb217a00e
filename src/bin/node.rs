//! Election node binary

use clap::{Parser, Subcommand};
use leasehold::admin::{self, AdminState};
use leasehold::common::{parse_duration, resolve_host, Config, MetricsRegistry};
use leasehold::election::{
    ChangeNotifier, ElectionCoordinator, ElectionStore, ResilientExecutor, RetryPolicy,
    SqliteElectionStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "leasehold-node")]
#[command(about = "Lease-based leader election over a shared SQL store")]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Contend for the configured keys and serve the admin API
    Serve {
        /// Identity written to the election table
        #[arg(long)]
        host: Option<String>,

        /// Election database
        #[arg(long)]
        db: Option<PathBuf>,

        /// Admin API bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Election keys (comma-separated)
        #[arg(long, value_delimiter = ',')]
        key: Vec<String>,

        /// Tick period, e.g. "2s"
        #[arg(long)]
        tick: Option<String>,

        /// Lease length, e.g. "10s"
        #[arg(long)]
        lease: Option<String>,
    },
    /// Print the election table as JSON
    List {
        /// Election database
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            host,
            db,
            bind,
            key,
            tick,
            lease,
        } => {
            // CLI has priority over file and environment
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(db) = db {
                config.store.path = db;
            }
            if let Some(bind) = bind {
                config.admin.bind_addr = bind;
            }
            if !key.is_empty() {
                config.election.keys = key;
            }
            if let Some(tick) = tick {
                config.election.tick_interval_ms = duration_ms(&tick)?;
            }
            if let Some(lease) = lease {
                config.election.lease_time_ms = duration_ms(&lease)?;
            }
            config.election.validate()?;
            serve(config).await?;
        }
        Commands::List { db } => {
            if let Some(db) = db {
                config.store.path = db;
            }
            let store = SqliteElectionStore::open_existing(&config.store.path, 1)?;
            let records = store.list_all(config.election.lease_time()).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn duration_ms(s: &str) -> anyhow::Result<u64> {
    u64::try_from(parse_duration(s)?.as_millis())
        .map_err(|_| anyhow::anyhow!("duration out of range: {}", s))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let (host, stable) = resolve_host(&config.host);
    if !stable {
        tracing::warn!(
            host = %host,
            "no host identity configured; a restart will not resume held leases"
        );
    }

    tracing::info!("Starting election node: {}", host);
    tracing::info!("  Store: {}", config.store.path.display());
    tracing::info!(
        "  Tick: {}ms, lease: {}ms",
        config.election.tick_interval_ms,
        config.election.lease_time_ms
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let store: Arc<dyn ElectionStore> = Arc::new(SqliteElectionStore::open(
        &config.store.path,
        config.store.pool_size,
    )?);
    let exec = ResilientExecutor::new(RetryPolicy::from(&config.store), metrics.clone());
    let notifier = ChangeNotifier::new();
    let coordinator = Arc::new(ElectionCoordinator::new(
        host,
        config.election.clone(),
        store,
        exec,
        notifier.clone(),
    ));

    // Log every transition this process observes
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    key = %event.key,
                    is_leader = event.is_leader,
                    leader = %event.leader_host,
                    "leadership changed"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "leadership event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    for key in &config.election.keys {
        if let Err(e) = coordinator.start_leader_election(key).await {
            tracing::error!(key = %key, error = %e, "failed to start leader election");
        }
    }

    let shutdown = CancellationToken::new();
    let admin_handle = if config.admin.enabled {
        let state = AdminState {
            coordinator: coordinator.clone(),
            metrics: metrics.clone(),
        };
        let token = shutdown.clone();
        Some(tokio::spawn(admin::serve(
            config.admin.bind_addr,
            state,
            async move { token.cancelled().await },
        )))
    } else {
        None
    };

    tracing::info!(
        "✓ Node ready ({} elections)",
        coordinator.running_elections().len()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    coordinator.stop_leader_elections().await;
    shutdown.cancel();
    if let Some(handle) = admin_handle {
        if let Err(e) = handle.await? {
            tracing::error!("Admin API error: {}", e);
        }
    }

    Ok(())
}
