use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stickydhcp::api::{self, HttpLeaseSource};
use stickydhcp::inspect::{self, Listing};
use stickydhcp::{
    AllocationPolicy, Config, DhcpServer, Engine, FailoverCoordinator, HttpProbe, LeaseSource,
    PeerProbe, RedisStore, Resolver, Result, Role,
};

#[derive(Parser)]
#[command(name = "stickydhcp")]
#[command(
    author,
    version,
    about = "DHCP server with shared-store sticky bindings",
    long_about = None
)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Overrides `failover.role`.
    #[arg(long, value_enum)]
    role: Option<RoleArg>,

    /// Overrides `failover.peer` (host:port of the peer heartbeat).
    #[arg(long)]
    peer: Option<String>,

    /// Lets a standby that has taken over allocate from the pool.
    #[arg(long)]
    allow_standby_allocation: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Active,
    Standby,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Active => Role::Active,
            RoleArg::Standby => Role::Standby,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DHCP daemon (default).
    Run,
    /// Run the HTTP resolution service.
    Api,
    /// List store contents.
    Show {
        #[command(subcommand)]
        what: ShowCommand,
    },
    ShowConfig,
}

#[derive(Subcommand)]
enum ShowCommand {
    Groups,
    Clients,
    Mac,
    Pool,
}

impl From<ShowCommand> for Listing {
    fn from(command: ShowCommand) -> Self {
        match command {
            ShowCommand::Groups => Listing::Groups,
            ShowCommand::Clients => Listing::Clients,
            ShowCommand::Mac => Listing::Mac,
            ShowCommand::Pool => Listing::Pool,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = Config::load_or_create(&cli.config)?;
    if let Some(role) = cli.role {
        config.failover.role = role.into();
    }
    if let Some(peer) = cli.peer {
        config.failover.peer = Some(peer);
    }
    if cli.allow_standby_allocation {
        config.failover.allow_standby_allocation = true;
    }
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Api => run_api(config).await,
        Commands::Show { what } => {
            let store = RedisStore::connect(&config.store.redis_url, config.store_timeout()).await?;
            print!("{}", inspect::render(&store, what.into()).await?);
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn allocation_policy(config: &Config) -> AllocationPolicy {
    AllocationPolicy {
        role: config.failover.role,
        allow_standby: config.failover.allow_standby_allocation,
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    info!(
        "Starting DHCP daemon as {:?} with config: {:?}",
        config.failover.role, config
    );

    let source: Arc<dyn LeaseSource> = match &config.api.url {
        Some(url) => {
            info!("Resolving leases through {}", url);
            Arc::new(HttpLeaseSource::new(url, config.api_timeout())?)
        }
        None => {
            let store = RedisStore::connect(&config.store.redis_url, config.store_timeout()).await?;
            Arc::new(Resolver::load(Arc::new(store), allocation_policy(&config)).await?)
        }
    };

    let probe = match &config.failover.peer {
        Some(peer) if config.failover.role == Role::Standby => {
            let probe: Arc<dyn PeerProbe> = Arc::new(HttpProbe::new(peer, config.probe_timeout())?);
            Some(probe)
        }
        _ => None,
    };
    let failover = FailoverCoordinator::new(&config.failover, probe);

    let engine = Engine::new(config.server_ip, source, failover);
    let server = DhcpServer::new(&config, engine)?;

    let heartbeat = TcpListener::bind(config.failover.heartbeat_listen).await?;
    let heartbeat = tokio::spawn(api::serve(heartbeat, api::heartbeat_router()));

    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
            Ok(())
        }
    };
    heartbeat.abort();
    result
}

async fn run_api(config: Config) -> Result<()> {
    let store = RedisStore::connect(&config.store.redis_url, config.store_timeout()).await?;
    let resolver = Resolver::load(Arc::new(store), allocation_policy(&config)).await?;

    let listener = TcpListener::bind(config.api.listen).await?;
    let router = api::router(Arc::new(resolver));

    tokio::select! {
        result = api::serve(listener, router) => {
            if let Err(error) = &result {
                error!("Resolution service stopped: {}", error);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping resolution service...");
            Ok(())
        }
    }
}
