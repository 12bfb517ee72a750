//! AEGIS Gateway Node Entry Point
//!
//! Runs one gateway node:
//! - route table kept in sync with the cluster over NATS (or in-process)
//! - edge filter: blacklist, bearer token verification, trust header rewrite
//! - route-aware forwarding to origins or the upstream engine
//! - admin API for route and blacklist management
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (single node, in-process broadcast, local reloads)
//! aegis-gateway
//!
//! # Run with a config file
//! aegis-gateway --config /etc/aegis/gateway.toml
//!
//! # Override log filter (RUST_LOG is honored too)
//! aegis-gateway --log-level aegis_gateway=debug
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aegis_gateway::admin_api::AdminApi;
use aegis_gateway::auth_filter::EdgeAuthFilter;
use aegis_gateway::blacklist::{BlacklistRegistry, FileBlacklist, FixedBlacklist, StaticBlacklistSource};
use aegis_gateway::config::Config;
use aegis_gateway::distributed_lock::{DistributedMutex, RedisLockBackend};
use aegis_gateway::proxy::{run_gateway, GatewayProxy};
use aegis_gateway::route_bus::{LocalRouteBus, NatsBusConfig, NatsRouteBus, RouteEventBus};
use aegis_gateway::route_manager::DynamicRouteManager;
use aegis_gateway::route_store::SqliteRouteStore;
use aegis_gateway::snowflake::SnowflakeIdGenerator;
use aegis_gateway::token::{parse_algorithm, TokenVerifier};
use aegis_gateway::GatewayError;

/// AEGIS Gateway Node
#[derive(Parser, Debug)]
#[command(name = "aegis-gateway")]
#[command(author = "AEGIS Team")]
#[command(version = "0.1.0")]
#[command(about = "AEGIS cluster-synchronized API gateway node", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter directive (e.g. "info", "aegis_gateway=debug")
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let filter = match &args.log_level {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    info!("Starting AEGIS Gateway v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    // Route store, broadcast channel, lock backend
    let store = Arc::new(
        SqliteRouteStore::open(&config.store.database_path)
            .with_context(|| format!("Failed to open route store {}", config.store.database_path))?,
    );

    let bus: Arc<dyn RouteEventBus> = match &config.sync.nats_url {
        Some(url) => Arc::new(
            NatsRouteBus::connect(NatsBusConfig {
                server_url: url.clone(),
                subject: config.sync.subject.clone(),
            })
            .await?,
        ),
        None => {
            info!("No NATS URL configured, route changes stay in this process");
            Arc::new(LocalRouteBus::new())
        }
    };

    // Electing a broadcaster needs a lock every node can see
    let reload_lock = match &config.redis.url {
        Some(url) => Some(Arc::new(DistributedMutex::new(Arc::new(
            RedisLockBackend::connect(url).await?,
        )))),
        None => {
            info!("No Redis URL configured, each node reloads its own route table");
            None
        }
    };

    // Route manager
    let manager = Arc::new(DynamicRouteManager::new(store, Arc::clone(&bus)));
    match manager.reload().await {
        Ok(count) => info!("Loaded {} routes", count),
        Err(GatewayError::NoRoutesDefined) => warn!("Route store is empty; serving 404 until routes are added"),
        Err(e) => return Err(e).context("Initial route load failed"),
    }

    let sync_task = manager.spawn_sync(bus.subscribe().await?);
    let reload_task = manager.spawn_periodic_reload(
        config.sync.reload_interval(),
        reload_lock,
        config.sync.reload_lock_key.clone(),
    );

    // Blacklist
    let static_source: Arc<dyn StaticBlacklistSource> = match &config.blacklist.static_file {
        Some(path) => Arc::new(FileBlacklist::new(path)),
        None => Arc::new(FixedBlacklist::new(config.blacklist.static_ips.clone())),
    };
    let blacklist = Arc::new(BlacklistRegistry::new(
        static_source,
        Duration::from_secs(config.blacklist.refresh_secs),
    ));
    blacklist.load_bootstrap_file(&config.blacklist.bootstrap_file).await?;
    if let Err(e) = blacklist.reload_static().await {
        warn!("Static blacklist unavailable at startup: {:#}", e);
    }

    // Edge filter and proxy
    let verifier = match &config.auth.public_key_path {
        Some(path) => Some(TokenVerifier::from_pem_file(
            path,
            parse_algorithm(&config.auth.algorithm)?,
            config.auth.issuer.as_deref(),
            config.auth.leeway_secs,
        )?),
        None => None,
    };
    let ids = Arc::new(SnowflakeIdGenerator::new(
        config.id_generator.worker_id,
        config.id_generator.datacenter_id,
    )?);
    let filter = Arc::new(EdgeAuthFilter::new(
        config.auth.filter_config(),
        Arc::clone(&blacklist),
        verifier,
    )?);
    let proxy = Arc::new(GatewayProxy::new(
        filter,
        manager.subscribe_table(),
        ids,
        config.server.upstream.clone(),
    ));

    // Listeners
    let admin_addr: SocketAddr = config.server.admin_addr.parse()?;
    let gateway_addr: SocketAddr = config.server.gateway_addr.parse()?;

    let admin = Arc::new(AdminApi::new(Arc::clone(&manager), blacklist));
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin.run(admin_addr).await {
            error!("Admin API error: {}", e);
        }
    });
    let gateway_task = tokio::spawn(async move {
        if let Err(e) = run_gateway(gateway_addr, proxy).await {
            error!("Gateway error: {}", e);
        }
    });

    info!("Gateway configuration:");
    info!("  Gateway: {}", gateway_addr);
    info!("  Admin:   {}", admin_addr);
    info!("  Upstream engine: {}", config.server.upstream);
    info!("  Reload interval: {}s", config.sync.reload_interval_secs);
    info!("Gateway ready! Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for task in [sync_task, reload_task, admin_task, gateway_task] {
        task.abort();
    }

    Ok(())
}
