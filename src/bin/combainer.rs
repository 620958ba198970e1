//! The combaine agent daemon.
//!
//! Joins the gossip cluster, starts the raft node and its HTTP transport,
//! and runs the assignment engine plus whatever task runners land here.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use combaine_cache::TtlCache;
use combaine_cluster::{ensure_state_dir, Cluster, ClusterOptions};
use combaine_node::transport::UdpTransport;
use combaine_repository::{ClusterConfig, Repository};
use combaine_worker::{GrpcWorker, HostResolver, HttpHostResolver, StaticHostResolver};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Combaine aggregation agent.
#[derive(Parser, Debug)]
#[command(name = "combainer", version, about, long_about = None)]
struct Args {
    /// Bind address for the raft HTTP transport, host:port.
    #[arg(long, default_value = "[::]:9001")]
    endpoint: String,

    /// Configuration repository directory.
    #[arg(long, env = "COMBAINE_CONFIG_DIR", default_value = "/etc/combaine")]
    config_dir: String,

    /// Stable node name; defaults to the hostname.
    #[arg(long)]
    name: Option<String>,

    /// Seconds between assignment reconcile passes.
    #[arg(long, default_value = "60")]
    update_interval: u64,

    /// Endpoint of the parse/aggregate worker service.
    #[arg(long, default_value = "http://[::1]:9002")]
    worker_endpoint: String,

    /// Enable verbose tracing output.
    #[arg(long)]
    tracing: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.tracing { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let name = match args.name.clone() {
        Some(name) => name,
        None => hostname::get()
            .context("failed to read hostname")?
            .to_string_lossy()
            .into_owned(),
    };

    let repository =
        Repository::open(&args.config_dir).context("failed to open config repository")?;
    info!(config_dir = %args.config_dir, "Repository initialized.");
    let cluster_config = repository.read_cluster_config().unwrap_or_else(|error| {
        info!(error = %error, "No cluster config, using defaults.");
        ClusterConfig::default()
    });

    ensure_state_dir(std::path::Path::new(&cluster_config.data_dir))
        .context("failed to create state directory")?;

    let raft_listen: SocketAddr = args
        .endpoint
        .parse()
        .context("bad --endpoint, expected host:port")?;
    let advertise_ip = advertise_ip(&name)?;
    let raft_advertise = SocketAddr::new(advertise_ip, raft_listen.port());
    let bind_ip: std::net::IpAddr = cluster_config
        .bind_addr
        .parse()
        .context("bad gossip bind address")?;
    let gossip_listen = SocketAddr::new(bind_ip, cluster_config.gossip_port);
    let gossip_public = SocketAddr::new(advertise_ip, cluster_config.gossip_port);

    let cache = TtlCache::new(
        Duration::from_secs(cluster_config.cache.ttl),
        Duration::from_secs(cluster_config.cache.interval),
        Duration::from_secs(cluster_config.cache.cleanup_after),
    );
    let resolver: Arc<dyn HostResolver> = match &cluster_config.hosts_source {
        Some(source) => Arc::new(HttpHostResolver::new(source.clone(), cache)),
        None => Arc::new(StaticHostResolver::default()),
    };
    let worker = Arc::new(
        GrpcWorker::connect(&args.worker_endpoint).context("failed to build worker client")?,
    );

    let options = ClusterOptions {
        name,
        cluster_id: "combaine".to_string(),
        gossip_listen_addr: gossip_listen,
        gossip_public_addr: gossip_public,
        raft_advertise_addr: raft_advertise,
        seed_nodes: cluster_config.seed_nodes.clone(),
        update_interval: Duration::from_secs(args.update_interval.max(1)),
    };

    let (cluster, router) = Cluster::bootstrap(
        options,
        repository,
        worker,
        resolver,
        &UdpTransport,
    )
    .await
    .context("failed to bootstrap cluster")?;

    info!(endpoint = %raft_listen, "Serving raft transport.");
    let listener = tokio::net::TcpListener::bind(raft_listen)
        .await
        .context("failed to bind raft transport")?;
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down.");
    cluster.shutdown().await;
    server.abort();

    Ok(())
}

/// Resolves the node's advertised IP from DNS, once at startup.
fn advertise_ip(name: &str) -> anyhow::Result<std::net::IpAddr> {
    let candidates: Vec<SocketAddr> = (name, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve advertise address for {name}"))?
        .collect();
    candidates
        .iter()
        .map(|addr| addr.ip())
        .find(|ip| !ip.is_loopback())
        .or_else(|| candidates.first().map(|addr| addr.ip()))
        .context("no advertise address resolved")
}
