//! The parse/aggregate worker daemon.
//!
//! Serves the worker gRPC service the agents dispatch their parsing and
//! aggregation tasks to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use combaine_cache::TtlCache;
use combaine_rpc::worker_server::WorkerServer;
use combaine_worker::fetchers::FetcherRegistry;
use combaine_worker::WorkerService;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

const KEEPALIVE_MIN_TIME: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_STREAMS: u32 = 2000;

const CACHE_TTL: Duration = Duration::from_secs(5);
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const CACHE_CLEANUP_AFTER: Duration = Duration::from_secs(150);

/// Combaine parse/aggregate worker.
#[derive(Parser, Debug)]
#[command(name = "combaine-workerd", version, about, long_about = None)]
struct Args {
    /// Listen address of the worker gRPC service, host:port.
    #[arg(long, default_value = "[::]:9002")]
    endpoint: String,

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

    let addr: SocketAddr = args
        .endpoint
        .parse()
        .context("bad --endpoint, expected host:port")?;

    let fetchers =
        Arc::new(FetcherRegistry::with_defaults().context("failed to register fetchers")?);
    let cache = TtlCache::new(CACHE_TTL, CACHE_SWEEP_INTERVAL, CACHE_CLEANUP_AFTER);
    let service = WorkerService::new(fetchers, cache);

    info!(endpoint = %addr, "Register as gRPC worker server.");
    Server::builder()
        .max_concurrent_streams(Some(MAX_CONCURRENT_STREAMS))
        .http2_keepalive_interval(Some(KEEPALIVE_MIN_TIME))
        .tcp_nodelay(true)
        .add_service(WorkerServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down.");
        })
        .await?;

    Ok(())
}
