//! Server entry point.
//!
//! Wires the process together: configuration, logging, the metrics HTTP
//! endpoint, the periodic stats and bucket-sweep tasks, and the UDP listener.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use rampart::config::Config;
use rampart::metrics::Metrics;
use rampart::pipeline::QueryPipeline;
use rampart::transport::udp::UdpServer;

#[derive(Parser)]
#[command(name = "rampart")]
#[command(about = "Adaptive-defense authoritative DNS server", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "rampart.toml")]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.listen_host = bind;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    let metrics = Arc::new(Metrics::new());
    let pipeline = Arc::new(QueryPipeline::new(&config, metrics.clone())?);

    let listen_addr: SocketAddr = format!("{}:{}", config.listen_host, config.listen_port)
        .parse()
        .context("invalid listen address")?;
    let metrics_addr = format!("{}:{}", config.metrics_host, config.metrics_port);

    spawn_metrics_endpoint(&metrics_addr, metrics)?;

    let server = UdpServer::bind(listen_addr).await?;
    info!(
        addr = %listen_addr,
        origin = pipeline.origin(),
        ratelimit = config.ratelimit.enabled,
        adaptive = config.adaptive.enabled,
        "DNS server listening"
    );
    info!("metrics at http://{}/metrics", metrics_addr);

    spawn_stats_logger(pipeline.clone());
    if config.ratelimit.idle_eviction_seconds > 0 {
        spawn_idle_sweep(
            pipeline.clone(),
            Duration::from_secs(config.ratelimit.idle_eviction_seconds),
        );
    }

    tokio::select! {
        _ = server.run(pipeline) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

/// Serve the metrics snapshot as flat JSON on a dedicated thread; tiny_http
/// is blocking, so it stays off the runtime.
fn spawn_metrics_endpoint(addr: &str, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let server = tiny_http::Server::http(addr)
        .map_err(|e| anyhow::anyhow!("binding metrics endpoint on {addr}: {e}"))?;

    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let response = if request.url() == "/metrics" {
                let body = serde_json::to_string(&metrics.snapshot())
                    .unwrap_or_else(|_| "{}".to_string());
                tiny_http::Response::from_string(body).with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("static header"),
                )
            } else {
                tiny_http::Response::from_string("not found").with_status_code(404)
            };
            if let Err(e) = request.respond(response) {
                debug!(error = %e, "metrics response failed");
            }
        }
    });

    Ok(())
}

/// Log a one-line traffic summary every minute.
fn spawn_stats_logger(pipeline: Arc<QueryPipeline>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let snapshot = pipeline.metrics().snapshot();
            info!(
                queries = snapshot.queries_total,
                noerror = snapshot.responses_noerror,
                nxdomain = snapshot.responses_nxdomain,
                dropped = snapshot.dropped_ratelimit,
                ewma_qps = format_args!("{:.1}", snapshot.ewma_qps),
                per_client_qps = snapshot.current_per_client_qps,
                cache = pipeline.cache_len(),
                clients = pipeline.limiter().tracked_clients(),
                "stats"
            );
        }
    });
}

/// Evict rate-limiter buckets for clients that have gone quiet.
fn spawn_idle_sweep(pipeline: Arc<QueryPipeline>, max_idle: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(max_idle);
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = pipeline.limiter().sweep_idle(max_idle);
            if evicted > 0 {
                debug!(evicted, "swept idle client buckets");
            }
        }
    });
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args))
}
