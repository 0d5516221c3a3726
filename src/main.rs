//! osdc workload driver
//!
//! Runs the full client data path against an in-process cluster: stripes a
//! set of files over objects, optionally takes a shard down halfway through,
//! reads everything back and prints the client counters as JSON.
//!
//! ```text
//! ┌──────────────────────────── osdc ─────────────────────────────┐
//! │  workload ──▶ Filer ──▶ ObjectCache ──▶ Router ──▶ Messenger  │
//! │                                           ▲            │      │
//! │  TopologyPublisher ───────────────────────┘            ▼      │
//! │                                                 MemoryCluster │
//! │  /metrics /healthz /stats ◀── MetricsExporter                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use osdc::metrics::MetricsExporter;
use osdc::router::{MemoryCluster, NoAuth};
use osdc::topology::{PlacementPolicy, ShardInfo, TopologyPublisher};
use osdc::{Client, ClientConfig, ClientStats, PolicyId, ShardId, StripeLayout, TopologySnapshot};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Drive the object storage client against an in-memory cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML client configuration
    #[arg(long, env = "OSDC_CONFIG")]
    config: Option<PathBuf>,

    /// Number of shards in the cluster
    #[arg(long, env = "OSDC_SHARDS", default_value = "4")]
    shards: u32,

    /// Replicas per object
    #[arg(long, env = "OSDC_REPLICAS", default_value = "3")]
    replicas: usize,

    /// Stripe unit in bytes
    #[arg(long, default_value = "65536")]
    stripe_unit: u64,

    /// Objects per stripe
    #[arg(long, default_value = "4")]
    stripe_count: u64,

    /// Object size in bytes
    #[arg(long, default_value = "4194304")]
    object_size: u64,

    /// Number of files to write
    #[arg(long, default_value = "8")]
    files: u64,

    /// Bytes per file
    #[arg(long, default_value = "1048576")]
    file_size: u64,

    /// Bypass the write-back cache
    #[arg(long)]
    no_cache: bool,

    /// Mark this shard down after the write phase
    #[arg(long)]
    fail_shard: Option<u32>,

    /// Serve /metrics, /stats and /healthz here and keep running after the
    /// workload until interrupted
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    files: u64,
    bytes_written: u64,
    bytes_verified: u64,
    failed_shard: Option<u32>,
    elapsed_ms: u64,
    stats: ClientStats,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if args.no_cache {
        config.cache_enabled = false;
    }

    let layout = StripeLayout::new(args.stripe_unit, args.stripe_count, args.object_size);
    layout.validate()?;
    if args.replicas == 0 || args.replicas > args.shards as usize {
        bail!(
            "replicas must be between 1 and the shard count ({})",
            args.shards
        );
    }

    info!("Starting osdc workload");
    info!("  Shards: {} (replicas {})", args.shards, args.replicas);
    info!(
        "  Layout: unit {} count {} object {}",
        layout.stripe_unit, layout.stripe_count, layout.object_size
    );
    info!("  Files: {} x {} bytes", args.files, args.file_size);
    info!("  Cache: {}", config.cache_enabled);

    let mut builder = TopologySnapshot::builder(1);
    for id in 1..=args.shards {
        builder = builder.shard(ShardInfo::new(id, format!("mem://shard-{id}")));
    }
    let topology = builder
        .policy(PlacementPolicy::replicated(1, args.replicas, layout))
        .into_shared();
    let publisher = TopologyPublisher::new(topology.clone());

    let (cluster, events) = MemoryCluster::new();
    let client = Arc::new(Client::new(
        config,
        cluster.clone(),
        Arc::new(NoAuth),
        topology,
    )?);
    client.start(events, Some(publisher.subscribe()));

    let server_shutdown = CancellationToken::new();
    let server = match args.metrics_addr {
        Some(addr) => {
            let exporter = Arc::new(MetricsExporter::new()?);
            let client = Arc::clone(&client);
            let shutdown = server_shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = serve_metrics(addr, client, exporter, shutdown).await {
                    error!("Metrics server error: {:#}", e);
                }
            }))
        }
        None => None,
    };

    let report = run_workload(&client, &cluster, &publisher, &args).await;
    match &report {
        Ok(report) => println!("{}", serde_json::to_string_pretty(report)?),
        Err(e) => error!("Workload failed: {:#}", e),
    }

    if let Some(server) = server {
        info!("Workload done, serving metrics until interrupted");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for ctrl-c: {}", e);
        }
        server_shutdown.cancel();
        let _ = server.await;
    }

    client.shutdown().await?;
    info!("osdc shutdown complete");
    report.map(|_| ())
}

// =============================================================================
// Workload
// =============================================================================

fn pattern(ino: u64, len: u64) -> Bytes {
    (0..len)
        .map(|i| ((i.wrapping_mul(31) ^ ino) % 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

async fn run_workload(
    client: &Client,
    cluster: &MemoryCluster,
    publisher: &TopologyPublisher,
    args: &Args,
) -> anyhow::Result<Report> {
    let started = Instant::now();
    let filer = client.filer();

    let mut files = Vec::new();
    for n in 0..args.files {
        let ino = 0x1000 + n;
        let mut file = client.create_file(ino, PolicyId(1))?;
        filer
            .write(&mut file, 0, pattern(ino, args.file_size))
            .await
            .with_context(|| format!("write of file {ino:x}"))?;
        files.push(file);
    }
    if let Some(cache) = client.cache() {
        cache.flush_all().await.context("flush after write phase")?;
    }
    info!(files = files.len(), "write phase complete");

    if let Some(shard) = args.fail_shard {
        let next = publisher.current().next().set_up(ShardId(shard), false).into_shared();
        cluster.refuse(ShardId(shard));
        cluster.break_session(ShardId(shard));
        publisher.publish(next)?;
        // let the follower apply the new epoch
        tokio::time::sleep(Duration::from_millis(10)).await;
        info!(shard, epoch = client.router().epoch(), "shard taken down");
        if let Some(cache) = client.cache() {
            for file in &files {
                for object_no in 0..file.object_count() {
                    cache.invalidate(&file.locator(object_no));
                }
            }
        }
    }

    let mut verified = 0;
    for file in &files {
        let data = filer
            .read(file, 0, file.size)
            .await
            .with_context(|| format!("read of file {:x}", file.ino))?;
        if data != pattern(file.ino, file.size) {
            bail!("file {:x} read back different bytes", file.ino);
        }
        verified += data.len() as u64;
    }
    info!(bytes = verified, "read phase verified");

    Ok(Report {
        files: args.files,
        bytes_written: args.files * args.file_size,
        bytes_verified: verified,
        failed_shard: args.fail_shard,
        elapsed_ms: started.elapsed().as_millis() as u64,
        stats: client.stats(),
    })
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn serve_metrics(
    addr: SocketAddr,
    client: Arc<Client>,
    exporter: Arc<MetricsExporter>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {addr}"))?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted.context("Metrics server accept error")?,
        };
        let io = TokioIo::new(stream);
        let client = Arc::clone(&client);
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let response = route(req.uri().path(), &client, &exporter);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!("Metrics server connection error: {}", e);
            }
        });
    }
    Ok(())
}

fn route(
    path: &str,
    client: &Client,
    exporter: &MetricsExporter,
) -> hyper::Response<http_body_util::Full<Bytes>> {
    use hyper::StatusCode;

    match path {
        "/metrics" => {
            exporter.update(&client.stats());
            match exporter.gather() {
                Ok(text) => respond(StatusCode::OK, &exporter.content_type(), text),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        "/stats" => match serde_json::to_string(&client.stats()) {
            Ok(json) => respond(StatusCode::OK, "application/json", json),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

fn respond(
    status: hyper::StatusCode,
    content_type: &str,
    body: impl Into<Bytes>,
) -> hyper::Response<http_body_util::Full<Bytes>> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};

    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}
