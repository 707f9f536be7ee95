//! tiercache daemon
//!
//! Runs a cache manager with its background tasks and serves its health
//! and metrics over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          tiercache                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ /metrics     │───▶│ CacheManager │◀───│ /healthz     │       │
//! │  │ (Prometheus) │    │  L1 + L2     │    │ /livez       │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{CacheConfig, CacheManager};
use tiercache::monitoring::{render_prometheus, ProcessHealth};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - two-tier (memory + disk) cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the L2 directory
    #[arg(long, env = "TIERCACHE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Repair the L2 index, print the report and exit
    #[arg(long)]
    repair_only: bool,

    /// Skip the startup warmup
    #[arg(long, env = "TIERCACHE_NO_WARMUP")]
    no_warmup: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.l2.base_dir = dir.clone();
    }
    if args.no_warmup {
        config.warmer.warm_on_startup = false;
    }

    info!("Starting tiercache");
    info!("  L1: {} MB, policy {}", config.l1.max_size_mb, config.l1.eviction_policy);
    info!(
        "  L2: {} MB at {}, policy {}",
        config.l2.max_size_mb,
        config.l2.base_dir.display(),
        config.l2.eviction_policy
    );
    info!(
        "  Scheduled eviction: {} every {}s",
        config.eviction.policy, config.eviction.interval_secs
    );

    if args.repair_only {
        config.l2.repair_on_startup = false;
    }
    let manager = Arc::new(CacheManager::new(config).context("invalid cache configuration")?);
    manager.init().await.context("opening the file tier")?;

    if args.repair_only {
        let report = manager.repair_index().await.context("repairing the index")?;
        manager.shutdown().await.context("persisting the index")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let health = Arc::new(ProcessHealth::new());
    manager.start();
    health.set_ready(true);

    let health_manager = manager.clone();
    let health_flags = health.clone();
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_manager, health_flags).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_manager = manager.clone();
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_manager).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    health.set_ready(false);
    manager.shutdown().await.context("shutting down the cache")?;
    health.set_live(false);

    info!("tiercache shutdown complete");
    Ok(())
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
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("ignoring log directive {}: {}", directive, e),
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn not_found() -> HttpResponse {
    respond(StatusCode::NOT_FOUND, "text/plain", "not found")
}

async fn bind(addr: &str, name: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} server address {}", name, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {} server to {}", name, addr))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_response(
    req: Request<hyper::body::Incoming>,
    manager: Arc<CacheManager>,
    process: Arc<ProcessHealth>,
) -> Result<HttpResponse, Infallible> {
    let response = match req.uri().path() {
        "/livez" => {
            if process.is_live() {
                respond(StatusCode::OK, "text/plain", "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "shutting down")
            }
        }
        "/readyz" => {
            if process.is_ready() {
                respond(StatusCode::OK, "text/plain", "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        }
        "/healthz" => {
            let report = manager.health_check().await;
            let status = if report.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&report) {
                Ok(body) => respond(status, "application/json", body),
                Err(e) => {
                    warn!("Cannot encode health report: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
                }
            }
        }
        _ => not_found(),
    };
    Ok(response)
}

async fn run_health_server(
    addr: &str,
    manager: Arc<CacheManager>,
    process: Arc<ProcessHealth>,
) -> anyhow::Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);
        let manager = manager.clone();
        let process = process.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_response(req, manager.clone(), process.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn metrics_response(
    req: Request<hyper::body::Incoming>,
    manager: Arc<CacheManager>,
) -> Result<HttpResponse, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let report = manager.get_stats();
            match render_prometheus(&report.global, &[report.l1, report.l2]) {
                Ok(text) => respond(StatusCode::OK, prometheus::TEXT_FORMAT, text),
                Err(e) => {
                    warn!("Cannot render metrics: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
                }
            }
        }
        "/stats" => match report_json(&manager) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        _ => not_found(),
    };
    Ok(response)
}

fn report_json(manager: &CacheManager) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(&manager.get_stats())
}

async fn run_metrics_server(addr: &str, manager: Arc<CacheManager>) -> anyhow::Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let manager = manager.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_response(req, manager.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
