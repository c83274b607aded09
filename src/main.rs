use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{BackendKind, WardenConfig};
use ratewarden::http::{HttpServer, RateLimitState};
use ratewarden::ratelimit::{LimitPolicy, LocalStore, RateLimiter, RedisStore, WindowStore};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Per-client rate limiting for HTTP services")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Window store to use, overriding configuration
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// HTTP listen address, overriding configuration
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let dotenv = dotenvy::dotenv();

    init_tracing(args.log_json);

    info!("Starting Ratewarden Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if dotenv.is_err() {
        info!("No .env file found, using environment variables");
    }

    let mut config = match &args.config {
        Some(path) => WardenConfig::from_file(path)?,
        None => WardenConfig::default(),
    };
    config.apply_env();
    if let Some(backend) = args.backend {
        config.backend.kind = backend;
    }
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }

    info!(
        http_addr = %config.server.http_addr,
        backend = %config.backend.kind,
        ip_limit = config.rate_limiting.ip_limit,
        token_limit = config.rate_limiting.token_limit,
        block_time_secs = config.rate_limiting.block_time_secs,
        enable_ip_limit = config.rate_limiting.enable_ip_limit,
        enable_token_limit = config.rate_limiting.enable_token_limit,
        "Configuration loaded"
    );

    let mut sweeper = None;
    let store: Arc<dyn WindowStore> = match config.backend.kind {
        BackendKind::Memory => {
            warn!("Using in-process window store; limits are not shared between instances");
            let store = Arc::new(LocalStore::new());
            if let Some(interval) = config.rate_limiting.sweep_interval() {
                sweeper = Some(store.clone().spawn_sweeper(interval));
            }
            store
        }
        BackendKind::Redis => {
            let store = RedisStore::connect(&config.backend.redis).await.map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Redis at {}: {}",
                    config.backend.redis.url,
                    e
                )
            })?;
            Arc::new(store)
        }
    };

    let limiter = Arc::new(
        RateLimiter::new(store, LimitPolicy::from(&config.rate_limiting))
            .with_decision_timeout(config.rate_limiting.decision_timeout()),
    );
    info!("Rate limiter initialized");

    let state = RateLimitState::new(limiter, &config.rate_limiting)?;
    let server = HttpServer::new(config.server.http_addr, state);

    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Ratewarden Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
