use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::Settings;
use turnstile::http::{service_routes, Gatekeeper, HttpServer};
use turnstile::ratelimit::{Clock, RateLimitPolicy, RateLimiter, SystemClock};
use turnstile::store;

const DEFAULT_HEALTH_PATH: &str = "/api/health";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Per-client rate limiting with lockout for HTTP APIs.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML settings file, applied before environment variables
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Overrides TURNSTILE_HTTP_ADDR
    #[arg(long, value_name = "ADDR")]
    http_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    if let Some(addr) = args.http_addr {
        settings.http_addr = addr;
    }

    // Invalid settings are fatal before anything is served.
    let policy = Arc::new(RateLimitPolicy::from_settings(&settings).context("invalid rate limit policy")?);
    let service = settings.service().context("invalid service settings")?;
    info!(http_addr = %service.http_addr, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = store::from_config(&service.store, clock.clone()).context("failed to set up counter store")?;
    let limiter = Arc::new(RateLimiter::with_clock(policy.clone(), store, clock));
    let gate = Arc::new(Gatekeeper::new(limiter)?);

    let health_path = policy
        .health_paths()
        .first()
        .map(String::as_str)
        .unwrap_or(DEFAULT_HEALTH_PATH);
    let server = HttpServer::new(service.http_addr, service_routes(health_path), gate);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().with_current_span(false).init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
