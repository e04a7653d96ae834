use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pressgate::batch::{BatchProcessor, HandlerRegistry};
use pressgate::config::PressgateConfig;
use pressgate::http::HttpServer;
use pressgate::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Rate limited batch task service.
#[derive(Debug, Parser)]
#[command(name = "pressgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "PRESSGATE_CONFIG")]
    config: Option<String>,

    /// Override the HTTP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Pressgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = PressgateConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    info!(bind_addr = %config.server.bind_addr, "Configuration loaded");

    let rules = config.rate_limiting.load_rules()?;
    info!(
        endpoints = rules.endpoints.len(),
        anomaly_threshold = rules.anomaly.threshold,
        "Rate limit rules loaded"
    );
    let limiter = Arc::new(RateLimiter::new(rules));

    let registry = HandlerRegistry::with_builtin(config.batch.step_delay());
    let processor = BatchProcessor::new(&config.batch, registry)?;

    HttpServer::new(config.server.bind_addr, limiter, processor)
        .with_compaction_interval(config.rate_limiting.compaction_interval())
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Pressgate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
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
