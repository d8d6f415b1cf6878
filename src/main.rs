//! llm-switch - run one model server at a time behind a single OpenAI-compatible endpoint

use anyhow::{Context, Result};
use clap::Parser;
use llm_switch::config::Config;
use llm_switch::{AppState, build_metrics_layer_and_handle, build_metrics_router, build_router};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, instrument};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llm-switch", version)]
#[command(about = "Switch between GPU-resident model servers on demand")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Whether to enable the metrics endpoint.
    #[arg(long, default_value_t = false)]
    metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "llm_switch")]
    metrics_prefix: String,
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("llm_switch=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!(
        models = ?config.models.keys().collect::<Vec<_>>(),
        port = config.server.port,
        "Configuration loaded"
    );

    let app_state = AppState::from_config(&config).context("Failed to build application")?;
    let mut router = build_router(app_state);

    if args.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(args.metrics_prefix);
        router = router.layer(prometheus_layer);

        let metrics_router = build_metrics_router(handle);
        let metrics_addr = format!("{}:{}", config.server.host, args.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Metrics endpoint enabled");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "Metrics server failed");
            }
        });
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, router).await.context("Server error")?;

    Ok(())
}
