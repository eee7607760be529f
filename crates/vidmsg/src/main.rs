use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vidmsg::{
    config::Config,
    engines::{
        EngineSet,
        remote::{RemoteBackgroundRemover, RemotePersonDetector, RemoteVideoSynthesizer},
    },
    service::VideoMessageService,
};

#[derive(Parser)]
#[command(name = "vidmsg")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Video message generation pipeline service")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Storage root (overrides config file)
    #[arg(short = 's', long, value_name = "DIR")]
    storage_root: Option<String>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// Build the HTTP engine clients from configuration. All three endpoints are
/// required for a runnable process; missing ones are configuration errors.
fn build_engines(config: &Config) -> Result<EngineSet> {
    let engines = &config.engines;
    let timeout = engines.request_timeout;

    let detector_endpoint = engines
        .detector_endpoint
        .clone()
        .ok_or_else(|| anyhow::anyhow!("engines.detector_endpoint is not configured"))?;
    let remover_endpoint = engines
        .remover_endpoint
        .clone()
        .ok_or_else(|| anyhow::anyhow!("engines.remover_endpoint is not configured"))?;
    let video_endpoint = engines
        .video_endpoint
        .clone()
        .ok_or_else(|| anyhow::anyhow!("engines.video_endpoint is not configured"))?;

    Ok(EngineSet {
        detector: Arc::new(
            RemotePersonDetector::new(detector_endpoint, timeout)
                .map_err(|e| anyhow::anyhow!("detector client: {e}"))?,
        ),
        remover: Arc::new(
            RemoteBackgroundRemover::new(remover_endpoint, timeout)
                .map_err(|e| anyhow::anyhow!("remover client: {e}"))?,
        ),
        synthesizer: Arc::new(
            RemoteVideoSynthesizer::new(video_endpoint, engines.video_api_key.clone(), timeout)
                .map_err(|e| anyhow::anyhow!("video synthesizer client: {e}"))?,
        ),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("vidmsg={}", cli.log_level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vidmsg v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(storage_root) = cli.storage_root {
        config.storage.root = storage_root.into();
    }

    // Configuration errors (unwritable storage root, GPU oversubscription,
    // missing engine endpoints) exit non-zero before any task is accepted
    config.validate()?;
    let engines = build_engines(&config)?;

    let service = VideoMessageService::new(config, engines)
        .await
        .map_err(|e| anyhow::anyhow!("service startup failed: {e}"))?;
    service.start_background_tasks();

    info!("vidmsg ready; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received, stopping background tasks");
    service.shutdown();

    Ok(())
}
