//! gw-worker binary

use anyhow::Context;
use clap::Parser;
use gw_adapter_gpu::GpuBackend;
use gw_core::LogFormat;
use gw_worker::{WorkerAgent, WorkerConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gw-worker")]
#[command(about = "Worker host agent: reports GPUs and runs inference engine instances")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control API address
    #[arg(long, value_name = "ADDRESS")]
    bind: Option<String>,

    /// Inference engine server binary
    #[arg(long, value_name = "FILE")]
    llama_bin: Option<PathBuf>,

    /// Directory for model artifacts
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Report this many simulated GPUs instead of probing the host
    #[arg(long, value_name = "COUNT")]
    mock_gpus: Option<u32>,
}

impl Cli {
    /// File and environment configuration with command line overrides applied
    fn into_config(self) -> anyhow::Result<WorkerConfig> {
        let mut config =
            WorkerConfig::load(self.config.as_deref()).context("Failed to load configuration")?;

        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(llama_bin) = self.llama_bin {
            config.llama_bin = llama_bin;
        }
        if let Some(model_dir) = self.model_dir {
            config.model_dir = model_dir;
        }
        if let Some(count) = self.mock_gpus {
            config.gpu_backend = GpuBackend::Mock;
            config.mock_gpus = count;
        }

        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;

    init_tracing(&config);

    info!("Starting gw-worker with configuration:");
    info!("  Listen address: {}", config.bind);
    info!("  Engine binary: {}", config.llama_bin.display());
    info!("  Model directory: {}", config.model_dir.display());
    info!("  Instance ports: {}-{}", config.port_range.start, config.port_range.end);
    info!("  GPU backend: {}", config.gpu_backend);

    let agent = WorkerAgent::new(config)
        .await
        .context("Failed to create worker agent")?;
    agent.run().await.context("Worker agent error")?;

    info!("gw-worker shutdown complete");
    Ok(())
}

fn init_tracing(config: &WorkerConfig) {
    let default_filter = config.logging.filter_directive(&[
        "gw_worker",
        "gw_adapter_gpu",
        "gw_adapter_runtime",
        "gw_core",
    ]);
    let json = config.logging.format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}
