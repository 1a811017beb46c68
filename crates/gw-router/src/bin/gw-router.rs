//! gw-router binary

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use gw_core::LogFormat;
use gw_router::config::validate_config;
use gw_router::{Gateway, GatewayConfig, GatewayConfigBuilder};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let config = build_config(&matches).map_err(anyhow::Error::msg)?;

    init_tracing(&config);

    info!("Starting gw-router with configuration:");
    info!("  Listen address: {}", config.bind_addr());
    info!("  Backends: {}", config.backends.len());
    info!("  Models: {}", config.models.len());
    info!("  Update interval: {:?}", config.update_interval());
    info!("  Instance timeout: {:?}", config.instance_timeout());
    info!("  CORS enabled: {}", config.enable_cors);

    let gateway = Gateway::new(config).context("Failed to create gateway")?;
    gateway.serve().await.context("Gateway error")?;

    info!("gw-router shutdown complete");
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let default_filter = config
        .logging
        .filter_directive(&["gw_router", "gw_state", "gw_core"]);
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

fn cli() -> Command {
    Command::new("gw-router")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inference gateway: admits requests and streams them to engine instances")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("http-port")
                .long("http-port")
                .value_name("PORT")
                .help("HTTP server port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address"),
        )
        .arg(
            Arg::new("update-interval")
                .long("update-interval")
                .value_name("SECONDS")
                .help("Seconds between backend synchronization passes")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("instance-timeout")
                .long("instance-timeout")
                .value_name("SECONDS")
                .help("Seconds a new instance may take to load")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("disable-cors")
                .long("disable-cors")
                .help("Disable CORS support")
                .action(ArgAction::SetTrue),
        )
}

/// Build configuration from the config file, the environment and command
/// line overrides
fn build_config(matches: &ArgMatches) -> Result<GatewayConfig, String> {
    let path = matches.get_one::<String>("config").map(Path::new);
    let file_config =
        GatewayConfig::load(path).map_err(|e| format!("Failed to load configuration: {}", e))?;
    let mut builder = GatewayConfigBuilder::from_config(file_config);

    if let Some(&http_port) = matches.get_one::<u16>("http-port") {
        builder = builder.http_port(http_port);
    }

    if let Some(bind_addr) = matches.get_one::<String>("bind") {
        builder = builder.bind_address(bind_addr);
    }

    if let Some(&secs) = matches.get_one::<u64>("update-interval") {
        builder = builder.update_interval(Duration::from_secs(secs));
    }

    if let Some(&secs) = matches.get_one::<u64>("instance-timeout") {
        builder = builder.instance_timeout(Duration::from_secs(secs));
    }

    if matches.get_flag("disable-cors") {
        builder = builder.enable_cors(false);
    }

    let config = builder.build();

    validate_config(&config).map_err(|e| format!("Configuration validation failed: {}", e))?;

    Ok(config)
}
