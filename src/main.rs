//! `gatelink` binary: load configuration, start the relay, and stop it on
//! Ctrl-C.

mod cli;

use std::{process::ExitCode, str::FromStr, sync::Arc};

use clap::Parser;
use gatelink::{
    adapter::Adapter,
    backend::WsTransport,
    config::{AdapterConfig, ConfigError, GatewayMode},
    relay,
};
use log::{error, warn};

fn load_config(cli: &cli::Cli) -> Result<AdapterConfig, ConfigError> {
    let mut config = if cli.config.exists() {
        AdapterConfig::load(&cli.config)?
    } else {
        AdapterConfig::from_toml("")?
    };
    if let Some(level) = &cli.log_level {
        config.log.level.clone_from(level);
    }
    if let Some(mode) = cli.mode {
        config.gateway.mode = match mode {
            cli::ModeArg::Reverse => GatewayMode::Reverse,
            cli::ModeArg::Forward => GatewayMode::Forward,
        };
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "metrics")]
fn install_metrics(config: &AdapterConfig) {
    if let Some(addr) = config.metrics.listen {
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => log::info!("metrics exporter listening: addr={addr}"),
            Err(e) => warn!("metrics exporter failed to start: addr={addr}, error={e}"),
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: error={e}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    let loaded = load_config(&cli);
    let level_name = match &loaded {
        Ok(config) => config.log.level.as_str(),
        Err(_) => cli.log_level.as_deref().unwrap_or("info"),
    };
    let level = tracing::Level::from_str(level_name).unwrap_or(tracing::Level::INFO);
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt().with_max_level(level).init();
    if !cli.config.exists() {
        warn!(
            "config file not found, using defaults: path={}",
            cli.config.display()
        );
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    #[cfg(feature = "metrics")]
    install_metrics(&config);

    let transport = Arc::new(WsTransport::new(
        config.backend.ws_url(),
        config.backend.access_token.clone(),
    ));
    let adapter = Adapter::new(config, transport);
    let (handlers, backend_handler) = relay::default_handlers(&adapter);
    match adapter.run(handlers, backend_handler, ctrl_c()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("gatelink stopped: error={e}");
            ExitCode::FAILURE
        }
    }
}
