use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use minergy::config::Config;
use minergy::{api, controller, telemetry};

/// Energy management for PV/battery sites with price-steered miner loads.
#[derive(Debug, Parser)]
#[command(name = "minergy", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "minergy.json")]
    config: PathBuf,

    /// Print a plant telemetry snapshot and exit.
    #[arg(long)]
    info: bool,

    /// Start the web server without any control loops.
    #[arg(long = "serverOnly", alias = "server-only")]
    server_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;
    telemetry::init_tracing(&cfg.log_level, cfg.log_format);

    let state = Arc::new(controller::AppState::new(cfg.clone()).await?);

    if cli.info {
        let info = state.inverter.read_plant_running_info().await?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let scheduler = if cli.server_only {
        info!("server-only mode, control loops disabled");
        None
    } else {
        Some(controller::start(state.clone()).await?)
    };

    if cfg.health_check_port != 0 {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.health_check_port))
            .await
            .with_context(|| format!("cannot bind health port {}", cfg.health_check_port))?;
        info!(port = cfg.health_check_port, "web server listening");
        axum::serve(listener, api::router(state.clone()))
            .with_graceful_shutdown(telemetry::shutdown_signal())
            .await?;
    } else {
        if cli.server_only {
            info!("health_check_port is 0, nothing to serve");
        }
        telemetry::shutdown_signal().await;
    }

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    info!("shutdown complete");
    Ok(())
}
