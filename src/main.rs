//! CLI Entry Point for power_daq
//!
//! Provides command-line interface for:
//! - Running the gateway (startup recovery, then device acquisition)
//! - Checking a day file offline with the startup import parser
//! - Creating the energy aggregate tables
//!
//! # Usage
//!
//! ```bash
//! power_daq run --config config/power_daq.toml
//! power_daq import data/pd-2024-03-07.csv
//! power_daq init-db
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use power_daq::acquisition::{Acquisition, AcquisitionOptions};
use power_daq::config::{DeviceConfig, GatewayConfig, DEFAULT_CONFIG_PATH};
use power_daq::data::recovery::import_day_file;
use power_daq::data::SampleRing;
use power_daq::energy::EnergyAggregator;
use power_daq::logging;
use power_daq::network::SessionKey;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "power_daq")]
#[command(about = "Ingestion gateway for an authenticated power-metering device", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the device port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Parse a day file and report accepted and skipped rows
    Import {
        /// Path to a pd-YYYY-MM-DD.csv file
        file: PathBuf,
    },

    /// Create the energy aggregate tables
    InitDb {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, port } => run_gateway(config, port).await,
        Commands::Import { file } => import_file(file),
        Commands::InitDb { config } => init_db(config),
    }
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    let config = GatewayConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_gateway(config_path: PathBuf, port: Option<u16>) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if let Some(port) = port {
        config.device.port = port;
    }

    logging::init_from_config(&config)?;
    info!(
        name = %config.application.name,
        port = config.device.port,
        data_dir = %config.storage.data_dir.display(),
        "Starting gateway"
    );
    if config.device.hmac_key == DeviceConfig::default().hmac_key {
        warn!("Using the factory default device key");
    }

    let key = SessionKey::new(config.device.hmac_key.as_bytes())?;
    let ring = Arc::new(SampleRing::new(config.storage.ring_capacity));
    let energy = EnergyAggregator::open(
        &config.storage.database_path,
        config.storage.busy_timeout(),
        Arc::new(config.settings.clone()),
    )
    .context("Failed to open energy database")?;

    let acquisition = Acquisition::bind(
        AcquisitionOptions::from_config(&config),
        key,
        Arc::clone(&ring),
        energy,
    )
    .await
    .context("Failed to bind device listener")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut task = tokio::spawn(acquisition.run(shutdown_rx));

    let outcome = tokio::select! {
        joined = &mut task => joined,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
            }
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
            task.await
        }
    };

    match outcome.context("Acquisition task panicked")? {
        Ok(()) => {
            info!(buffered = ring.len(), "Gateway stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Gateway terminating");
            Err(e.into())
        }
    }
}

fn import_file(file: PathBuf) -> Result<()> {
    anyhow::ensure!(file.is_file(), "No such day file: {}", file.display());

    let ring = SampleRing::default();
    let stats = import_day_file(&ring, &file, None)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    println!("File:      {}", file.display());
    println!("Accepted:  {}", stats.accepted);
    println!("Stale:     {}", stats.stale);
    println!("Malformed: {}", stats.malformed);
    if let (Some(first), Some(last)) = (ring.snapshot().first(), ring.latest()) {
        println!("Range:     {} .. {}", first.timestamp, last.timestamp);
    }
    Ok(())
}

fn init_db(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let energy = EnergyAggregator::open(
        &config.storage.database_path,
        config.storage.busy_timeout(),
        Arc::new(config.settings.clone()),
    )?;
    println!("Energy tables ready in {}", energy.path().display());
    Ok(())
}
