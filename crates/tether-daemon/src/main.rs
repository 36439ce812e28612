//! tether daemon.
//!
//! Reads a device file, starts every device it lists and logs their traffic
//! until interrupted.
//!
//!   tether-daemon --config devices.toml
//!   RUST_LOG=tether::stream=debug tether-daemon --config devices.toml --device projector

mod devices;
mod run;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use devices::DeviceFile;
use run::Running;

/// Keep device links alive.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Device file (TOML).
    #[arg(short, long, env = "TETHER_CONFIG", default_value = "devices.toml")]
    config: PathBuf,

    /// Start only this device.
    #[arg(short, long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tether=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut file = DeviceFile::load(&cli.config)?;
    if let Some(key) = &cli.device {
        file = file.select(key)?;
    }
    if file.devices.is_empty() {
        tracing::warn!("{} lists no devices", cli.config.display());
    }

    let mut running = Vec::with_capacity(file.devices.len());
    for device in file.devices {
        let key = device.key.clone();
        let transport = device.transport.name();
        match Running::start(device).await {
            Ok(r) => {
                tracing::info!(device = %key, transport, "started");
                running.push(r);
            }
            Err(e) => tracing::error!(device = %key, transport, error = %e, "failed to start"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down {} device(s)", running.len());
    for r in running {
        tracing::debug!(device = r.key(), "stopping");
        r.stop();
    }
    Ok(())
}
