//! OMS node entry point.
//!
//! Boots the gateway and/or engine per the config file and runs until
//! interrupted. Exit code 0 on clean shutdown, nonzero on bootstrap failure.

use anyhow::Result;
use clap::Parser;
use flash_oms::{Oms, OmsConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "oms", version, about = "Partitioned low-latency OMS node")]
struct Cli {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = OmsConfig::load(cli.config.as_deref())?;

    info!(
        port = cfg.gateway_port,
        partitions = cfg.partitions,
        gateway = cfg.run_gateway,
        engine = cfg.run_engine,
        "starting"
    );

    let oms = Oms::boot(cfg)?;
    info!("OMS is up, Ctrl-C to stop");

    // Runs until the process is killed; Drop performs the cooperative
    // shutdown if the flag is ever cleared by other means.
    oms.wait();
    Ok(())
}
