//! Configuration loaded at boot from a JSON file, with localhost-friendly
//! defaults for every key so a bare `oms` starts a complete system.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OmsConfig {
    /// Number of engine partitions (and engine threads).
    pub partitions: u32,
    /// Inbound stream id = base + partition.
    pub inbound_stream_base: u32,
    /// Outbound stream id = base + partition.
    pub outbound_stream_base: u32,
    /// TCP listen port; 0 binds an ephemeral port (tests).
    pub gateway_port: u16,
    /// Capacity of each partition stream; a full stream is backpressure.
    pub gateway_backpressure_queue_limit: usize,
    pub run_gateway: bool,
    pub run_engine: bool,
    pub metrics_interval_secs: u64,
    /// Transport endpoint descriptor; in-process queues only log it.
    pub transport_channel: String,
    /// Transport working directory, logged for operational parity.
    pub transport_dir: String,
    /// Pin engine partition threads to cores.
    pub pin_cores: bool,
}

impl Default for OmsConfig {
    fn default() -> Self {
        Self {
            partitions: 32,
            inbound_stream_base: 1000,
            outbound_stream_base: 2000,
            gateway_port: 7001,
            gateway_backpressure_queue_limit: 4096,
            run_gateway: true,
            run_engine: true,
            metrics_interval_secs: 5,
            transport_channel: "mem://oms".to_string(),
            transport_dir: "/dev/shm/oms".to_string(),
            pin_cores: false,
        }
    }
}

impl OmsConfig {
    /// Load from a JSON file; `None` means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = match path {
            None => Self::default(),
            Some(p) => {
                let contents = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.partitions >= 1, "partitions must be at least 1");
        ensure!(
            self.gateway_backpressure_queue_limit >= 1,
            "gateway_backpressure_queue_limit must be at least 1"
        );
        Ok(())
    }
}
