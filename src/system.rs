//! Process wiring: boot and cooperative shutdown of a whole OMS node.
//!
//! A node owns `3 + P` threads - acceptor, two ingress I/O workers, egress
//! router, and one engine thread per partition - plus a low-rate metrics
//! ticker. Every loop watches one shared running flag; shutdown flips it and
//! joins.
//!
//! `run_gateway` / `run_engine` allow split deployments; the default config
//! runs both in one process over the in-memory fabric.

use crate::config::OmsConfig;
use crate::egress::EgressRouter;
use crate::ingress::Gateway;
use crate::metrics::LatencyStats;
use crate::partition::EnginePartition;
use crate::server::GatewayServer;
use crate::session::SessionRegistry;
use crate::transport::Fabric;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

/// A running OMS node. Dropping it shuts everything down.
pub struct Oms {
    fabric: Arc<Fabric>,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    gateway_addr: Option<SocketAddr>,
}

impl Oms {
    pub fn boot(cfg: OmsConfig) -> Result<Self> {
        cfg.validate()?;
        info!(
            partitions = cfg.partitions,
            channel = %cfg.transport_channel,
            dir = %cfg.transport_dir,
            "booting OMS node"
        );

        let fabric = Arc::new(Fabric::new(
            cfg.partitions,
            cfg.inbound_stream_base,
            cfg.outbound_stream_base,
            cfg.gateway_backpressure_queue_limit,
        ));
        let registry = Arc::new(SessionRegistry::new());
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        if cfg.run_engine {
            info!(partitions = cfg.partitions, "starting engine partitions");
            for p in 0..cfg.partitions {
                let partition = EnginePartition::new(
                    p,
                    Arc::clone(fabric.inbound(p)),
                    Arc::clone(fabric.outbound(p)),
                );
                threads.push(partition.spawn(Arc::clone(&running), cfg.pin_cores));
            }
        }

        let mut gateway_addr = None;
        if cfg.run_gateway {
            let gw = Arc::new(Gateway::new(Arc::clone(&registry), Arc::clone(&fabric)));

            let router = EgressRouter::new(Arc::clone(&fabric), Arc::clone(&registry));
            let ack_latency = router.ack_latency();
            threads.push(router.spawn(Arc::clone(&running)));
            threads.push(spawn_metrics_ticker(
                ack_latency,
                cfg.metrics_interval_secs,
                Arc::clone(&running),
            ));

            let server = GatewayServer::bind(cfg.gateway_port)?;
            gateway_addr = Some(server.local_addr());
            threads.extend(server.spawn(gw, Arc::clone(&running)));
        }

        info!("OMS node is up");
        Ok(Self {
            fabric,
            registry,
            running,
            threads,
            gateway_addr,
        })
    }

    /// Address of the TCP listener, when the gateway is running.
    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway_addr
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Flip the running flag and join every thread. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("shutting down OMS node");
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("OMS node stopped");
    }

    /// Block until the flag is cleared externally (signal handler, tests).
    pub fn wait(&self) {
        while self.running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for Oms {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_metrics_ticker(
    stats: Arc<LatencyStats>,
    interval_secs: u64,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("metrics-ticker".into())
        .spawn(move || {
            let interval = Duration::from_secs(interval_secs.max(1));
            let mut elapsed = Duration::ZERO;
            while running.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
                elapsed += Duration::from_millis(100);
                if elapsed >= interval {
                    stats.log_and_reset();
                    elapsed = Duration::ZERO;
                }
            }
        })
        .expect("spawn metrics ticker")
}
