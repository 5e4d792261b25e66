//! Gateway TCP server: one accept thread, two I/O worker threads.
//!
//! The acceptor hands new connections round-robin to the workers over
//! channels. Each worker owns its connections outright - scratch buffer,
//! session pointer, the lot - and sweeps them with non-blocking reads, so no
//! connection state is ever touched by two threads.

use crate::ingress::{Conn, ConnStatus, Gateway};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Ingress I/O worker threads.
const IO_WORKERS: usize = 2;

pub struct GatewayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl GatewayServer {
    /// Bind the listen socket. Port 0 asks the OS for an ephemeral port.
    pub fn bind(port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept thread and the I/O workers.
    pub fn spawn(self, gw: Arc<Gateway>, running: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(1 + IO_WORKERS);
        let mut senders: Vec<Sender<Conn>> = Vec::with_capacity(IO_WORKERS);

        for worker_id in 0..IO_WORKERS {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            let gw = Arc::clone(&gw);
            let running = Arc::clone(&running);
            handles.push(
                thread::Builder::new()
                    .name(format!("gateway-io-{worker_id}"))
                    .spawn(move || io_worker_loop(rx, gw, running))
                    .expect("spawn gateway io worker"),
            );
        }

        info!(addr = %self.local_addr, workers = IO_WORKERS, "gateway TCP server listening");
        let listener = self.listener;
        handles.push(
            thread::Builder::new()
                .name("gateway-accept".into())
                .spawn(move || accept_loop(listener, senders, running))
                .expect("spawn gateway acceptor"),
        );
        handles
    }
}

fn accept_loop(listener: TcpListener, senders: Vec<Sender<Conn>>, running: Arc<AtomicBool>) {
    let mut next_worker = 0usize;
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                match Conn::new(stream) {
                    Ok(conn) => {
                        // Round-robin assignment pins the connection to one
                        // worker for its whole life.
                        if senders[next_worker].send(conn).is_err() {
                            return; // workers are gone, we are shutting down
                        }
                        next_worker = (next_worker + 1) % senders.len();
                    }
                    Err(e) => warn!(%peer, error = %e, "failed to set up connection"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn io_worker_loop(rx: Receiver<Conn>, gw: Arc<Gateway>, running: Arc<AtomicBool>) {
    let mut conns: Vec<Conn> = Vec::new();
    while running.load(Ordering::Acquire) {
        while let Ok(conn) = rx.try_recv() {
            conns.push(conn);
        }

        let mut i = 0;
        while i < conns.len() {
            match conns[i].poll(&gw) {
                ConnStatus::Open => i += 1,
                ConnStatus::Closed => {
                    let mut conn = conns.swap_remove(i);
                    conn.on_disconnect(&gw);
                }
            }
        }

        if conns.is_empty() {
            thread::sleep(Duration::from_millis(1));
        } else {
            thread::yield_now();
        }
    }
}

/// Client-side connect helper used by the load generator and tests.
pub fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
