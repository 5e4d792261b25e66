//! TCP load generator.
//!
//! Logs on, paces NEW_ORDER frames at a target rate, and measures
//! send-to-ACK round-trip latency. Orders alternate sides around a fixed
//! price band so the engine produces real fills, not just resting acks.

use anyhow::{Context, Result};
use clap::Parser;
use flash_oms::metrics::nanos_now;
use flash_oms::protocol::{
    frame_logon, frame_new_order, Ack, Fill, LogonAck, MsgType, NewOrder, Reject, Side,
    TimeInForce, PRICE_SCALE,
};
use hdrhistogram::Histogram;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Slots in the seqno -> send-timestamp ring.
const TS_RING: usize = 1 << 20;

#[derive(Parser, Debug)]
#[command(name = "loadgen", version, about = "OMS gateway load generator")]
struct Cli {
    /// Gateway address.
    #[arg(long, default_value = "127.0.0.1:7001")]
    addr: String,
    /// Orders per second.
    #[arg(long, default_value_t = 10_000)]
    rate: u64,
    /// Test duration in seconds.
    #[arg(long, default_value_t = 10)]
    duration: u64,
    /// Instrument ids are cycled 0..instruments.
    #[arg(long, default_value_t = 16)]
    instruments: u32,
    /// Client id echoed in the logon.
    #[arg(long, default_value_t = 42)]
    client_id: u64,
}

struct Counters {
    acks: AtomicU64,
    fills: AtomicU64,
    rejects: AtomicU64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!(addr = %cli.addr, rate = cli.rate, duration = cli.duration, "connecting");

    let mut stream = TcpStream::connect(&cli.addr)
        .with_context(|| format!("failed to connect to gateway at {}", cli.addr))?;
    stream.set_nodelay(true)?;

    // Logon and wait for the ack before generating load.
    let mut buf = [0u8; 64];
    let len = frame_logon(&mut buf, 0, cli.client_id);
    stream.write_all(&buf[..len])?;
    let frame = read_frame(&mut stream).context("no logon ack")?;
    let session_id = match MsgType::from_code(frame[0]) {
        Some(MsgType::LogonAck) => LogonAck::decode(&frame[1..]).context("bad logon ack")?.session_id,
        other => anyhow::bail!("unexpected reply to logon: {other:?}"),
    };
    info!(session_id, "logged on, starting load");

    let send_ts: Arc<Vec<AtomicI64>> = Arc::new((0..TS_RING).map(|_| AtomicI64::new(0)).collect());
    let counters = Arc::new(Counters {
        acks: AtomicU64::new(0),
        fills: AtomicU64::new(0),
        rejects: AtomicU64::new(0),
    });
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let stream = stream.try_clone()?;
        let send_ts = Arc::clone(&send_ts);
        let counters = Arc::clone(&counters);
        let done = Arc::clone(&done);
        thread::Builder::new()
            .name("loadgen-reader".into())
            .spawn(move || read_responses(stream, send_ts, counters, done))?
    };

    // Token-interval pacing: order i is due at start + i * interval.
    let interval_nanos = 1_000_000_000 / cli.rate.max(1);
    let total_orders = cli.rate * cli.duration;
    let start = Instant::now();

    for i in 0..total_orders {
        let due = start + Duration::from_nanos(interval_nanos * i);
        loop {
            let now = Instant::now();
            if now >= due {
                break;
            }
            let wait = due - now;
            if wait > Duration::from_micros(100) {
                thread::sleep(wait - Duration::from_micros(50));
            } else {
                std::hint::spin_loop();
            }
        }

        let seq = i + 1;
        let order = NewOrder {
            session_id,
            client_id: cli.client_id,
            client_seq_no: seq,
            instrument_id: (i % cli.instruments as u64) as u32,
            side: if i % 2 == 0 { Side::Buy } else { Side::Sell },
            tif: TimeInForce::Gtc,
            // A narrow band around 100.00 so opposite sides keep crossing.
            price: (100 + (i % 5) as i64 - 2) * PRICE_SCALE,
            qty: 10,
            recv_ts_nanos: nanos_now(),
        };
        send_ts[(seq as usize) & (TS_RING - 1)].store(nanos_now(), Ordering::Release);
        let len = frame_new_order(&mut buf, &order);
        stream.write_all(&buf[..len])?;
    }

    let send_secs = start.elapsed().as_secs_f64();
    info!("send complete: {total_orders} orders in {send_secs:.2}s, draining replies");

    // Give in-flight replies a moment, then unblock the reader.
    thread::sleep(Duration::from_millis(500));
    done.store(true, Ordering::Release);
    stream.shutdown(std::net::Shutdown::Both).ok();
    let hist = reader.join().expect("reader thread");

    println!("\n=== Load Report ===");
    println!("Sent:     {total_orders} orders in {send_secs:.2}s ({:.0} o/s)", total_orders as f64 / send_secs);
    println!("Acks:     {}", counters.acks.load(Ordering::Acquire));
    println!("Fills:    {}", counters.fills.load(Ordering::Acquire));
    println!("Rejects:  {}", counters.rejects.load(Ordering::Acquire));
    if hist.is_empty() {
        println!("No RTT samples recorded.");
    } else {
        println!("--- send-to-ack RTT ---");
        println!("P50:    {:8} ns", hist.value_at_quantile(0.50));
        println!("P90:    {:8} ns", hist.value_at_quantile(0.90));
        println!("P99:    {:8} ns", hist.value_at_quantile(0.99));
        println!("P99.9:  {:8} ns", hist.value_at_quantile(0.999));
        println!("Max:    {:8} ns", hist.max());
    }
    Ok(())
}

fn read_responses(
    mut stream: TcpStream,
    send_ts: Arc<Vec<AtomicI64>>,
    counters: Arc<Counters>,
    done: Arc<AtomicBool>,
) -> Histogram<u64> {
    let mut hist = Histogram::<u64>::new_with_bounds(1, 10_000_000_000, 3).expect("histogram");
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .ok();

    loop {
        match read_frame_retrying(&mut stream, &done) {
            Some(frame) => match MsgType::from_code(frame[0]) {
                Some(MsgType::Ack) => {
                    if let Some(ack) = Ack::decode(&frame[1..]) {
                        let sent = send_ts[(ack.client_seq_no as usize) & (TS_RING - 1)]
                            .load(Ordering::Acquire);
                        if sent > 0 {
                            hist.saturating_record((nanos_now() - sent).max(1) as u64);
                        }
                        counters.acks.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Some(MsgType::Fill) => {
                    if Fill::decode(&frame[1..]).is_some() {
                        counters.fills.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Some(MsgType::Reject) => {
                    counters.rejects.fetch_add(1, Ordering::Relaxed);
                    if let Some(r) = Reject::decode(&frame[1..]) {
                        warn!(seq = r.client_seq_no, reason = ?r.reason, "order rejected");
                    }
                }
                Some(MsgType::CancelAck) | Some(MsgType::Heartbeat) => {}
                other => warn!(?other, "unexpected message from gateway"),
            },
            None => break,
        }
    }
    hist
}

/// Read one frame on the blocking logon path.
fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 2];
    if stream.read_exact(&mut header).is_err() {
        return None;
    }
    let len = u16::from_le_bytes(header) as usize;
    if len == 0 {
        return None;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).ok()?;
    Some(body)
}

/// Read one frame on a socket with a read timeout, resuming partial reads so
/// a timeout mid-frame never desyncs the stream. `None` means closed, or
/// idle after the sender finished.
fn read_frame_retrying(stream: &mut TcpStream, done: &AtomicBool) -> Option<Vec<u8>> {
    let mut header = [0u8; 2];
    fill(stream, &mut header, done)?;
    let len = u16::from_le_bytes(header) as usize;
    if len == 0 {
        return None;
    }
    let mut body = vec![0u8; len];
    fill(stream, &mut body, done)?;
    Some(body)
}

fn fill(stream: &mut TcpStream, buf: &mut [u8], done: &AtomicBool) -> Option<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return None,
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Idle and nothing half-read: stop once the run is over.
                if filled == 0 && done.load(Ordering::Acquire) {
                    return None;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => return None,
        }
    }
    Some(())
}
