//! Partition transport: per-partition message streams between gateway and
//! engine.
//!
//! Each partition gets a pair of unidirectional streams (inbound = gateway to
//! engine, outbound = engine to gateway) backed by a lock-free
//! `crossbeam_queue::ArrayQueue` of fixed 64-byte fragments. The queue gives
//! us exactly the contract the rest of the system is built on:
//!
//! - per-stream FIFO delivery of whole messages;
//! - a full queue reports backpressure immediately instead of blocking, so
//!   the publisher decides whether to retry, drop, or reject upstream;
//! - multi-producer safety, which the inbound direction needs because both
//!   gateway I/O workers publish into the same partition.
//!
//! Stream ids (`base + partition`) exist for logging and diagnostics only;
//! routing is by partition index.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Largest transport message: 1 type byte + the 62-byte internal NEW_ORDER.
pub const MAX_FRAGMENT: usize = 63;

/// A whole transport message, padded to one cache line.
#[derive(Clone, Copy)]
pub struct Fragment {
    len: u8,
    data: [u8; MAX_FRAGMENT],
}

const _: () = assert!(std::mem::size_of::<Fragment>() == 64);

impl Fragment {
    fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_FRAGMENT {
            return None;
        }
        let mut data = [0u8; MAX_FRAGMENT];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self { len: bytes.len() as u8, data })
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Outcome of a publish attempt. `Backpressured` and `AdminBlocked` are
/// transient; `Failed` is not retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishResult {
    Ok,
    Backpressured,
    AdminBlocked,
    Failed,
}

/// One unidirectional FIFO stream.
pub struct TransportStream {
    stream_id: u32,
    queue: ArrayQueue<Fragment>,
    admin_blocked: AtomicBool,
}

impl TransportStream {
    pub fn new(stream_id: u32, capacity: usize) -> Self {
        Self {
            stream_id,
            queue: ArrayQueue::new(capacity.max(1)),
            admin_blocked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Publish one whole message. Never blocks.
    pub fn publish(&self, bytes: &[u8]) -> PublishResult {
        if self.admin_blocked.load(Ordering::Acquire) {
            return PublishResult::AdminBlocked;
        }
        let frag = match Fragment::new(bytes) {
            Some(f) => f,
            None => return PublishResult::Failed,
        };
        match self.queue.push(frag) {
            Ok(()) => PublishResult::Ok,
            Err(_) => PublishResult::Backpressured,
        }
    }

    /// Deliver up to `max_fragments` whole messages to `handler`.
    /// Returns the number delivered; 0 means the poller should yield.
    pub fn poll(&self, max_fragments: usize, mut handler: impl FnMut(&[u8])) -> usize {
        let mut delivered = 0;
        while delivered < max_fragments {
            match self.queue.pop() {
                Some(frag) => {
                    handler(frag.bytes());
                    delivered += 1;
                }
                None => break,
            }
        }
        delivered
    }

    /// Administrative pause: publishes report `AdminBlocked` until released.
    pub fn set_admin_blocked(&self, blocked: bool) {
        self.admin_blocked.store(blocked, Ordering::Release);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Map an instrument to its owning partition. The only routing key in the
/// system.
#[inline]
pub fn partition_for(instrument_id: u32, partitions: u32) -> u32 {
    instrument_id % partitions
}

/// All `2 x P` streams of a running system.
pub struct Fabric {
    inbound: Vec<Arc<TransportStream>>,
    outbound: Vec<Arc<TransportStream>>,
}

impl Fabric {
    pub fn new(partitions: u32, inbound_base: u32, outbound_base: u32, queue_capacity: usize) -> Self {
        let inbound = (0..partitions)
            .map(|p| Arc::new(TransportStream::new(inbound_base + p, queue_capacity)))
            .collect();
        let outbound = (0..partitions)
            .map(|p| Arc::new(TransportStream::new(outbound_base + p, queue_capacity)))
            .collect();
        Self { inbound, outbound }
    }

    #[inline]
    pub fn partitions(&self) -> u32 {
        self.inbound.len() as u32
    }

    #[inline]
    pub fn inbound(&self, partition: u32) -> &Arc<TransportStream> {
        &self.inbound[partition as usize]
    }

    #[inline]
    pub fn outbound(&self, partition: u32) -> &Arc<TransportStream> {
        &self.outbound[partition as usize]
    }
}
