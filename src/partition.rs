//! Single-threaded engine partition.
//!
//! One worker owns every instrument with `instrument_id % partitions ==
//! partition_id`: its books, its order/level arenas, its inbound subscription
//! and its outbound publication. The run loop is poll -> match -> publish,
//! with no locks anywhere - partition-private ownership replaces them.
//!
//! Outbound ordering: the ACK for an order is published before any of its
//! fills, and events appear in the order matching produced them. There is no
//! ordering across partitions.

use crate::arena::{LevelArena, OrderArena};
use crate::order_book::{FillEvent, LimitOrderBook};
use crate::metrics::nanos_now;
use crate::protocol::{
    encode_ack, encode_cancel_ack, encode_fill, encode_reject, Ack, CancelRequest, Fill,
    InternalNewOrder, MsgType, RejectReason,
};
use crate::transport::{PublishResult, TransportStream};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Orders pooled per partition.
pub const ORDER_POOL_SIZE: u32 = 100_000;
/// Price levels pooled per partition.
pub const LEVEL_POOL_SIZE: u32 = 50_000;

/// Fragments consumed per inbound poll before checking the running flag.
const POLL_FRAGMENT_LIMIT: usize = 256;

/// Outbound publish attempts before the event is dropped.
const PUBLISH_ATTEMPTS: u32 = 3;

pub struct EnginePartition {
    partition_id: u32,
    books: FxHashMap<u32, LimitOrderBook>,
    orders: OrderArena,
    levels: LevelArena,
    inbound: Arc<TransportStream>,
    outbound: Arc<TransportStream>,
}

impl EnginePartition {
    pub fn new(partition_id: u32, inbound: Arc<TransportStream>, outbound: Arc<TransportStream>) -> Self {
        Self::with_capacity(partition_id, inbound, outbound, ORDER_POOL_SIZE, LEVEL_POOL_SIZE)
    }

    /// Pool sizes are parameterised for tests; production uses the defaults.
    pub fn with_capacity(
        partition_id: u32,
        inbound: Arc<TransportStream>,
        outbound: Arc<TransportStream>,
        order_capacity: u32,
        level_capacity: u32,
    ) -> Self {
        Self {
            partition_id,
            books: FxHashMap::default(),
            orders: OrderArena::new(order_capacity),
            levels: LevelArena::new(level_capacity),
            inbound,
            outbound,
        }
    }

    #[inline]
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn order_pool_available(&self) -> u32 {
        self.orders.available()
    }

    pub fn book(&self, instrument_id: u32) -> Option<&LimitOrderBook> {
        self.books.get(&instrument_id)
    }

    /// Spawn the worker on its own named thread.
    pub fn spawn(mut self, running: Arc<AtomicBool>, pin_cores: bool) -> JoinHandle<()> {
        let name = format!("engine-partition-{}", self.partition_id);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                if pin_cores {
                    self.pin_to_core();
                }
                self.orders.warm_up();
                info!(
                    partition = self.partition_id,
                    inbound = self.inbound.stream_id(),
                    outbound = self.outbound.stream_id(),
                    "engine partition started"
                );
                self.run(&running);
            })
            .expect("spawn engine partition")
    }

    /// Tight poll loop until the running flag clears.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            if self.poll_once() == 0 {
                thread::yield_now();
            }
        }
    }

    /// One poll sweep; exposed so tests can drive the partition inline.
    pub fn poll_once(&mut self) -> usize {
        let inbound = Arc::clone(&self.inbound);
        inbound.poll(POLL_FRAGMENT_LIMIT, |bytes| self.on_fragment(bytes))
    }

    fn on_fragment(&mut self, bytes: &[u8]) {
        let Some((&code, payload)) = bytes.split_first() else {
            return;
        };
        match MsgType::from_code(code) {
            Some(MsgType::NewOrder) => self.handle_new_order(payload),
            Some(MsgType::CancelRequest) => self.handle_cancel(payload),
            Some(other) => {
                warn!(partition = self.partition_id, ?other, "unexpected inbound message type");
            }
            None => {
                warn!(partition = self.partition_id, code, "unknown inbound message type");
            }
        }
    }

    fn handle_new_order(&mut self, payload: &[u8]) {
        let Some(m) = InternalNewOrder::decode(payload) else {
            warn!(partition = self.partition_id, "short NEW_ORDER payload, dropping");
            return;
        };

        let Some(idx) = self.orders.alloc() else {
            self.publish_reject(m.session_id, m.client_seq_no, RejectReason::SystemBusy);
            return;
        };
        {
            let node = self.orders.get_mut(idx);
            node.internal_order_id = m.internal_order_id;
            node.session_id = m.session_id;
            node.client_seq_no = m.client_seq_no;
            node.instrument_id = m.instrument_id;
            node.side = m.side;
            node.tif = m.tif;
            node.price = m.price;
            node.qty = m.qty;
            node.orig_qty = m.qty;
            node.recv_ts_nanos = m.recv_ts_nanos;
        }

        // Ack before matching so the client sees ACK before any FILL.
        self.publish_ack(&m);

        let partition_id = self.partition_id;
        let outbound = Arc::clone(&self.outbound);
        let book = self
            .books
            .entry(m.instrument_id)
            .or_insert_with(|| LimitOrderBook::new(m.instrument_id));

        let result = book.add_order(&mut self.orders, &mut self.levels, idx, &mut |f: FillEvent| {
            publish_fill_pair(partition_id, &outbound, &f);
        });

        if result.is_err() {
            warn!(
                partition = self.partition_id,
                order = m.internal_order_id,
                "level pool exhausted, rejecting remainder"
            );
            self.publish_reject(m.session_id, m.client_seq_no, RejectReason::SystemBusy);
        }
    }

    fn handle_cancel(&mut self, payload: &[u8]) {
        let Some(m) = CancelRequest::decode(payload) else {
            warn!(partition = self.partition_id, "short CANCEL_REQUEST payload, dropping");
            return;
        };

        // The cancel carries the instrument, so the owning book is a direct
        // lookup; an unknown instrument means an unknown order.
        let cancelled = match self.books.get_mut(&m.instrument_id) {
            Some(book) => book.cancel(&mut self.orders, &mut self.levels, m.internal_order_id),
            None => false,
        };

        if cancelled {
            self.publish_cancel_ack(m.internal_order_id, m.session_id);
        } else {
            self.publish_reject(m.session_id, m.client_seq_no, RejectReason::OrderNotFound);
        }
    }

    // ========================================================================
    // Outbound publication
    // ========================================================================

    fn publish_ack(&self, m: &InternalNewOrder) {
        let mut buf = [0u8; 64];
        let len = encode_ack(
            &mut buf,
            &Ack {
                internal_order_id: m.internal_order_id,
                client_seq_no: m.client_seq_no,
                session_id: m.session_id,
                instrument_id: m.instrument_id,
                ts_nanos: nanos_now(),
            },
        );
        publish_with_retry(self.partition_id, &self.outbound, &buf[..len]);
    }

    fn publish_reject(&self, session_id: u32, client_seq_no: u64, reason: RejectReason) {
        let mut buf = [0u8; 64];
        let len = encode_reject(&mut buf, session_id, client_seq_no, reason);
        publish_with_retry(self.partition_id, &self.outbound, &buf[..len]);
    }

    fn publish_cancel_ack(&self, internal_order_id: u64, session_id: u32) {
        let mut buf = [0u8; 64];
        let len = encode_cancel_ack(&mut buf, internal_order_id, session_id);
        publish_with_retry(self.partition_id, &self.outbound, &buf[..len]);
    }

    fn pin_to_core(&self) {
        if let Some(cores) = core_affinity::get_core_ids() {
            if !cores.is_empty() {
                let core = cores[self.partition_id as usize % cores.len()];
                core_affinity::set_for_current(core);
            }
        }
    }
}

/// Every execution produces two FILL events: one addressed to the aggressor
/// with its own side, one to the passive party with the opposite side code.
/// "Side" on a FILL is always the side of the addressee.
fn publish_fill_pair(partition_id: u32, outbound: &TransportStream, f: &FillEvent) {
    let ts = nanos_now();
    let mut buf = [0u8; 64];

    let len = encode_fill(
        &mut buf,
        &Fill {
            internal_order_id: f.aggressor_id,
            session_id: f.aggressor_session,
            instrument_id: f.instrument_id,
            side: f.aggressor_side,
            fill_price: f.fill_price,
            fill_qty: f.fill_qty,
            leaves_qty: f.aggressor_leaves,
            ts_nanos: ts,
        },
    );
    publish_with_retry(partition_id, outbound, &buf[..len]);

    let len = encode_fill(
        &mut buf,
        &Fill {
            internal_order_id: f.passive_id,
            session_id: f.passive_session,
            instrument_id: f.instrument_id,
            side: f.aggressor_side.opposite(),
            fill_price: f.fill_price,
            fill_qty: f.fill_qty,
            leaves_qty: f.passive_leaves,
            ts_nanos: ts,
        },
    );
    publish_with_retry(partition_id, outbound, &buf[..len]);
}

/// Retry transient backpressure a few times, then drop the event. A dropped
/// outbound event is logged and accepted; the alternative is stalling the
/// whole partition.
fn publish_with_retry(partition_id: u32, outbound: &TransportStream, bytes: &[u8]) {
    let mut attempts = 0;
    loop {
        match outbound.publish(bytes) {
            PublishResult::Ok => return,
            PublishResult::Backpressured | PublishResult::AdminBlocked => {
                attempts += 1;
                if attempts >= PUBLISH_ATTEMPTS {
                    warn!(partition = partition_id, "outbound backpressure, dropping event");
                    return;
                }
            }
            PublishResult::Failed => {
                warn!(partition = partition_id, "outbound publish failed, dropping event");
                return;
            }
        }
    }
}
