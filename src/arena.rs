//! Fixed-capacity arenas for orders and price levels.
//!
//! Both pools pre-allocate a contiguous block at startup and run a free list
//! threaded through the unused nodes, so the hot path never touches the heap.
//! Nodes are addressed by `u32` indices instead of pointers: half the metadata
//! of a 64-bit pointer, and no reference cycles between an order and the level
//! that owns it.
//!
//! Each arena is owned by a single engine partition and only ever touched by
//! that partition's thread.

use crate::protocol::{Side, TimeInForce};
use std::fmt;

/// Sentinel for a null/invalid index (like nullptr).
pub const NULL_INDEX: u32 = u32::MAX;

/// Index into an [`OrderArena`].
pub type OrderIdx = u32;

/// Index into a [`LevelArena`].
pub type LevelIdx = u32;

/// A pooled resting order - exactly two cache lines.
///
/// Fields are read/written directly; no accessors on the hot path.
/// `prev`/`next` link the order into its price level's FIFO and double as the
/// free-list thread while the node is unallocated. `level` is the back-pointer
/// that makes cancel O(1).
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct OrderNode {
    /// Scaled limit price (decimal * 10^6).
    pub price: i64,
    /// Remaining quantity.
    pub qty: u64,
    /// Original quantity at entry.
    pub orig_qty: u64,
    /// Gateway-assigned globally unique id.
    pub internal_order_id: u64,
    pub client_seq_no: u64,
    pub recv_ts_nanos: i64,
    pub session_id: u32,
    pub instrument_id: u32,
    /// Next order at the same price (toward the tail).
    pub next: OrderIdx,
    /// Previous order at the same price (toward the head).
    pub prev: OrderIdx,
    /// Owning price level while resting.
    pub level: LevelIdx,
    pub side: Side,
    pub tif: TimeInForce,
}

const _: () = assert!(
    std::mem::size_of::<OrderNode>() == 128,
    "OrderNode must be exactly two cache lines"
);

impl OrderNode {
    const fn empty() -> Self {
        Self {
            price: 0,
            qty: 0,
            orig_qty: 0,
            internal_order_id: 0,
            client_seq_no: 0,
            recv_ts_nanos: 0,
            session_id: 0,
            instrument_id: 0,
            next: NULL_INDEX,
            prev: NULL_INDEX,
            level: NULL_INDEX,
            side: Side::Buy,
            tif: TimeInForce::Gtc,
        }
    }

    fn reset(&mut self) {
        *self = Self::empty();
    }
}

impl fmt::Debug for OrderNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderNode")
            .field("internal_order_id", &self.internal_order_id)
            .field("session_id", &self.session_id)
            .field("side", &self.side)
            .field("price", &self.price)
            .field("qty", &self.qty)
            .field("level", &self.level)
            .finish()
    }
}

/// Pre-allocated order pool with O(1) borrow/release.
pub struct OrderArena {
    nodes: Vec<OrderNode>,
    free_head: OrderIdx,
    allocated: u32,
    capacity: u32,
}

impl OrderArena {
    /// # Panics
    /// Panics if `capacity >= NULL_INDEX` (the sentinel must stay unused).
    pub fn new(capacity: u32) -> Self {
        assert!(capacity < NULL_INDEX, "capacity must be less than NULL_INDEX");

        let mut nodes = vec![OrderNode::empty(); capacity as usize];
        // Thread the free list through the nodes' `next` fields.
        for i in 0..capacity.saturating_sub(1) {
            nodes[i as usize].next = i + 1;
        }
        Self {
            nodes,
            free_head: if capacity > 0 { 0 } else { NULL_INDEX },
            allocated: 0,
            capacity,
        }
    }

    /// Borrow a zeroed node. Returns `None` on exhaustion - the caller turns
    /// that into a SYSTEM_BUSY reject, never a crash.
    #[inline]
    pub fn alloc(&mut self) -> Option<OrderIdx> {
        if self.free_head == NULL_INDEX {
            return None;
        }
        let idx = self.free_head;
        self.free_head = self.nodes[idx as usize].next;
        self.allocated += 1;
        self.nodes[idx as usize].reset();
        Some(idx)
    }

    /// Return a node to the pool. The index must have been allocated and not
    /// yet freed; debug builds assert on double-free.
    #[inline]
    pub fn free(&mut self, idx: OrderIdx) {
        debug_assert!(idx < self.capacity, "index out of bounds");
        debug_assert!(self.allocated > 0, "double free detected");
        self.nodes[idx as usize].reset();
        self.nodes[idx as usize].next = self.free_head;
        self.free_head = idx;
        self.allocated -= 1;
    }

    #[inline]
    pub fn get(&self, idx: OrderIdx) -> &OrderNode {
        debug_assert!(idx < self.capacity, "index out of bounds");
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: OrderIdx) -> &mut OrderNode {
        debug_assert!(idx < self.capacity, "index out of bounds");
        &mut self.nodes[idx as usize]
    }

    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn available(&self) -> u32 {
        self.capacity - self.allocated
    }

    /// Pre-fault all pages so the first orders don't take page faults.
    pub fn warm_up(&mut self) {
        for node in &mut self.nodes {
            unsafe {
                std::ptr::write_volatile(&mut node.instrument_id, 0);
            }
        }
    }
}

impl fmt::Debug for OrderArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderArena")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated)
            .finish()
    }
}

/// A pooled price level: FIFO endpoints plus the running quantity sum.
///
/// `head` doubles as the free-list thread while the node is unallocated.
#[repr(C, align(64))]
#[derive(Clone, Copy, Debug)]
pub struct LevelNode {
    /// Scaled price shared by every order in the list.
    pub price: i64,
    /// Sum of remaining qty over all orders at this level.
    pub total_qty: u64,
    /// Oldest order (first to match).
    pub head: OrderIdx,
    /// Newest order.
    pub tail: OrderIdx,
}

const _: () = assert!(
    std::mem::size_of::<LevelNode>() == 64,
    "LevelNode must be exactly one cache line"
);

impl LevelNode {
    const fn empty() -> Self {
        Self {
            price: 0,
            total_qty: 0,
            head: NULL_INDEX,
            tail: NULL_INDEX,
        }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.head == NULL_INDEX
    }
}

/// Pre-allocated price-level pool. Same free-list scheme as [`OrderArena`].
pub struct LevelArena {
    nodes: Vec<LevelNode>,
    free_head: LevelIdx,
    allocated: u32,
    capacity: u32,
}

impl LevelArena {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity < NULL_INDEX, "capacity must be less than NULL_INDEX");

        let mut nodes = vec![LevelNode::empty(); capacity as usize];
        for i in 0..capacity.saturating_sub(1) {
            nodes[i as usize].head = i + 1;
        }
        Self {
            nodes,
            free_head: if capacity > 0 { 0 } else { NULL_INDEX },
            allocated: 0,
            capacity,
        }
    }

    /// Borrow an empty level seeded with `price`. `None` on exhaustion.
    #[inline]
    pub fn alloc(&mut self, price: i64) -> Option<LevelIdx> {
        if self.free_head == NULL_INDEX {
            return None;
        }
        let idx = self.free_head;
        self.free_head = self.nodes[idx as usize].head;
        self.allocated += 1;
        let node = &mut self.nodes[idx as usize];
        *node = LevelNode::empty();
        node.price = price;
        Some(idx)
    }

    #[inline]
    pub fn free(&mut self, idx: LevelIdx) {
        debug_assert!(idx < self.capacity, "index out of bounds");
        debug_assert!(self.allocated > 0, "double free detected");
        self.nodes[idx as usize] = LevelNode::empty();
        self.nodes[idx as usize].head = self.free_head;
        self.free_head = idx;
        self.allocated -= 1;
    }

    #[inline]
    pub fn get(&self, idx: LevelIdx) -> &LevelNode {
        debug_assert!(idx < self.capacity, "index out of bounds");
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: LevelIdx) -> &mut LevelNode {
        debug_assert!(idx < self.capacity, "index out of bounds");
        &mut self.nodes[idx as usize]
    }

    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl fmt::Debug for LevelArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelArena")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_sizes() {
        assert_eq!(std::mem::size_of::<OrderNode>(), 128);
        assert_eq!(std::mem::size_of::<LevelNode>(), 64);
    }

    #[test]
    fn order_alloc_free_accounting() {
        let mut arena = OrderArena::new(3);
        assert_eq!(arena.available(), 3);

        let a = arena.alloc().expect("alloc");
        let b = arena.alloc().expect("alloc");
        let c = arena.alloc().expect("alloc");
        assert_eq!(arena.allocated(), 3);
        assert_eq!(arena.available(), 0);
        assert!(arena.alloc().is_none(), "pool exhausted");

        arena.free(b);
        assert_eq!(arena.allocated() + arena.available(), arena.capacity());

        // LIFO reuse of the freed slot
        let d = arena.alloc().expect("alloc");
        assert_eq!(d, b);

        arena.free(a);
        arena.free(c);
        arena.free(d);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn order_nodes_are_zeroed_on_alloc() {
        let mut arena = OrderArena::new(2);
        let idx = arena.alloc().unwrap();
        {
            let node = arena.get_mut(idx);
            node.internal_order_id = 99;
            node.qty = 500;
            node.level = 3;
        }
        arena.free(idx);
        let idx2 = arena.alloc().unwrap();
        assert_eq!(idx2, idx);
        let node = arena.get(idx2);
        assert_eq!(node.internal_order_id, 0);
        assert_eq!(node.qty, 0);
        assert_eq!(node.level, NULL_INDEX);
        assert_eq!(node.prev, NULL_INDEX);
        assert_eq!(node.next, NULL_INDEX);
    }

    #[test]
    fn level_alloc_seeds_price() {
        let mut levels = LevelArena::new(2);
        let idx = levels.alloc(101_000_000).unwrap();
        let lvl = levels.get(idx);
        assert_eq!(lvl.price, 101_000_000);
        assert_eq!(lvl.total_qty, 0);
        assert!(lvl.is_empty());
    }

    #[test]
    fn level_exhaustion_returns_none() {
        let mut levels = LevelArena::new(1);
        let a = levels.alloc(1).unwrap();
        assert!(levels.alloc(2).is_none());
        levels.free(a);
        assert!(levels.alloc(3).is_some());
    }

    #[test]
    fn zero_capacity_arena() {
        let mut arena = OrderArena::new(0);
        assert!(arena.alloc().is_none());
    }
}
