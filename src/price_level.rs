//! Price level FIFO operations.
//!
//! A [`LevelNode`] holds the endpoints of a doubly-linked queue of orders
//! resting at one price; the links themselves live intrusively on the
//! [`OrderNode`]s. Append, unlink and head access are all O(1), which is what
//! makes cancel-by-id O(1) end to end.
//!
//! Orders are matched in FIFO order: head = oldest = first to fill.

use crate::arena::{LevelArena, LevelIdx, OrderArena, OrderIdx, NULL_INDEX};

impl LevelArena {
    /// Append an order at the tail of the level's queue and take ownership of
    /// it (sets the order's `level` back-pointer).
    pub fn push_back(&mut self, orders: &mut OrderArena, lvl: LevelIdx, idx: OrderIdx) {
        let qty = orders.get(idx).qty;
        let level = self.get_mut(lvl);
        let old_tail = level.tail;

        if old_tail == NULL_INDEX {
            debug_assert!(level.head == NULL_INDEX);
            level.head = idx;
            level.tail = idx;
            let node = orders.get_mut(idx);
            node.prev = NULL_INDEX;
            node.next = NULL_INDEX;
        } else {
            level.tail = idx;
            orders.get_mut(old_tail).next = idx;
            let node = orders.get_mut(idx);
            node.prev = old_tail;
            node.next = NULL_INDEX;
        }

        self.get_mut(lvl).total_qty += qty;
        orders.get_mut(idx).level = lvl;
    }

    /// Unlink an order from anywhere in the level's queue.
    ///
    /// Subtracts the order's *current* remaining qty from the level total, so
    /// a fully-filled order (qty already 0) removes cleanly. The order is not
    /// freed; the caller decides what happens to it.
    ///
    /// Returns `true` if the level is now empty.
    pub fn unlink(&mut self, orders: &mut OrderArena, lvl: LevelIdx, idx: OrderIdx) -> bool {
        let (prev, next, qty) = {
            let node = orders.get(idx);
            debug_assert_eq!(node.level, lvl, "order not owned by this level");
            (node.prev, node.next, node.qty)
        };

        let level = self.get_mut(lvl);
        if prev == NULL_INDEX {
            level.head = next;
        }
        if next == NULL_INDEX {
            level.tail = prev;
        }
        level.total_qty -= qty;

        if prev != NULL_INDEX {
            orders.get_mut(prev).next = next;
        }
        if next != NULL_INDEX {
            orders.get_mut(next).prev = prev;
        }

        let node = orders.get_mut(idx);
        node.prev = NULL_INDEX;
        node.next = NULL_INDEX;
        node.level = NULL_INDEX;

        self.get(lvl).is_empty()
    }

    /// Reduce the level total after a partial fill of one of its orders.
    #[inline]
    pub fn subtract_qty(&mut self, lvl: LevelIdx, qty: u64) {
        let level = self.get_mut(lvl);
        debug_assert!(level.total_qty >= qty);
        level.total_qty -= qty;
    }
}
