//! Limit order book for a single instrument.
//!
//! Two sorted sides - bids matched from the highest price, asks from the
//! lowest - plus an id index for O(1) cancel:
//!
//! - `bids` / `asks`: `BTreeMap<price, LevelIdx>`; level records themselves
//!   are pooled in the partition's [`LevelArena`], so the tree only ever holds
//!   4-byte handles and hot-path add/cancel/match stays allocation-free once
//!   levels exist.
//! - `order_index`: `FxHashMap<internal_order_id, OrderIdx>`.
//!
//! Matching is strict price-time priority: best opposing price first, FIFO
//! within a level, fills at the passive order's price. The fill callback lets
//! the engine partition emit events straight into its pre-allocated outbound
//! buffer without the book allocating anything.

use crate::arena::{LevelArena, LevelIdx, OrderArena, OrderIdx, NULL_INDEX};
use crate::protocol::{Side, TimeInForce};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Best-price sentinels when a side is empty.
pub const NO_BID: i64 = i64::MIN;
pub const NO_ASK: i64 = i64::MAX;

/// One execution, reported once per matched pair.
///
/// `aggressor_side` is the side of the incoming order; the passive side is by
/// definition the opposite. Leaves quantities are as of *after* this fill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillEvent {
    pub aggressor_id: u64,
    pub passive_id: u64,
    pub aggressor_session: u32,
    pub passive_session: u32,
    pub instrument_id: u32,
    pub aggressor_side: Side,
    pub fill_price: i64,
    pub fill_qty: u64,
    pub aggressor_leaves: u64,
    pub passive_leaves: u64,
}

/// The level pool ran dry while resting a remainder. The order has already
/// been released; the caller decides how to report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelPoolExhausted;

pub struct LimitOrderBook {
    instrument_id: u32,
    /// Best bid = highest key.
    pub bids: BTreeMap<i64, LevelIdx>,
    /// Best ask = lowest key.
    pub asks: BTreeMap<i64, LevelIdx>,
    order_index: FxHashMap<u64, OrderIdx>,
}

impl LimitOrderBook {
    pub fn new(instrument_id: u32) -> Self {
        Self {
            instrument_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            order_index: FxHashMap::with_capacity_and_hasher(1024, Default::default()),
        }
    }

    #[inline]
    pub fn instrument_id(&self) -> u32 {
        self.instrument_id
    }

    /// Add an order. Matches against the opposing side first; the remainder
    /// rests (GTC), is dropped (IOC), or the fully-filled order is released.
    ///
    /// Returns `Ok(true)` iff the order is now resting in the book. In every
    /// other outcome - including the `Err` case - the order node has been
    /// returned to the pool.
    pub fn add_order(
        &mut self,
        orders: &mut OrderArena,
        levels: &mut LevelArena,
        idx: OrderIdx,
        on_fill: &mut impl FnMut(FillEvent),
    ) -> Result<bool, LevelPoolExhausted> {
        match orders.get(idx).side {
            Side::Buy => self.match_against_asks(orders, levels, idx, on_fill),
            Side::Sell => self.match_against_bids(orders, levels, idx, on_fill),
        }

        let node = orders.get(idx);
        if node.qty == 0 {
            orders.free(idx);
            return Ok(false);
        }
        if node.tif == TimeInForce::Ioc {
            // IOC remainder is dropped silently; the missing resting ack is
            // the signal.
            orders.free(idx);
            return Ok(false);
        }

        let id = node.internal_order_id;
        match self.rest(orders, levels, idx) {
            Ok(()) => {
                self.order_index.insert(id, idx);
                Ok(true)
            }
            Err(e) => {
                orders.free(idx);
                Err(e)
            }
        }
    }

    /// Cancel by internal order id. Returns `false` if the id is unknown
    /// (already filled, already cancelled, or never here).
    pub fn cancel(&mut self, orders: &mut OrderArena, levels: &mut LevelArena, internal_order_id: u64) -> bool {
        let idx = match self.order_index.remove(&internal_order_id) {
            Some(idx) => idx,
            None => return false,
        };

        let (lvl, side, price) = {
            let node = orders.get(idx);
            (node.level, node.side, node.price)
        };
        debug_assert!(lvl != NULL_INDEX, "resting order without a level");

        if levels.unlink(orders, lvl, idx) {
            match side {
                Side::Buy => self.bids.remove(&price),
                Side::Sell => self.asks.remove(&price),
            };
            levels.free(lvl);
        }
        orders.free(idx);
        true
    }

    /// Highest bid price, or [`NO_BID`] when the side is empty.
    #[inline]
    pub fn best_bid(&self) -> i64 {
        self.bids.keys().next_back().copied().unwrap_or(NO_BID)
    }

    /// Lowest ask price, or [`NO_ASK`] when the side is empty.
    #[inline]
    pub fn best_ask(&self) -> i64 {
        self.asks.keys().next().copied().unwrap_or(NO_ASK)
    }

    #[inline]
    pub fn contains_order(&self, internal_order_id: u64) -> bool {
        self.order_index.contains_key(&internal_order_id)
    }

    #[inline]
    pub fn order_count(&self) -> usize {
        self.order_index.len()
    }

    pub fn bid_level_count(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_level_count(&self) -> usize {
        self.asks.len()
    }

    /// Resting quantity at a price, 0 if no level exists there.
    pub fn depth_at(&self, levels: &LevelArena, side: Side, price: i64) -> u64 {
        let map = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        map.get(&price).map(|&lvl| levels.get(lvl).total_qty).unwrap_or(0)
    }

    // ========================================================================
    // Matching
    // ========================================================================

    fn match_against_asks(
        &mut self,
        orders: &mut OrderArena,
        levels: &mut LevelArena,
        buy: OrderIdx,
        on_fill: &mut impl FnMut(FillEvent),
    ) {
        while orders.get(buy).qty > 0 {
            let (best_price, lvl) = match self.asks.iter().next() {
                Some((&p, &l)) => (p, l),
                None => break,
            };
            if orders.get(buy).price < best_price {
                break; // no cross
            }
            self.match_level(orders, levels, buy, lvl, best_price, on_fill);
            if levels.get(lvl).is_empty() {
                self.asks.remove(&best_price);
                levels.free(lvl);
            }
        }
    }

    fn match_against_bids(
        &mut self,
        orders: &mut OrderArena,
        levels: &mut LevelArena,
        sell: OrderIdx,
        on_fill: &mut impl FnMut(FillEvent),
    ) {
        while orders.get(sell).qty > 0 {
            let (best_price, lvl) = match self.bids.iter().next_back() {
                Some((&p, &l)) => (p, l),
                None => break,
            };
            if orders.get(sell).price > best_price {
                break; // no cross
            }
            self.match_level(orders, levels, sell, lvl, best_price, on_fill);
            if levels.get(lvl).is_empty() {
                self.bids.remove(&best_price);
                levels.free(lvl);
            }
        }
    }

    /// Walk the level head-first, filling until the aggressor or the level is
    /// exhausted. Fills execute at the passive (level) price.
    fn match_level(
        &mut self,
        orders: &mut OrderArena,
        levels: &mut LevelArena,
        agg: OrderIdx,
        lvl: LevelIdx,
        price: i64,
        on_fill: &mut impl FnMut(FillEvent),
    ) {
        let mut passive = levels.get(lvl).head;
        while passive != NULL_INDEX && orders.get(agg).qty > 0 {
            let fill_qty = orders.get(agg).qty.min(orders.get(passive).qty);

            orders.get_mut(agg).qty -= fill_qty;
            orders.get_mut(passive).qty -= fill_qty;
            levels.subtract_qty(lvl, fill_qty);

            {
                let agg_node = orders.get(agg);
                let passive_node = orders.get(passive);
                on_fill(FillEvent {
                    aggressor_id: agg_node.internal_order_id,
                    passive_id: passive_node.internal_order_id,
                    aggressor_session: agg_node.session_id,
                    passive_session: passive_node.session_id,
                    instrument_id: self.instrument_id,
                    aggressor_side: agg_node.side,
                    fill_price: price,
                    fill_qty,
                    aggressor_leaves: agg_node.qty,
                    passive_leaves: passive_node.qty,
                });
            }

            let next = orders.get(passive).next;
            if orders.get(passive).qty == 0 {
                let passive_id = orders.get(passive).internal_order_id;
                levels.unlink(orders, lvl, passive);
                self.order_index.remove(&passive_id);
                orders.free(passive);
            }
            passive = next;
        }
    }

    /// Rest a GTC remainder on its own side, creating the level lazily.
    fn rest(
        &mut self,
        orders: &mut OrderArena,
        levels: &mut LevelArena,
        idx: OrderIdx,
    ) -> Result<(), LevelPoolExhausted> {
        let (side, price) = {
            let node = orders.get(idx);
            (node.side, node.price)
        };
        let map = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let lvl = match map.get(&price) {
            Some(&lvl) => lvl,
            None => {
                let lvl = levels.alloc(price).ok_or(LevelPoolExhausted)?;
                map.insert(price, lvl);
                lvl
            }
        };
        levels.push_back(orders, lvl, idx);
        Ok(())
    }
}
