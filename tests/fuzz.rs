//! Randomized comparison against a naive reference implementation.
//!
//! The reference book is slow but obviously correct: sorted maps of plain
//! vectors, no pooling, no intrusive links. Feeding both books the same
//! seeded command stream and comparing best prices, order counts and traded
//! volume catches exactly the class of bugs the arena indices could hide.

use flash_oms::order_book::{FillEvent, LimitOrderBook, NO_ASK, NO_BID};
use flash_oms::{LevelArena, OrderArena, Side, TimeInForce, PRICE_SCALE};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};

/// Naive but correct price-time book, GTC and IOC.
struct ReferenceBook {
    bids: BTreeMap<i64, Vec<(u64, u64)>>, // price -> [(id, qty)] in arrival order
    asks: BTreeMap<i64, Vec<(u64, u64)>>,
    orders: HashMap<u64, (Side, i64)>,
}

impl ReferenceBook {
    fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
        }
    }

    fn best_bid(&self) -> i64 {
        self.bids.keys().next_back().copied().unwrap_or(NO_BID)
    }

    fn best_ask(&self) -> i64 {
        self.asks.keys().next().copied().unwrap_or(NO_ASK)
    }

    fn place(&mut self, id: u64, side: Side, tif: TimeInForce, price: i64, mut qty: u64) -> u64 {
        let mut traded = 0u64;

        let crossable: Vec<i64> = match side {
            Side::Buy => self.asks.keys().copied().filter(|&p| p <= price).collect(),
            Side::Sell => self.bids.keys().rev().copied().filter(|&p| p >= price).collect(),
        };

        for level_price in crossable {
            if qty == 0 {
                break;
            }
            let book = match side {
                Side::Buy => &mut self.asks,
                Side::Sell => &mut self.bids,
            };
            let queue = book.get_mut(&level_price).unwrap();
            while !queue.is_empty() && qty > 0 {
                let take = queue[0].1.min(qty);
                queue[0].1 -= take;
                qty -= take;
                traded += take;
                if queue[0].1 == 0 {
                    let (maker, _) = queue.remove(0);
                    self.orders.remove(&maker);
                }
            }
            if queue.is_empty() {
                book.remove(&level_price);
            }
        }

        if qty > 0 && tif == TimeInForce::Gtc {
            let book = match side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };
            book.entry(price).or_default().push((id, qty));
            self.orders.insert(id, (side, price));
        }
        traded
    }

    fn cancel(&mut self, id: u64) -> bool {
        let Some((side, price)) = self.orders.remove(&id) else {
            return false;
        };
        let book = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if let Some(queue) = book.get_mut(&price) {
            queue.retain(|&(oid, _)| oid != id);
            if queue.is_empty() {
                book.remove(&price);
            }
        }
        true
    }

    fn order_count(&self) -> usize {
        self.orders.len()
    }
}

struct Engine {
    book: LimitOrderBook,
    orders: OrderArena,
    levels: LevelArena,
}

impl Engine {
    fn new() -> Self {
        Self {
            book: LimitOrderBook::new(1),
            orders: OrderArena::new(200_000),
            levels: LevelArena::new(50_000),
        }
    }

    fn place(&mut self, id: u64, side: Side, tif: TimeInForce, price: i64, qty: u64) -> (u64, bool) {
        let idx = self.orders.alloc().expect("pool");
        {
            let node = self.orders.get_mut(idx);
            node.internal_order_id = id;
            node.session_id = 1;
            node.instrument_id = 1;
            node.side = side;
            node.tif = tif;
            node.price = price;
            node.qty = qty;
            node.orig_qty = qty;
        }
        let mut traded = 0u64;
        let resting = self
            .book
            .add_order(&mut self.orders, &mut self.levels, idx, &mut |f: FillEvent| {
                traded += f.fill_qty;
            })
            .expect("level pool");
        (traded, resting)
    }

    fn cancel(&mut self, id: u64) -> bool {
        self.book.cancel(&mut self.orders, &mut self.levels, id)
    }
}

fn random_order(rng: &mut ChaCha8Rng) -> (Side, TimeInForce, i64, u64) {
    let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
    let tif = if rng.gen_bool(0.15) { TimeInForce::Ioc } else { TimeInForce::Gtc };
    let price = rng.gen_range(98..=102) * PRICE_SCALE;
    let qty = rng.gen_range(1..200);
    (side, tif, price, qty)
}

#[test]
fn fuzz_best_prices_track_reference() {
    const SEED: u64 = 0xFEED_FACE;
    const OPS: usize = 20_000;

    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut engine = Engine::new();
    let mut reference = ReferenceBook::new();

    let mut next_id = 1u64;
    let mut live: Vec<u64> = Vec::new();

    for op in 0..OPS {
        if live.is_empty() || rng.gen_bool(0.7) {
            let (side, tif, price, qty) = random_order(&mut rng);
            let id = next_id;
            next_id += 1;

            let (_, resting) = engine.place(id, side, tif, price, qty);
            reference.place(id, side, tif, price, qty);
            if resting {
                live.push(id);
            }
        } else {
            let pick = rng.gen_range(0..live.len());
            let id = live.swap_remove(pick);
            let a = engine.cancel(id);
            let b = reference.cancel(id);
            assert_eq!(a, b, "cancel outcome diverged at op {op} for id {id}");
        }

        assert_eq!(
            engine.book.best_bid(),
            reference.best_bid(),
            "best bid diverged at op {op}"
        );
        assert_eq!(
            engine.book.best_ask(),
            reference.best_ask(),
            "best ask diverged at op {op}"
        );
    }
}

#[test]
fn fuzz_order_counts_and_pool_accounting() {
    const SEED: u64 = 0xBAD_C0DE;
    const OPS: usize = 10_000;

    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut engine = Engine::new();
    let mut reference = ReferenceBook::new();

    let mut next_id = 1u64;
    let mut live: Vec<u64> = Vec::new();

    for op in 0..OPS {
        if live.is_empty() || rng.gen_bool(0.6) {
            let (side, tif, price, qty) = random_order(&mut rng);
            let id = next_id;
            next_id += 1;
            let (_, resting) = engine.place(id, side, tif, price, qty);
            reference.place(id, side, tif, price, qty);
            if resting {
                live.push(id);
            }
        } else {
            let pick = rng.gen_range(0..live.len());
            let id = live.swap_remove(pick);
            engine.cancel(id);
            reference.cancel(id);
        }

        if op % 100 == 0 {
            assert_eq!(engine.book.order_count(), reference.order_count(), "op {op}");
            // Every borrowed order node is a resting order, nothing leaks.
            assert_eq!(
                engine.orders.allocated() as usize,
                engine.book.order_count(),
                "pool accounting diverged at op {op}"
            );
        }
    }

    assert_eq!(engine.book.order_count(), reference.order_count());
    assert_eq!(engine.orders.allocated() as usize, engine.book.order_count());
}

#[test]
fn fuzz_traded_volume_matches_reference() {
    const SEED: u64 = 0x1234_5678;
    const OPS: usize = 10_000;

    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut engine = Engine::new();
    let mut reference = ReferenceBook::new();

    let mut engine_traded = 0u64;
    let mut reference_traded = 0u64;

    for i in 0..OPS {
        let (side, tif, price, qty) = random_order(&mut rng);
        let id = i as u64 + 1;
        let (traded, _) = engine.place(id, side, tif, price, qty);
        engine_traded += traded;
        reference_traded += reference.place(id, side, tif, price, qty);
    }

    assert_eq!(engine_traded, reference_traded, "total traded volume diverged");
    assert!(engine_traded > 0, "seeded stream must actually cross");
}
