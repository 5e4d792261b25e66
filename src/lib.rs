//! # Flash-OMS
//!
//! A partitioned, low-latency order management system for equities order
//! entry: binary TCP gateway, sequenced client sessions, and single-threaded
//! matching engines over arena-allocated limit order books.
//!
//! ## Design Principles
//!
//! - **Single-Writer Partitions**: each engine thread exclusively owns the
//!   books and pools for `instrument_id % partitions` (no locks)
//! - **Arena Allocation**: orders and price levels live in pre-allocated
//!   index-linked pools; the hot path never touches the heap
//! - **Backpressure Everywhere**: full queues reject immediately
//!   (SYSTEM_BUSY) instead of buffering unboundedly
//! - **No Panics In The Hot Path**: every failure is a structured reject or a
//!   logged drop
//!
//! ## Architecture
//!
//! ```text
//! [Clients] --TCP--> [Accept + 2 I/O Workers] --inbound streams--> [Engine Partition 0..P]
//!                          ^                                              |
//!                          |                                              v
//!                    [Egress Router] <--------outbound streams------------+
//! ```

pub mod arena;
pub mod config;
pub mod egress;
pub mod ingress;
pub mod metrics;
pub mod order_book;
pub mod partition;
pub mod price_level;
pub mod protocol;
pub mod server;
pub mod session;
pub mod system;
pub mod transport;

// Re-exports for convenience
pub use arena::{LevelArena, LevelIdx, LevelNode, OrderArena, OrderIdx, OrderNode, NULL_INDEX};
pub use config::OmsConfig;
pub use order_book::{FillEvent, LimitOrderBook, NO_ASK, NO_BID};
pub use partition::EnginePartition;
pub use protocol::{MsgType, RejectReason, Side, TimeInForce, PRICE_SCALE};
pub use session::{SeqCheck, SessionRegistry};
pub use system::Oms;
pub use transport::{Fabric, PublishResult, TransportStream};
