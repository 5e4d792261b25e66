//! Binary wire protocol codec.
//!
//! Two framings coexist:
//!
//! - TCP frames (client <-> gateway): `[len: u16 LE][type: u8][payload]`
//!   where `len` counts the bytes after the length field (1 + payload).
//! - Transport fragments (gateway <-> engine): `[type: u8][payload]` with
//!   no length prefix; the partition transport delivers whole messages.
//!
//! All multi-byte fields are little-endian. Encoders write into
//! caller-provided buffers and never allocate. Decoders return `None` on
//! short input or unknown enum codes; the caller logs and drops the frame.

/// Prices are stored as `i64 = decimal * PRICE_SCALE`.
pub const PRICE_SCALE: i64 = 1_000_000;

/// TCP frame header: 2-byte length + 1-byte type.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest legal TCP frame body (length field is u16).
pub const MAX_FRAME: usize = 65535;

/// Wire message type codes (1 byte).
///
/// Inbound (client -> gateway): 1..=19. Outbound (gateway -> client): 20..=39.
/// Internal gateway <-> engine messages reuse the same codes; direction is
/// implied by the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Logon = 1,
    NewOrder = 2,
    CancelRequest = 3,
    LogonAck = 20,
    Ack = 21,
    Reject = 22,
    Fill = 23,
    CancelAck = 24,
    Heartbeat = 30,
}

impl MsgType {
    /// Decode a type code. Unknown codes are a soft error.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MsgType::Logon),
            2 => Some(MsgType::NewOrder),
            3 => Some(MsgType::CancelRequest),
            20 => Some(MsgType::LogonAck),
            21 => Some(MsgType::Ack),
            22 => Some(MsgType::Reject),
            23 => Some(MsgType::Fill),
            24 => Some(MsgType::CancelAck),
            30 => Some(MsgType::Heartbeat),
            _ => None,
        }
    }
}

/// Order side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    Buy = 1,
    Sell = 2,
}

impl Side {
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Side::Buy),
            2 => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Time in force.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeInForce {
    /// Good-till-cancel: remainder rests in the book.
    Gtc = 1,
    /// Immediate-or-cancel: remainder is dropped, never rested.
    Ioc = 2,
}

impl TimeInForce {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TimeInForce::Gtc),
            2 => Some(TimeInForce::Ioc),
            _ => None,
        }
    }
}

/// Reject reason codes carried in REJECT payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Unknown = 0,
    DuplicateSeqNo = 1,
    SeqNoGap = 2,
    SystemBusy = 3,
    OrderNotFound = 4,
    InvalidPrice = 5,
    InvalidQty = 6,
    SessionNotLoggedOn = 7,
}

impl RejectReason {
    /// Unknown codes map to `Unknown` rather than failing the frame.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => RejectReason::DuplicateSeqNo,
            2 => RejectReason::SeqNoGap,
            3 => RejectReason::SystemBusy,
            4 => RejectReason::OrderNotFound,
            5 => RejectReason::InvalidPrice,
            6 => RejectReason::InvalidQty,
            7 => RejectReason::SessionNotLoggedOn,
            _ => RejectReason::Unknown,
        }
    }
}

// ============================================================================
// Payload offsets (relative to payload start, after the type byte)
// ============================================================================

/// LOGON: sessionId(4) clientId(8).
pub mod logon {
    pub const SESSION_ID: usize = 0;
    pub const CLIENT_ID: usize = 4;
    pub const SIZE: usize = 12;
}

/// LOGON_ACK: sessionId(4).
pub mod logon_ack {
    pub const SESSION_ID: usize = 0;
    pub const SIZE: usize = 4;
}

/// NEW_ORDER on TCP (client -> gateway).
pub mod nos {
    pub const SESSION_ID: usize = 0;
    pub const CLIENT_ID: usize = 4;
    pub const CLIENT_SEQ_NO: usize = 12;
    pub const INSTRUMENT_ID: usize = 20;
    pub const SIDE: usize = 24;
    pub const TIF: usize = 25;
    pub const PRICE: usize = 26;
    pub const QTY: usize = 34;
    pub const RECV_TS: usize = 42;
    pub const SIZE: usize = 50;
}

/// NEW_ORDER on the partition transport: internalOrderId(8) prepended to the
/// TCP payload, identical thereafter.
pub mod inos {
    pub const INTERNAL_ID: usize = 0;
    pub const SESSION_ID: usize = 8;
    pub const CLIENT_ID: usize = 16;
    pub const CLIENT_SEQ_NO: usize = 24;
    pub const INSTRUMENT_ID: usize = 32;
    pub const SIDE: usize = 36;
    pub const TIF: usize = 37;
    pub const PRICE: usize = 38;
    pub const QTY: usize = 46;
    pub const RECV_TS: usize = 54;
    pub const SIZE: usize = 62;
}

/// CANCEL_REQUEST on the partition transport.
pub mod cancel {
    pub const SESSION_ID: usize = 0;
    pub const CLIENT_SEQ_NO: usize = 4;
    pub const INTERNAL_ID: usize = 12;
    pub const INSTRUMENT_ID: usize = 20;
    pub const SIZE: usize = 24;
}

/// ACK (engine -> client).
pub mod ack {
    pub const INTERNAL_ID: usize = 0;
    pub const CLIENT_SEQ_NO: usize = 8;
    pub const SESSION_ID: usize = 16;
    pub const INSTRUMENT_ID: usize = 20;
    pub const TS: usize = 24;
    pub const SIZE: usize = 32;
}

/// REJECT (gateway or engine -> client).
pub mod reject {
    pub const SESSION_ID: usize = 0;
    pub const CLIENT_SEQ_NO: usize = 4;
    pub const REASON: usize = 12;
    pub const SIZE: usize = 13;
}

/// FILL (engine -> client).
pub mod fill {
    pub const INTERNAL_ID: usize = 0;
    pub const SESSION_ID: usize = 8;
    pub const INSTRUMENT_ID: usize = 12;
    pub const SIDE: usize = 16;
    pub const FILL_PRICE: usize = 17;
    pub const FILL_QTY: usize = 25;
    pub const LEAVES_QTY: usize = 33;
    pub const TS: usize = 41;
    pub const SIZE: usize = 49;
}

/// CANCEL_ACK (engine -> client).
pub mod cancel_ack {
    pub const INTERNAL_ID: usize = 0;
    pub const SESSION_ID: usize = 8;
    pub const SIZE: usize = 12;
}

// ============================================================================
// Little-endian field helpers
// ============================================================================

#[inline]
pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub(crate) fn get_i64(buf: &[u8], off: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(b)
}

// ============================================================================
// Decoded message structs
// ============================================================================

/// LOGON payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Logon {
    pub session_id: u32,
    pub client_id: u64,
}

impl Logon {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < logon::SIZE {
            return None;
        }
        Some(Logon {
            session_id: get_u32(payload, logon::SESSION_ID),
            client_id: get_u64(payload, logon::CLIENT_ID),
        })
    }
}

/// LOGON_ACK payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogonAck {
    pub session_id: u32,
}

impl LogonAck {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < logon_ack::SIZE {
            return None;
        }
        Some(LogonAck {
            session_id: get_u32(payload, logon_ack::SESSION_ID),
        })
    }
}

/// NEW_ORDER as received from the client over TCP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewOrder {
    pub session_id: u32,
    pub client_id: u64,
    pub client_seq_no: u64,
    pub instrument_id: u32,
    pub side: Side,
    pub tif: TimeInForce,
    pub price: i64,
    pub qty: u64,
    pub recv_ts_nanos: i64,
}

impl NewOrder {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < nos::SIZE {
            return None;
        }
        Some(NewOrder {
            session_id: get_u32(payload, nos::SESSION_ID),
            client_id: get_u64(payload, nos::CLIENT_ID),
            client_seq_no: get_u64(payload, nos::CLIENT_SEQ_NO),
            instrument_id: get_u32(payload, nos::INSTRUMENT_ID),
            side: Side::from_code(payload[nos::SIDE])?,
            tif: TimeInForce::from_code(payload[nos::TIF])?,
            price: get_i64(payload, nos::PRICE),
            qty: get_u64(payload, nos::QTY),
            recv_ts_nanos: get_i64(payload, nos::RECV_TS),
        })
    }
}

/// NEW_ORDER as carried gateway -> engine, with the gateway-assigned id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InternalNewOrder {
    pub internal_order_id: u64,
    pub session_id: u32,
    pub client_id: u64,
    pub client_seq_no: u64,
    pub instrument_id: u32,
    pub side: Side,
    pub tif: TimeInForce,
    pub price: i64,
    pub qty: u64,
    pub recv_ts_nanos: i64,
}

impl InternalNewOrder {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < inos::SIZE {
            return None;
        }
        Some(InternalNewOrder {
            internal_order_id: get_u64(payload, inos::INTERNAL_ID),
            session_id: get_u32(payload, inos::SESSION_ID),
            client_id: get_u64(payload, inos::CLIENT_ID),
            client_seq_no: get_u64(payload, inos::CLIENT_SEQ_NO),
            instrument_id: get_u32(payload, inos::INSTRUMENT_ID),
            side: Side::from_code(payload[inos::SIDE])?,
            tif: TimeInForce::from_code(payload[inos::TIF])?,
            price: get_i64(payload, inos::PRICE),
            qty: get_u64(payload, inos::QTY),
            recv_ts_nanos: get_i64(payload, inos::RECV_TS),
        })
    }
}

/// CANCEL_REQUEST as carried gateway -> engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CancelRequest {
    pub session_id: u32,
    pub client_seq_no: u64,
    pub internal_order_id: u64,
    pub instrument_id: u32,
}

impl CancelRequest {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < cancel::SIZE {
            return None;
        }
        Some(CancelRequest {
            session_id: get_u32(payload, cancel::SESSION_ID),
            client_seq_no: get_u64(payload, cancel::CLIENT_SEQ_NO),
            internal_order_id: get_u64(payload, cancel::INTERNAL_ID),
            instrument_id: get_u32(payload, cancel::INSTRUMENT_ID),
        })
    }
}

/// ACK payload (engine -> client).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub internal_order_id: u64,
    pub client_seq_no: u64,
    pub session_id: u32,
    pub instrument_id: u32,
    pub ts_nanos: i64,
}

impl Ack {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < ack::SIZE {
            return None;
        }
        Some(Ack {
            internal_order_id: get_u64(payload, ack::INTERNAL_ID),
            client_seq_no: get_u64(payload, ack::CLIENT_SEQ_NO),
            session_id: get_u32(payload, ack::SESSION_ID),
            instrument_id: get_u32(payload, ack::INSTRUMENT_ID),
            ts_nanos: get_i64(payload, ack::TS),
        })
    }
}

/// REJECT payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reject {
    pub session_id: u32,
    pub client_seq_no: u64,
    pub reason: RejectReason,
}

impl Reject {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < reject::SIZE {
            return None;
        }
        Some(Reject {
            session_id: get_u32(payload, reject::SESSION_ID),
            client_seq_no: get_u64(payload, reject::CLIENT_SEQ_NO),
            reason: RejectReason::from_code(payload[reject::REASON]),
        })
    }
}

/// FILL payload. `side` is the side of the party the fill is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fill {
    pub internal_order_id: u64,
    pub session_id: u32,
    pub instrument_id: u32,
    pub side: Side,
    pub fill_price: i64,
    pub fill_qty: u64,
    pub leaves_qty: u64,
    pub ts_nanos: i64,
}

impl Fill {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < fill::SIZE {
            return None;
        }
        Some(Fill {
            internal_order_id: get_u64(payload, fill::INTERNAL_ID),
            session_id: get_u32(payload, fill::SESSION_ID),
            instrument_id: get_u32(payload, fill::INSTRUMENT_ID),
            side: Side::from_code(payload[fill::SIDE])?,
            fill_price: get_i64(payload, fill::FILL_PRICE),
            fill_qty: get_u64(payload, fill::FILL_QTY),
            leaves_qty: get_u64(payload, fill::LEAVES_QTY),
            ts_nanos: get_i64(payload, fill::TS),
        })
    }
}

/// CANCEL_ACK payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CancelAck {
    pub internal_order_id: u64,
    pub session_id: u32,
}

impl CancelAck {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < cancel_ack::SIZE {
            return None;
        }
        Some(CancelAck {
            internal_order_id: get_u64(payload, cancel_ack::INTERNAL_ID),
            session_id: get_u32(payload, cancel_ack::SESSION_ID),
        })
    }
}

// ============================================================================
// Transport-form encoders: [type: u8][payload], return total length
// ============================================================================

pub fn encode_internal_new_order(buf: &mut [u8], m: &InternalNewOrder) -> usize {
    buf[0] = MsgType::NewOrder as u8;
    let p = &mut buf[1..];
    put_u64(p, inos::INTERNAL_ID, m.internal_order_id);
    put_u32(p, inos::SESSION_ID, m.session_id);
    put_u64(p, inos::CLIENT_ID, m.client_id);
    put_u64(p, inos::CLIENT_SEQ_NO, m.client_seq_no);
    put_u32(p, inos::INSTRUMENT_ID, m.instrument_id);
    p[inos::SIDE] = m.side as u8;
    p[inos::TIF] = m.tif as u8;
    put_i64(p, inos::PRICE, m.price);
    put_u64(p, inos::QTY, m.qty);
    put_i64(p, inos::RECV_TS, m.recv_ts_nanos);
    1 + inos::SIZE
}

pub fn encode_internal_cancel(buf: &mut [u8], m: &CancelRequest) -> usize {
    buf[0] = MsgType::CancelRequest as u8;
    let p = &mut buf[1..];
    put_u32(p, cancel::SESSION_ID, m.session_id);
    put_u64(p, cancel::CLIENT_SEQ_NO, m.client_seq_no);
    put_u64(p, cancel::INTERNAL_ID, m.internal_order_id);
    put_u32(p, cancel::INSTRUMENT_ID, m.instrument_id);
    1 + cancel::SIZE
}

pub fn encode_ack(buf: &mut [u8], m: &Ack) -> usize {
    buf[0] = MsgType::Ack as u8;
    let p = &mut buf[1..];
    put_u64(p, ack::INTERNAL_ID, m.internal_order_id);
    put_u64(p, ack::CLIENT_SEQ_NO, m.client_seq_no);
    put_u32(p, ack::SESSION_ID, m.session_id);
    put_u32(p, ack::INSTRUMENT_ID, m.instrument_id);
    put_i64(p, ack::TS, m.ts_nanos);
    1 + ack::SIZE
}

pub fn encode_reject(buf: &mut [u8], session_id: u32, client_seq_no: u64, reason: RejectReason) -> usize {
    buf[0] = MsgType::Reject as u8;
    let p = &mut buf[1..];
    put_u32(p, reject::SESSION_ID, session_id);
    put_u64(p, reject::CLIENT_SEQ_NO, client_seq_no);
    p[reject::REASON] = reason as u8;
    1 + reject::SIZE
}

pub fn encode_fill(buf: &mut [u8], m: &Fill) -> usize {
    buf[0] = MsgType::Fill as u8;
    let p = &mut buf[1..];
    put_u64(p, fill::INTERNAL_ID, m.internal_order_id);
    put_u32(p, fill::SESSION_ID, m.session_id);
    put_u32(p, fill::INSTRUMENT_ID, m.instrument_id);
    p[fill::SIDE] = m.side as u8;
    put_i64(p, fill::FILL_PRICE, m.fill_price);
    put_u64(p, fill::FILL_QTY, m.fill_qty);
    put_u64(p, fill::LEAVES_QTY, m.leaves_qty);
    put_i64(p, fill::TS, m.ts_nanos);
    1 + fill::SIZE
}

pub fn encode_cancel_ack(buf: &mut [u8], internal_order_id: u64, session_id: u32) -> usize {
    buf[0] = MsgType::CancelAck as u8;
    let p = &mut buf[1..];
    put_u64(p, cancel_ack::INTERNAL_ID, internal_order_id);
    put_u32(p, cancel_ack::SESSION_ID, session_id);
    1 + cancel_ack::SIZE
}

/// Session id of the addressee, read at the type-specific offset.
///
/// Used by the egress router to pick the client channel without a full decode.
pub fn outbound_session_id(ty: MsgType, payload: &[u8]) -> Option<u32> {
    let off = match ty {
        MsgType::Ack => ack::SESSION_ID,
        MsgType::Fill => fill::SESSION_ID,
        MsgType::Reject => reject::SESSION_ID,
        MsgType::CancelAck => cancel_ack::SESSION_ID,
        _ => return None,
    };
    if payload.len() < off + 4 {
        return None;
    }
    Some(get_u32(payload, off))
}

// ============================================================================
// TCP-frame encoders: [len: u16][type: u8][payload], return total length
// ============================================================================

/// Write the 3-byte frame header. `len` = 1 (type) + payload size.
pub fn write_frame_header(buf: &mut [u8], ty: MsgType, payload_size: usize) {
    put_u16(buf, 0, (1 + payload_size) as u16);
    buf[2] = ty as u8;
}

pub fn frame_logon(buf: &mut [u8], session_id: u32, client_id: u64) -> usize {
    write_frame_header(buf, MsgType::Logon, logon::SIZE);
    let p = &mut buf[FRAME_HEADER_SIZE..];
    put_u32(p, logon::SESSION_ID, session_id);
    put_u64(p, logon::CLIENT_ID, client_id);
    FRAME_HEADER_SIZE + logon::SIZE
}

pub fn frame_logon_ack(buf: &mut [u8], session_id: u32) -> usize {
    write_frame_header(buf, MsgType::LogonAck, logon_ack::SIZE);
    put_u32(&mut buf[FRAME_HEADER_SIZE..], logon_ack::SESSION_ID, session_id);
    FRAME_HEADER_SIZE + logon_ack::SIZE
}

pub fn frame_new_order(buf: &mut [u8], m: &NewOrder) -> usize {
    write_frame_header(buf, MsgType::NewOrder, nos::SIZE);
    let p = &mut buf[FRAME_HEADER_SIZE..];
    put_u32(p, nos::SESSION_ID, m.session_id);
    put_u64(p, nos::CLIENT_ID, m.client_id);
    put_u64(p, nos::CLIENT_SEQ_NO, m.client_seq_no);
    put_u32(p, nos::INSTRUMENT_ID, m.instrument_id);
    p[nos::SIDE] = m.side as u8;
    p[nos::TIF] = m.tif as u8;
    put_i64(p, nos::PRICE, m.price);
    put_u64(p, nos::QTY, m.qty);
    put_i64(p, nos::RECV_TS, m.recv_ts_nanos);
    FRAME_HEADER_SIZE + nos::SIZE
}

pub fn frame_cancel_request(buf: &mut [u8], m: &CancelRequest) -> usize {
    write_frame_header(buf, MsgType::CancelRequest, cancel::SIZE);
    let p = &mut buf[FRAME_HEADER_SIZE..];
    put_u32(p, cancel::SESSION_ID, m.session_id);
    put_u64(p, cancel::CLIENT_SEQ_NO, m.client_seq_no);
    put_u64(p, cancel::INTERNAL_ID, m.internal_order_id);
    put_u32(p, cancel::INSTRUMENT_ID, m.instrument_id);
    FRAME_HEADER_SIZE + cancel::SIZE
}

pub fn frame_reject(buf: &mut [u8], session_id: u32, client_seq_no: u64, reason: RejectReason) -> usize {
    write_frame_header(buf, MsgType::Reject, reject::SIZE);
    let p = &mut buf[FRAME_HEADER_SIZE..];
    put_u32(p, reject::SESSION_ID, session_id);
    put_u64(p, reject::CLIENT_SEQ_NO, client_seq_no);
    p[reject::REASON] = reason as u8;
    FRAME_HEADER_SIZE + reject::SIZE
}

pub fn frame_heartbeat(buf: &mut [u8]) -> usize {
    write_frame_header(buf, MsgType::Heartbeat, 0);
    FRAME_HEADER_SIZE
}
