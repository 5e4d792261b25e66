//! Gateway ingress: per-connection protocol state machine.
//!
//! Each TCP connection is owned by exactly one I/O worker and carries a small
//! state machine: unauthenticated until a LOGON registers a session, then
//! order flow until the socket closes. Frames are reassembled from the
//! non-blocking byte stream using the 2-byte length prefix.
//!
//! NEW_ORDER processing is where the gateway earns its keep: sequence
//! validation, price/qty validation, internal order id assignment, and fanout
//! to the owning partition. Backpressure from the partition stream becomes an
//! immediate SYSTEM_BUSY reject - the gateway never queues.

use crate::protocol::{
    self, encode_internal_cancel, encode_internal_new_order, frame_logon_ack, frame_reject,
    CancelRequest, InternalNewOrder, Logon, MsgType, NewOrder, RejectReason,
};
use crate::metrics::nanos_now;
use crate::session::{ClientChannel, ClientSession, SeqCheck, SessionRegistry};
use crate::transport::{partition_for, Fabric, PublishResult};
use socket2::SockRef;
use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Read chunk per socket per poll sweep.
const READ_CHUNK: usize = 4096;

/// Gateway-wide shared state handed to every connection.
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    fabric: Arc<Fabric>,
    order_ids: AtomicU64,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>, fabric: Arc<Fabric>) -> Self {
        Self {
            registry,
            fabric,
            order_ids: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[inline]
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Globally unique, monotonic internal order id.
    #[inline]
    pub fn next_order_id(&self) -> u64 {
        self.order_ids.fetch_add(1, Ordering::Relaxed)
    }
}

/// Whether a connection survives a poll sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnStatus {
    Open,
    Closed,
}

/// One client TCP connection and its reassembly buffer.
pub struct Conn {
    stream: TcpStream,
    channel: Arc<ClientChannel>,
    session: Option<Arc<ClientSession>>,
    buf: Vec<u8>,
}

impl Conn {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        // std::net exposes no keepalive knob; go through socket2 for it.
        SockRef::from(&stream).set_keepalive(true)?;
        let channel = Arc::new(ClientChannel::new(&stream)?);
        Ok(Self {
            stream,
            channel,
            session: None,
            buf: Vec::with_capacity(8192),
        })
    }

    pub fn channel(&self) -> &Arc<ClientChannel> {
        &self.channel
    }

    pub fn session(&self) -> Option<&Arc<ClientSession>> {
        self.session.as_ref()
    }

    /// Drain the socket and process every complete frame.
    pub fn poll(&mut self, gw: &Gateway) -> ConnStatus {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return ConnStatus::Closed,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.channel.peer(), error = %e, "read failed");
                    return ConnStatus::Closed;
                }
            }
        }
        self.process_frames(gw);
        ConnStatus::Open
    }

    /// Tear-down when the socket closes: the session leaves the registry and
    /// any in-flight engine replies for it are dropped by the egress router.
    pub fn on_disconnect(&mut self, gw: &Gateway) {
        self.channel.deactivate();
        if let Some(session) = self.session.take() {
            gw.registry.remove(session.session_id);
            info!(session = session.session_id, "session disconnected");
        }
    }

    fn process_frames(&mut self, gw: &Gateway) {
        // Temporarily take the buffer so frame payloads can borrow it while
        // the handlers borrow `self`.
        let buf = std::mem::take(&mut self.buf);
        let mut consumed = 0;

        while buf.len() - consumed >= 2 {
            let frame_len = protocol::get_u16(&buf, consumed) as usize;
            if frame_len == 0 {
                warn!(peer = %self.channel.peer(), "zero-length frame, skipping header");
                consumed += 2;
                continue;
            }
            if buf.len() - consumed < 2 + frame_len {
                break; // incomplete frame, wait for more bytes
            }
            let code = buf[consumed + 2];
            let payload = &buf[consumed + 3..consumed + 2 + frame_len];
            self.handle_frame(gw, code, payload);
            consumed += 2 + frame_len;
        }

        self.buf = buf;
        self.buf.drain(..consumed);
    }

    fn handle_frame(&mut self, gw: &Gateway, code: u8, payload: &[u8]) {
        match MsgType::from_code(code) {
            Some(MsgType::Logon) => self.on_logon(gw, payload),
            Some(MsgType::NewOrder) => self.on_new_order(gw, payload),
            Some(MsgType::CancelRequest) => self.on_cancel(gw, payload),
            Some(MsgType::Heartbeat) => {} // keep-alive only
            Some(other) => {
                warn!(peer = %self.channel.peer(), ?other, "unhandled message type");
            }
            None => {
                warn!(peer = %self.channel.peer(), code, "unknown message type, dropping frame");
            }
        }
    }

    fn on_logon(&mut self, gw: &Gateway, payload: &[u8]) {
        let Some(m) = Logon::decode(payload) else {
            warn!(peer = %self.channel.peer(), "short LOGON payload");
            return;
        };
        if self.session.is_some() {
            warn!(peer = %self.channel.peer(), "duplicate logon ignored");
            return;
        }

        let session = gw.registry.register(m.client_id, Arc::clone(&self.channel));
        info!(
            session = session.session_id,
            client = m.client_id,
            peer = %self.channel.peer(),
            "client logged on"
        );

        let mut buf = [0u8; 16];
        let len = frame_logon_ack(&mut buf, session.session_id);
        self.channel.send(&buf[..len]);
        self.session = Some(session);
    }

    fn on_new_order(&mut self, gw: &Gateway, payload: &[u8]) {
        let Some(session) = self.session.as_ref() else {
            self.send_reject(0, 0, RejectReason::SessionNotLoggedOn);
            return;
        };
        let Some(m) = NewOrder::decode(payload) else {
            warn!(peer = %self.channel.peer(), "bad NEW_ORDER payload, dropping");
            return;
        };

        // Sequence first: a violated sequence consumes nothing.
        match session.validate_and_advance(m.client_seq_no) {
            SeqCheck::Accept => {}
            SeqCheck::Duplicate => {
                self.send_reject(session.session_id, m.client_seq_no, RejectReason::DuplicateSeqNo);
                return;
            }
            SeqCheck::Gap => {
                self.send_reject(session.session_id, m.client_seq_no, RejectReason::SeqNoGap);
                return;
            }
        }

        // The book assumes validated input; bad values stop here.
        if m.qty == 0 {
            self.send_reject(session.session_id, m.client_seq_no, RejectReason::InvalidQty);
            return;
        }
        if m.price <= 0 {
            self.send_reject(session.session_id, m.client_seq_no, RejectReason::InvalidPrice);
            return;
        }

        let internal = InternalNewOrder {
            internal_order_id: gw.next_order_id(),
            session_id: session.session_id,
            client_id: session.client_id,
            client_seq_no: m.client_seq_no,
            instrument_id: m.instrument_id,
            side: m.side,
            tif: m.tif,
            price: m.price,
            qty: m.qty,
            recv_ts_nanos: nanos_now(),
        };

        let partition = partition_for(m.instrument_id, gw.fabric.partitions());
        let mut buf = [0u8; 64];
        let len = encode_internal_new_order(&mut buf, &internal);

        match gw.fabric.inbound(partition).publish(&buf[..len]) {
            PublishResult::Ok => {}
            PublishResult::Backpressured | PublishResult::AdminBlocked => {
                warn!(partition, "inbound backpressure, rejecting order");
                self.send_reject(session.session_id, m.client_seq_no, RejectReason::SystemBusy);
            }
            PublishResult::Failed => {
                warn!(partition, "inbound publish failed, rejecting order");
                self.send_reject(session.session_id, m.client_seq_no, RejectReason::SystemBusy);
            }
        }
    }

    fn on_cancel(&mut self, gw: &Gateway, payload: &[u8]) {
        // A cancel before logon has nowhere to route; drop it quietly.
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(m) = CancelRequest::decode(payload) else {
            warn!(peer = %self.channel.peer(), "bad CANCEL_REQUEST payload, dropping");
            return;
        };

        let internal = CancelRequest {
            session_id: session.session_id, // trust the session, not the echo
            client_seq_no: m.client_seq_no,
            internal_order_id: m.internal_order_id,
            instrument_id: m.instrument_id,
        };

        let partition = partition_for(m.instrument_id, gw.fabric.partitions());
        let mut buf = [0u8; 32];
        let len = encode_internal_cancel(&mut buf, &internal);
        let result = gw.fabric.inbound(partition).publish(&buf[..len]);
        if result != PublishResult::Ok {
            warn!(partition, ?result, "cancel publish not accepted");
        }
    }

    fn send_reject(&self, session_id: u32, client_seq_no: u64, reason: RejectReason) {
        let mut buf = [0u8; 32];
        let len = frame_reject(&mut buf, session_id, client_seq_no, reason);
        self.channel.send(&buf[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{frame_new_order, LogonAck, Reject, Side, TimeInForce};
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Duration;

    struct Harness {
        gw: Gateway,
        conn: Conn,
        client: TcpStream,
    }

    fn harness(partitions: u32, queue_capacity: usize) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let (server, _) = listener.accept().unwrap();

        nanos_now(); // warm the clock so receive timestamps are nonzero

        let registry = Arc::new(SessionRegistry::new());
        let fabric = Arc::new(Fabric::new(partitions, 1000, 2000, queue_capacity));
        Harness {
            gw: Gateway::new(registry, fabric),
            conn: Conn::new(server).unwrap(),
            client,
        }
    }

    /// Poll the connection until the client bytes have been consumed.
    fn pump(h: &mut Harness) {
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(1));
            h.conn.poll(&h.gw);
        }
    }

    fn read_frame(client: &mut TcpStream) -> (MsgType, Vec<u8>) {
        use std::io::Read;
        let mut header = [0u8; 2];
        client.read_exact(&mut header).unwrap();
        let len = u16::from_le_bytes(header) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).unwrap();
        (MsgType::from_code(body[0]).unwrap(), body[1..].to_vec())
    }

    fn logon(h: &mut Harness, client_id: u64) -> u32 {
        let mut buf = [0u8; 32];
        let len = crate::protocol::frame_logon(&mut buf, 0, client_id);
        h.client.write_all(&buf[..len]).unwrap();
        pump(h);
        let (ty, payload) = read_frame(&mut h.client);
        assert_eq!(ty, MsgType::LogonAck);
        LogonAck::decode(&payload).unwrap().session_id
    }

    fn send_order(h: &mut Harness, seq: u64, instrument: u32, price: i64, qty: u64) {
        let m = NewOrder {
            session_id: 0,
            client_id: 0,
            client_seq_no: seq,
            instrument_id: instrument,
            side: Side::Buy,
            tif: TimeInForce::Gtc,
            price,
            qty,
            recv_ts_nanos: 0,
        };
        let mut buf = [0u8; 64];
        let len = frame_new_order(&mut buf, &m);
        h.client.write_all(&buf[..len]).unwrap();
        pump(h);
    }

    #[test]
    fn connection_sets_socket_options() {
        let h = harness(1, 64);
        assert!(h.conn.stream.nodelay().unwrap());
        assert!(SockRef::from(&h.conn.stream).keepalive().unwrap());
    }

    #[test]
    fn logon_registers_and_acks() {
        let mut h = harness(4, 64);
        let sid = logon(&mut h, 42);
        assert_eq!(sid, 1);
        let session = h.gw.registry().get(1).unwrap();
        assert_eq!(session.client_id, 42);
    }

    #[test]
    fn order_before_logon_is_rejected() {
        let mut h = harness(4, 64);
        send_order(&mut h, 1, 7, 100, 10);
        let (ty, payload) = read_frame(&mut h.client);
        assert_eq!(ty, MsgType::Reject);
        assert_eq!(
            Reject::decode(&payload).unwrap().reason,
            RejectReason::SessionNotLoggedOn
        );
    }

    #[test]
    fn valid_order_reaches_its_partition() {
        let mut h = harness(4, 64);
        let sid = logon(&mut h, 42);
        send_order(&mut h, 1, 6, 100, 10); // 6 % 4 == partition 2

        let mut fragments = Vec::new();
        h.gw.fabric().inbound(2).poll(16, |b| fragments.push(b.to_vec()));
        assert_eq!(fragments.len(), 1);

        let m = InternalNewOrder::decode(&fragments[0][1..]).unwrap();
        assert_eq!(m.internal_order_id, 1, "first gateway-assigned id");
        assert_eq!(m.session_id, sid);
        assert_eq!(m.client_id, 42);
        assert_eq!(m.instrument_id, 6);
        assert!(m.recv_ts_nanos > 0, "gateway stamps receive time");

        // Other partitions saw nothing.
        for p in [0u32, 1, 3] {
            assert_eq!(h.gw.fabric().inbound(p).len(), 0);
        }
    }

    #[test]
    fn sequence_violations_reject_without_advancing() {
        let mut h = harness(1, 64);
        logon(&mut h, 1);

        send_order(&mut h, 1, 0, 100, 10); // accepted
        send_order(&mut h, 1, 0, 100, 10); // duplicate
        let (ty, payload) = read_frame(&mut h.client);
        assert_eq!(ty, MsgType::Reject);
        assert_eq!(Reject::decode(&payload).unwrap().reason, RejectReason::DuplicateSeqNo);

        send_order(&mut h, 5, 0, 100, 10); // gap
        let (_, payload) = read_frame(&mut h.client);
        assert_eq!(Reject::decode(&payload).unwrap().reason, RejectReason::SeqNoGap);

        // seq 2 is still the expected next value
        send_order(&mut h, 2, 0, 100, 10);
        assert_eq!(h.gw.fabric().inbound(0).len(), 2);
    }

    #[test]
    fn invalid_qty_and_price_are_rejected() {
        let mut h = harness(1, 64);
        logon(&mut h, 1);

        send_order(&mut h, 1, 0, 100, 0);
        let (_, payload) = read_frame(&mut h.client);
        assert_eq!(Reject::decode(&payload).unwrap().reason, RejectReason::InvalidQty);

        send_order(&mut h, 2, 0, 0, 10);
        let (_, payload) = read_frame(&mut h.client);
        assert_eq!(Reject::decode(&payload).unwrap().reason, RejectReason::InvalidPrice);

        assert_eq!(h.gw.fabric().inbound(0).len(), 0, "nothing was forwarded");
    }

    #[test]
    fn backpressure_turns_into_system_busy() {
        let mut h = harness(1, 1); // inbound queue of one
        logon(&mut h, 1);

        send_order(&mut h, 1, 0, 100, 10); // fills the queue
        send_order(&mut h, 2, 0, 100, 10); // backpressured
        let (ty, payload) = read_frame(&mut h.client);
        assert_eq!(ty, MsgType::Reject);
        assert_eq!(Reject::decode(&payload).unwrap().reason, RejectReason::SystemBusy);
    }

    #[test]
    fn split_frames_reassemble() {
        let mut h = harness(1, 64);
        logon(&mut h, 1);

        let m = NewOrder {
            session_id: 0,
            client_id: 0,
            client_seq_no: 1,
            instrument_id: 0,
            side: Side::Buy,
            tif: TimeInForce::Gtc,
            price: 100,
            qty: 10,
            recv_ts_nanos: 0,
        };
        let mut buf = [0u8; 64];
        let len = frame_new_order(&mut buf, &m);

        // Drip the frame a few bytes at a time.
        for chunk in buf[..len].chunks(7) {
            h.client.write_all(chunk).unwrap();
            h.conn.poll(&h.gw);
            std::thread::sleep(Duration::from_millis(2));
        }
        pump(&mut h);
        assert_eq!(h.gw.fabric().inbound(0).len(), 1);
    }

    #[test]
    fn unknown_frame_type_is_skipped() {
        let mut h = harness(1, 64);
        logon(&mut h, 1);

        // Unknown type 99 with a 3-byte payload, then a valid order.
        h.client.write_all(&[4, 0, 99, 1, 2, 3]).unwrap();
        send_order(&mut h, 1, 0, 100, 10);
        assert_eq!(h.gw.fabric().inbound(0).len(), 1);
    }

    #[test]
    fn disconnect_removes_session() {
        let mut h = harness(1, 64);
        logon(&mut h, 1);
        assert_eq!(h.gw.registry().len(), 1);

        h.client.shutdown(std::net::Shutdown::Both).unwrap();
        // Poll until the reader observes EOF.
        for _ in 0..200 {
            if h.conn.poll(&h.gw) == ConnStatus::Closed {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        h.conn.on_disconnect(&h.gw);
        assert_eq!(h.gw.registry().len(), 0);
    }
}
