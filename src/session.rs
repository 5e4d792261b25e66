//! Client sessions, per-session sequencing, and the session registry.
//!
//! The registry is the one structure in the system mutated from more than one
//! thread: the ingress I/O workers register and remove sessions, the egress
//! router resolves them on every outbound event. Logon and disconnect are
//! rare, so a single mutex around the map is plenty.

use crate::protocol::{FRAME_HEADER_SIZE, MAX_FRAME};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// How many times a frame write retries past `WouldBlock` before the frame is
/// dropped. Writes are tiny, so a healthy client never gets close.
const WRITE_SPIN_LIMIT: u32 = 10_000;

/// Write side of a client TCP connection, shared between the ingress worker
/// that owns the read side and the egress router.
pub struct ClientChannel {
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    active: AtomicBool,
}

impl ClientChannel {
    pub fn new(stream: &TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            peer,
            writer: Mutex::new(writer),
            active: AtomicBool::new(true),
        })
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Write a pre-framed message (`[len][type][payload]`).
    pub fn send(&self, frame: &[u8]) -> bool {
        debug_assert!(frame.len() >= FRAME_HEADER_SIZE && frame.len() <= 2 + MAX_FRAME);
        self.write_bytes(frame)
    }

    /// Wrap a transport fragment (`[type][payload]`) in a TCP frame and send.
    pub fn forward(&self, body: &[u8]) -> bool {
        let mut frame = [0u8; 2 + crate::transport::MAX_FRAGMENT];
        if body.is_empty() || body.len() > crate::transport::MAX_FRAGMENT {
            return false;
        }
        frame[..2].copy_from_slice(&(body.len() as u16).to_le_bytes());
        frame[2..2 + body.len()].copy_from_slice(body);
        self.write_bytes(&frame[..2 + body.len()])
    }

    /// Write everything under the channel lock. The socket is non-blocking;
    /// a persistently full send buffer means the frame is dropped rather than
    /// stalling the router.
    fn write_bytes(&self, mut bytes: &[u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        let total = bytes.len();
        let mut writer = self.writer.lock();
        let mut spins = 0u32;
        while !bytes.is_empty() {
            match writer.write(bytes) {
                Ok(0) => {
                    self.deactivate();
                    return false;
                }
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    spins += 1;
                    if spins > WRITE_SPIN_LIMIT {
                        // A half-written frame would desync the client's
                        // stream, so the channel dies with it.
                        if bytes.len() < total {
                            self.deactivate();
                        }
                        debug!(peer = %self.peer, "dropping frame: send buffer full");
                        return false;
                    }
                    std::hint::spin_loop();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "channel write failed");
                    self.deactivate();
                    return false;
                }
            }
        }
        true
    }
}

/// Result of a per-session sequence check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqCheck {
    Accept,
    /// Sequence number at or below the last accepted one.
    Duplicate,
    /// Sequence number skipped ahead.
    Gap,
}

/// Gateway-side state for one logged-on client.
///
/// `session_id` and `client_id` are immutable after logon. `last_seq_no` is
/// written only by the connection's I/O worker; other threads may read it and
/// must observe a monotonically non-decreasing value, hence release/acquire.
pub struct ClientSession {
    pub session_id: u32,
    pub client_id: u64,
    channel: Arc<ClientChannel>,
    last_seq_no: AtomicU64,
}

impl ClientSession {
    fn new(session_id: u32, client_id: u64, channel: Arc<ClientChannel>) -> Self {
        Self {
            session_id,
            client_id,
            channel,
            last_seq_no: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn channel(&self) -> &Arc<ClientChannel> {
        &self.channel
    }

    #[inline]
    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no.load(Ordering::Acquire)
    }

    /// Compare `seq_no` against `last + 1`; only an exact match advances.
    pub fn validate_and_advance(&self, seq_no: u64) -> SeqCheck {
        let expected = self.last_seq_no.load(Ordering::Acquire) + 1;
        if seq_no < expected {
            return SeqCheck::Duplicate;
        }
        if seq_no > expected {
            return SeqCheck::Gap;
        }
        self.last_seq_no.store(seq_no, Ordering::Release);
        SeqCheck::Accept
    }
}

/// Registry of active sessions, keyed by assigned session id.
pub struct SessionRegistry {
    sessions: Mutex<FxHashMap<u32, Arc<ClientSession>>>,
    next_id: AtomicU32,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(FxHashMap::default()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Assign the next session id and register the session.
    pub fn register(&self, client_id: u64, channel: Arc<ClientChannel>) -> Arc<ClientSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ClientSession::new(id, client_id, channel));
        self.sessions.lock().insert(id, session.clone());
        session
    }

    pub fn get(&self, session_id: u32) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    pub fn remove(&self, session_id: u32) {
        self.sessions.lock().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Loopback socket pair; the accepted end is dropped with the listener.
    fn channel() -> Arc<ClientChannel> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let _server = listener.accept().unwrap();
        Arc::new(ClientChannel::new(&client).unwrap())
    }

    #[test]
    fn sequence_validation() {
        let registry = SessionRegistry::new();
        let session = registry.register(42, channel());

        assert_eq!(session.validate_and_advance(1), SeqCheck::Accept);
        assert_eq!(session.validate_and_advance(2), SeqCheck::Accept);
        // Replay and stale values are duplicates; nothing advances.
        assert_eq!(session.validate_and_advance(2), SeqCheck::Duplicate);
        assert_eq!(session.validate_and_advance(1), SeqCheck::Duplicate);
        // Skipping ahead is a gap; nothing advances either.
        assert_eq!(session.validate_and_advance(5), SeqCheck::Gap);
        assert_eq!(session.last_seq_no(), 2);
        // The expected next value still works after a gap.
        assert_eq!(session.validate_and_advance(3), SeqCheck::Accept);
    }

    #[test]
    fn registry_assigns_monotonic_ids() {
        let registry = SessionRegistry::new();
        let a = registry.register(1, channel());
        let b = registry.register(2, channel());
        assert_eq!(a.session_id, 1);
        assert_eq!(b.session_id, 2);
        assert_eq!(registry.len(), 2);

        assert!(registry.get(1).is_some());
        registry.remove(1);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn channel_send_reaches_peer() {
        use std::io::Read;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let ch = ClientChannel::new(&client).unwrap();
        assert!(ch.forward(&[21, 1, 2, 3]));

        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 4);
        assert_eq!(&buf[2..], &[21, 1, 2, 3]);
    }

    #[test]
    fn deactivated_channel_drops_writes() {
        let ch = channel();
        ch.deactivate();
        assert!(!ch.send(&[0, 0, 21]));
    }
}
