//! Event and request types exchanged between the socket layer and its
//! stages.
//!
//! Payloads are opaque byte ranges. The only structure imposed here is
//! the per-connection sequence number on inbound packets: it starts at
//! 1, increments per packet, and wraps back to 1 — 0 is reserved to
//! mean "unsequenced".

use core::fmt;
use std::sync::Arc;

use crate::sink::EventSink;

/// Stable identifier for a connection.
///
/// Doubles as the registration token handed to the readiness
/// multiplexer, so a ready handle can be traced back to its owning
/// state machine without either side owning the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        ConnId(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Advance a per-connection packet sequence counter.
///
/// 0 is reserved, so the counter wraps from `u64::MAX` to 1.
#[inline]
pub fn next_seq(seq: u64) -> u64 {
    let next = seq.wrapping_add(1);
    if next == 0 {
        1
    } else {
        next
    }
}

/// One completed non-blocking read.
///
/// `buf` may be longer than `len` when the read buffer was handed off
/// wholesale instead of copied; `bytes()` is the valid payload view.
pub struct InPacket {
    pub conn: ConnId,
    pub buf: Vec<u8>,
    pub len: usize,
    pub seq: u64,
}

impl InPacket {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Debug for InPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InPacket")
            .field("conn", &self.conn)
            .field("len", &self.len)
            .field("seq", &self.seq)
            .finish()
    }
}

/// A connection was closed; sent (lossily) to the configured recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosedEvent {
    pub conn: ConnId,
}

/// Events the read path delivers to its completion recipient.
#[derive(Debug)]
pub enum SockEvent {
    Packet(InPacket),
    SinkClosed(SinkClosedEvent),
}

/// Payload to write to a connection. Serviced strictly FIFO, one in
/// flight at a time per connection.
pub struct WriteRequest {
    pub conn: ConnId,
    pub buf: Vec<u8>,
    pub offset: usize,
    pub len: usize,
}

impl WriteRequest {
    /// Write the whole buffer.
    pub fn new(conn: ConnId, buf: Vec<u8>) -> Self {
        let len = buf.len();
        Self {
            conn,
            buf,
            offset: 0,
            len,
        }
    }

    /// Write `len` bytes starting at `offset`.
    pub fn with_range(conn: ConnId, buf: Vec<u8>, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= buf.len());
        Self {
            conn,
            buf,
            offset,
            len,
        }
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("conn", &self.conn)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Request to close a connection. Pending writes queued behind it are
/// abandoned, not flushed; `notify` (if any) receives the
/// [`SinkClosedEvent`].
pub struct CloseRequest {
    pub conn: ConnId,
    pub notify: Option<Arc<dyn EventSink<SockEvent>>>,
}

impl fmt::Debug for CloseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseRequest")
            .field("conn", &self.conn)
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

/// Requests accepted by a connection's write path, matched exhaustively
/// by the state machine.
#[derive(Debug)]
pub enum SockRequest {
    Write(WriteRequest),
    Close(CloseRequest),
}

impl SockRequest {
    #[inline]
    pub fn conn(&self) -> ConnId {
        match self {
            SockRequest::Write(req) => req.conn,
            SockRequest::Close(req) => req.conn,
        }
    }
}
