//! Per-connection state machine.
//!
//! A [`SockState`] owns one socket and drives everything that can
//! happen to it under partial I/O: non-blocking reads delivered to a
//! completion sink (with a single-slot clog buffer when the sink is
//! full), strictly-FIFO write servicing with a per-call chunk cap, the
//! write-readiness mask kept exactly in step with outstanding write
//! work, and an idempotent close.
//!
//! Concurrency: `close`, `add_write_request`, and the read path are the
//! only writers of a connection's mutable state and serialize on one
//! internal mutex. A close racing a write submission resolves to either
//! a clean rejection or a clean enqueue-then-discard, never a torn
//! queue.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sedge_core::{
    ndebug, next_seq, nwarn, ConnId, EventSink, InPacket, SinkClosedEvent, SinkError, SockEvent,
    SockRequest, WriteRequest,
};

use crate::config::NioConfig;
use crate::error::{SourceResult, WriteError};
use crate::select::{Interest, ReadySource};

/// Outcome of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer (n > 0).
    Data(usize),
    /// Nothing to read right now — a spurious readiness wake-up.
    WouldBlock,
    /// EOF or I/O failure; the socket is dead.
    Closed,
}

/// Outcome of one non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `n` bytes were accepted by the socket (possibly fewer than
    /// offered).
    Wrote(usize),
    /// The socket cannot accept data right now.
    WouldBlock,
    /// I/O failure; the socket is dead.
    Closed,
}

/// Non-blocking socket seam used by the state machine.
///
/// The production implementation is [`TcpSock`]; tests drive the state
/// machine with scripted doubles.
pub trait SockIo: Send {
    fn raw_fd(&self) -> RawFd;
    fn nb_read(&mut self, buf: &mut [u8]) -> ReadOutcome;
    fn nb_write(&mut self, buf: &[u8]) -> WriteOutcome;
    /// Release the socket. Close-time I/O errors are ignored.
    fn close(&mut self);
}

/// [`SockIo`] over a non-blocking [`TcpStream`].
pub struct TcpSock {
    stream: Option<TcpStream>,
    fd: RawFd,
}

impl TcpSock {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(Self {
            stream: Some(stream),
            fd,
        })
    }
}

impl SockIo for TcpSock {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn nb_read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let Some(stream) = &mut self.stream else {
            return ReadOutcome::Closed;
        };
        match stream.read(buf) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => ReadOutcome::Data(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                ReadOutcome::WouldBlock
            }
            Err(_) => ReadOutcome::Closed,
        }
    }

    fn nb_write(&mut self, buf: &[u8]) -> WriteOutcome {
        let Some(stream) = &mut self.stream else {
            return WriteOutcome::Closed;
        };
        match stream.write(buf) {
            Ok(n) => WriteOutcome::Wrote(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                WriteOutcome::WouldBlock
            }
            Err(_) => WriteOutcome::Closed,
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// The write currently in flight: head of the FIFO, loaded by
/// `init_write`.
struct CurWrite {
    buf: Vec<u8>,
    offset: usize,
    target: usize,
}

enum TryWrite {
    Complete,
    Partial,
    Failed,
}

struct SockInner {
    id: ConnId,
    sock: Box<dyn SockIo>,
    fd: RawFd,
    closed: bool,

    // read path
    read_source: Option<Arc<dyn ReadySource>>,
    read_sink: Option<Arc<dyn EventSink<SockEvent>>>,
    read_buf: Vec<u8>,
    read_buf_size: usize,
    read_buffer_copy: bool,
    read_clog_tries: i32,
    seq: u64,
    clogged: Option<InPacket>,
    clog_tries: i32,

    // write path
    write_source: Option<Arc<dyn ReadySource>>,
    write_queue: VecDeque<SockRequest>,
    outstanding_writes: usize,
    cur: Option<CurWrite>,
    write_clog_threshold: i64,
    max_write_len: i64,
}

impl SockInner {
    fn write_mask_enable(&mut self) {
        if let Some(src) = &self.write_source {
            if let Err(e) = src.update(self.fd, Interest::WRITE) {
                nwarn!("{}: write mask enable failed: {}", self.id, e);
            }
        }
    }

    fn write_mask_disable(&mut self) {
        if let Some(src) = &self.write_source {
            if let Err(e) = src.update(self.fd, Interest::NONE) {
                nwarn!("{}: write mask disable failed: {}", self.id, e);
            }
        }
    }

    /// Load the in-flight write from the head of the FIFO.
    fn init_write(&mut self, req: WriteRequest) {
        self.cur = Some(CurWrite {
            target: req.offset + req.len,
            offset: req.offset,
            buf: req.buf,
        });
    }

    /// One non-blocking write attempt against the in-flight request,
    /// capped at `max_write_len` bytes per call. A failed socket closes
    /// the connection here and reports `Failed` to the caller.
    fn try_write(&mut self) -> TryWrite {
        let Some(cur) = &mut self.cur else {
            return TryWrite::Complete;
        };
        let remaining = cur.target - cur.offset;
        let chunk = if self.max_write_len < 0 {
            remaining
        } else {
            remaining.min(self.max_write_len as usize)
        };
        match self.sock.nb_write(&cur.buf[cur.offset..cur.offset + chunk]) {
            WriteOutcome::Wrote(n) => {
                cur.offset += n;
                if cur.offset == cur.target {
                    TryWrite::Complete
                } else {
                    TryWrite::Partial
                }
            }
            WriteOutcome::WouldBlock => TryWrite::Partial,
            WriteOutcome::Closed => {
                self.close_locked(None);
                TryWrite::Failed
            }
        }
    }

    fn clear_read_pending(&self) {
        if let Some(src) = &self.read_source {
            src.clear_pending(self.fd, Interest::READ);
        }
    }

    fn clear_write_pending(&self) {
        if let Some(src) = &self.write_source {
            src.clear_pending(self.fd, Interest::WRITE);
        }
    }

    /// The one true close. Monotonic: once `closed` is set nothing here
    /// runs again.
    fn close_locked(&mut self, notify: Option<&Arc<dyn EventSink<SockEvent>>>) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(src) = self.read_source.take() {
            let _ = src.deregister(self.fd);
        }
        if let Some(src) = self.write_source.take() {
            let _ = src.deregister(self.fd);
        }

        // In-flight and queued writes are abandoned, not flushed.
        self.write_queue.clear();
        self.cur = None;
        self.outstanding_writes = 0;
        self.clogged = None;

        self.sock.close();

        if let Some(sink) = notify {
            sink.enqueue_lossy(SockEvent::SinkClosed(SinkClosedEvent { conn: self.id }));
        }
        ndebug!("{}: closed", self.id);
    }
}

/// State of one active socket connection.
pub struct SockState {
    id: ConnId,
    inner: Mutex<SockInner>,
}

impl SockState {
    pub fn new(id: ConnId, sock: Box<dyn SockIo>, cfg: &NioConfig) -> Self {
        let fd = sock.raw_fd();
        Self {
            id,
            inner: Mutex::new(SockInner {
                id,
                sock,
                fd,
                closed: false,
                read_source: None,
                read_sink: None,
                read_buf: vec![0; cfg.read_buffer_size],
                read_buf_size: cfg.read_buffer_size,
                read_buffer_copy: cfg.read_buffer_copy,
                read_clog_tries: cfg.read_clog_tries,
                seq: 1,
                clogged: None,
                clog_tries: 0,
                write_source: None,
                write_queue: VecDeque::new(),
                outstanding_writes: 0,
                cur: None,
                write_clog_threshold: cfg.write_clog_threshold,
                max_write_len: cfg.max_write_len,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Outstanding write requests (queued + in flight).
    pub fn outstanding_writes(&self) -> usize {
        self.lock().outstanding_writes
    }

    fn lock(&self) -> MutexGuard<'_, SockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the read path: remember the completion sink and register
    /// read interest with the multiplexer. No-op on an already-closed
    /// connection (it may have been closed before the stage got to it).
    pub fn read_init(
        &self,
        source: &Arc<dyn ReadySource>,
        sink: &Arc<dyn EventSink<SockEvent>>,
    ) -> SourceResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        source.register(inner.fd, Interest::READ, self.id)?;
        inner.read_source = Some(Arc::clone(source));
        inner.read_sink = Some(Arc::clone(sink));
        Ok(())
    }

    /// Process one read-readiness event.
    ///
    /// Order matters: a buffered clogged event is drained before any new
    /// read is attempted, so at most one clogged event exists at a time
    /// and delivery order is preserved.
    pub fn do_read(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        // Stale readiness events can arrive after close.
        if inner.closed {
            return;
        }
        let Some(sink) = inner.read_sink.clone() else {
            return;
        };

        if let Some(pkt) = inner.clogged.take() {
            match sink.enqueue(SockEvent::Packet(pkt)) {
                Ok(()) => {
                    inner.clog_tries = 0;
                }
                Err(SinkError::Full(ev)) => {
                    inner.clog_tries += 1;
                    if inner.read_clog_tries != -1 && inner.clog_tries >= inner.read_clog_tries {
                        // Recipient stayed full past the retry budget:
                        // drop the event and move on.
                        nwarn!("{}: read clog tries exceeded, dropping event", inner.id);
                        inner.clog_tries = 0;
                    } else {
                        if let SockEvent::Packet(pkt) = ev {
                            inner.clogged = Some(pkt);
                        }
                        return;
                    }
                }
                Err(SinkError::Closed(_)) => {
                    inner.close_locked(None);
                    return;
                }
            }
        }

        let outcome = inner.sock.nb_read(&mut inner.read_buf);
        let len = match outcome {
            ReadOutcome::WouldBlock => {
                // Spurious wake-up; not an error.
                inner.clear_read_pending();
                return;
            }
            ReadOutcome::Closed => {
                let notify = inner.read_sink.clone();
                inner.close_locked(notify.as_ref());
                inner.clear_read_pending();
                return;
            }
            ReadOutcome::Data(len) => len,
        };

        let payload = if inner.read_buffer_copy {
            inner.read_buf[..len].to_vec()
        } else {
            // Hand the buffer off to the packet and start fresh.
            std::mem::replace(&mut inner.read_buf, vec![0; inner.read_buf_size])
        };
        let pkt = InPacket {
            conn: inner.id,
            buf: payload,
            len,
            seq: inner.seq,
        };
        inner.seq = next_seq(inner.seq);

        match sink.enqueue(SockEvent::Packet(pkt)) {
            Ok(()) => {
                inner.clear_read_pending();
            }
            Err(SinkError::Full(ev)) => {
                if let SockEvent::Packet(pkt) = ev {
                    inner.clogged = Some(pkt);
                }
                inner.clog_tries = 0;
            }
            Err(SinkError::Closed(_)) => {
                inner.close_locked(None);
            }
        }
    }

    /// Submit a write or close request.
    ///
    /// The first request for a connection registers write interest with
    /// `source`; an idle→busy transition re-enables the write mask.
    /// Past the clog threshold a plain write is rejected (returned to
    /// the caller for backoff) while a close request is honored by
    /// closing immediately — a clogged peer is assumed unrecoverable.
    pub fn add_write_request(
        &self,
        req: SockRequest,
        source: &Arc<dyn ReadySource>,
    ) -> Result<(), SockRequest> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.closed {
            return Err(req);
        }

        if inner.write_source.is_none() {
            if let Err(e) = source.register(inner.fd, Interest::WRITE, self.id) {
                nwarn!("{}: write registration failed: {}", inner.id, e);
                return Err(req);
            }
            inner.write_source = Some(Arc::clone(source));
        } else if inner.outstanding_writes == 0 {
            inner.write_mask_enable();
        }

        if inner.write_clog_threshold != -1
            && inner.outstanding_writes as i64 >= inner.write_clog_threshold
        {
            match req {
                SockRequest::Write(w) => return Err(SockRequest::Write(w)),
                SockRequest::Close(c) => {
                    // Peer is unrecoverably stalled; close right now.
                    nwarn!("{}: write clog threshold exceeded, closing", inner.id);
                    inner.close_locked(c.notify.as_ref());
                    return Ok(());
                }
            }
        }

        inner.write_queue.push_back(req);
        inner.outstanding_writes += 1;
        Ok(())
    }

    /// Process one write-readiness event: load the next request if the
    /// pipe is idle, attempt one chunked write, retire the request on
    /// completion, and drop the write mask when nothing is outstanding.
    pub fn handle_write_ready(&self) -> Result<(), WriteError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.closed {
            return Ok(());
        }

        if inner.cur.is_none() {
            match inner.write_queue.pop_front() {
                None => {
                    inner.clear_write_pending();
                    return Ok(());
                }
                Some(SockRequest::Write(w)) => inner.init_write(w),
                Some(SockRequest::Close(c)) => {
                    inner.close_locked(c.notify.as_ref());
                    return Ok(());
                }
            }
        }

        match inner.try_write() {
            TryWrite::Complete => {
                inner.cur = None;
                inner.outstanding_writes -= 1;
                if inner.outstanding_writes == 0 {
                    inner.write_mask_disable();
                }
            }
            TryWrite::Partial => {}
            TryWrite::Failed => {
                return Err(WriteError::SinkClosed);
            }
        }
        inner.clear_write_pending();
        Ok(())
    }

    /// Close the connection. Idempotent; deregisters both interests,
    /// abandons queued writes, releases the socket, and (lossily)
    /// notifies `notify` of the closure.
    pub fn close(&self, notify: Option<&Arc<dyn EventSink<SockEvent>>>) {
        self.lock().close_locked(notify);
    }
}

/// Arena of live connections addressed by stable [`ConnId`] tokens.
///
/// The multiplexer's registry refers to connections by token only;
/// the table holds the owning references. Tokens are never reused, so
/// a stale readiness event can at worst miss the lookup.
pub struct ConnTable {
    conns: Mutex<HashMap<u64, Arc<SockState>>>,
    next_id: AtomicU64,
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<SockState>>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new connection and hand back its state machine.
    pub fn insert(&self, sock: Box<dyn SockIo>, cfg: &NioConfig) -> Arc<SockState> {
        let id = ConnId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(SockState::new(id, sock, cfg));
        self.lock().insert(id.as_u64(), Arc::clone(&conn));
        conn
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<SockState>> {
        self.lock().get(&id.as_u64()).cloned()
    }

    pub fn remove(&self, id: ConnId) -> Option<Arc<SockState>> {
        self.lock().remove(&id.as_u64())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sedge_core::{CloseRequest, EventQueue};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // ── Test doubles ─────────────────────────────────────────────────

    enum ScriptRead {
        Data(Vec<u8>),
        WouldBlock,
        Closed,
    }

    /// Scripted socket: reads pop from a script, writes are recorded.
    struct MockSock {
        reads: Mutex<VecDeque<ScriptRead>>,
        writes: Mutex<VecDeque<WriteOutcome>>,
        written: Mutex<Vec<Vec<u8>>>,
        closes: AtomicUsize,
        fd: RawFd,
    }

    impl MockSock {
        fn new(fd: RawFd) -> Self {
            Self {
                reads: Mutex::new(VecDeque::new()),
                writes: Mutex::new(VecDeque::new()),
                written: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                fd,
            }
        }

        fn script_read(&self, r: ScriptRead) {
            self.reads.lock().unwrap().push_back(r);
        }

        fn script_write(&self, w: WriteOutcome) {
            self.writes.lock().unwrap().push_back(w);
        }
    }

    /// Shared handle so tests keep visibility after the state machine
    /// takes ownership.
    struct MockHandle(Arc<MockSock>);

    impl SockIo for MockHandle {
        fn raw_fd(&self) -> RawFd {
            self.0.fd
        }

        fn nb_read(&mut self, buf: &mut [u8]) -> ReadOutcome {
            match self.0.reads.lock().unwrap().pop_front() {
                Some(ScriptRead::Data(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    ReadOutcome::Data(data.len())
                }
                Some(ScriptRead::WouldBlock) | None => ReadOutcome::WouldBlock,
                Some(ScriptRead::Closed) => ReadOutcome::Closed,
            }
        }

        fn nb_write(&mut self, buf: &[u8]) -> WriteOutcome {
            let outcome = self
                .0
                .writes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(WriteOutcome::Wrote(buf.len()));
            if let WriteOutcome::Wrote(n) = outcome {
                let n = n.min(buf.len());
                self.0.written.lock().unwrap().push(buf[..n].to_vec());
                return WriteOutcome::Wrote(n);
            }
            outcome
        }

        fn close(&mut self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Recording multiplexer double: tracks the registered mask per fd.
    #[derive(Default)]
    struct MockSource {
        masks: Mutex<HashMap<RawFd, Interest>>,
        pending: Mutex<HashMap<RawFd, Interest>>,
        deregisters: AtomicUsize,
    }

    impl MockSource {
        fn mask(&self, fd: RawFd) -> Option<Interest> {
            self.masks.lock().unwrap().get(&fd).copied()
        }
    }

    impl ReadySource for MockSource {
        fn register(&self, fd: RawFd, interest: Interest, _token: ConnId) -> SourceResult<()> {
            let mut masks = self.masks.lock().unwrap();
            if masks.contains_key(&fd) {
                return Err(crate::error::SourceError::AlreadyRegistered);
            }
            masks.insert(fd, interest);
            Ok(())
        }

        fn update(&self, fd: RawFd, interest: Interest) -> SourceResult<()> {
            let mut masks = self.masks.lock().unwrap();
            match masks.get_mut(&fd) {
                Some(mask) => {
                    *mask = interest;
                    Ok(())
                }
                None => Err(crate::error::SourceError::NotRegistered),
            }
        }

        fn deregister(&self, fd: RawFd) -> SourceResult<()> {
            self.deregisters.fetch_add(1, Ordering::SeqCst);
            match self.masks.lock().unwrap().remove(&fd) {
                Some(_) => Ok(()),
                None => Err(crate::error::SourceError::NotRegistered),
            }
        }

        fn num_active(&self) -> usize {
            self.masks.lock().unwrap().len()
        }

        fn blocking_dequeue(&self, _timeout: Duration, _max: usize) -> Option<Vec<ReadyEvent>> {
            None
        }

        fn blocking_dequeue_all(&self, _timeout: Duration) -> Option<Vec<ReadyEvent>> {
            None
        }

        fn clear_pending(&self, fd: RawFd, interest: Interest) {
            if let Some(p) = self.pending.lock().unwrap().get_mut(&fd) {
                *p = p.remove(interest);
            }
        }

        fn pending(&self, fd: RawFd) -> Interest {
            self.pending
                .lock()
                .unwrap()
                .get(&fd)
                .copied()
                .unwrap_or(Interest::NONE)
        }
    }

    use crate::select::ReadyEvent;

    fn setup(cfg: NioConfig) -> (Arc<MockSock>, SockState) {
        let mock = Arc::new(MockSock::new(33));
        let state = SockState::new(ConnId::new(1), Box::new(MockHandle(Arc::clone(&mock))), &cfg);
        (mock, state)
    }

    fn read_sink(threshold: i64) -> Arc<dyn EventSink<SockEvent>> {
        Arc::new(EventQueue::with_threshold(threshold))
    }

    fn as_source(src: &Arc<MockSource>) -> Arc<dyn ReadySource> {
        Arc::clone(src) as Arc<dyn ReadySource>
    }

    fn packet_seqs(queue: &Arc<EventQueue<SockEvent>>) -> Vec<u64> {
        queue
            .dequeue_all()
            .unwrap_or_default()
            .into_iter()
            .map(|ev| match ev {
                SockEvent::Packet(p) => p.seq,
                SockEvent::SinkClosed(_) => panic!("unexpected close event"),
            })
            .collect()
    }

    // ── Read path ────────────────────────────────────────────────────

    #[test]
    fn read_delivers_packets_with_increasing_seq() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();

        state.read_init(&as_source(&src), &sink).unwrap();
        assert_eq!(src.mask(33), Some(Interest::READ));

        mock.script_read(ScriptRead::Data(b"hello".to_vec()));
        mock.script_read(ScriptRead::Data(b"world!".to_vec()));
        state.do_read();
        state.do_read();

        let events = queue.dequeue_all().unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            SockEvent::Packet(p) => {
                assert_eq!(p.bytes(), b"hello");
                assert_eq!(p.seq, 1);
            }
            _ => panic!("expected packet"),
        }
        match &events[1] {
            SockEvent::Packet(p) => {
                assert_eq!(p.bytes(), b"world!");
                assert_eq!(p.seq, 2);
            }
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn read_copy_policy_copies_payload() {
        let (mock, state) = setup(NioConfig::default().read_buffer_copy(true).read_buffer_size(64));
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&src), &sink).unwrap();

        mock.script_read(ScriptRead::Data(b"abc".to_vec()));
        state.do_read();

        match queue.dequeue_all().unwrap().pop().unwrap() {
            SockEvent::Packet(p) => {
                // Copied: exactly the payload, not the whole read buffer.
                assert_eq!(p.buf.len(), 3);
                assert_eq!(p.bytes(), b"abc");
            }
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn spurious_wake_produces_nothing() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&src), &sink).unwrap();

        mock.script_read(ScriptRead::WouldBlock);
        mock.script_read(ScriptRead::Data(b"later".to_vec()));

        state.do_read();
        assert!(queue.dequeue_all().is_none());
        assert!(!state.is_closed());

        // Subsequent readiness events are processed normally.
        state.do_read();
        assert_eq!(packet_seqs(&queue), vec![1]);
    }

    #[test]
    fn eof_closes_and_notifies() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&src), &sink).unwrap();

        mock.script_read(ScriptRead::Closed);
        state.do_read();

        assert!(state.is_closed());
        assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
        assert_eq!(src.mask(33), None);
        match queue.dequeue_all().unwrap().pop().unwrap() {
            SockEvent::SinkClosed(ev) => assert_eq!(ev.conn, ConnId::new(1)),
            _ => panic!("expected close notification"),
        }
    }

    #[test]
    fn full_sink_buffers_one_clogged_event_and_drains() {
        let (mock, state) = setup(NioConfig::default().read_clog_tries(5));
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&src), &sink).unwrap();

        mock.script_read(ScriptRead::Data(b"one".to_vec()));
        mock.script_read(ScriptRead::Data(b"two".to_vec()));
        mock.script_read(ScriptRead::Data(b"three".to_vec()));

        state.do_read(); // "one" delivered, queue now full
        state.do_read(); // "two" read, delivery clogs

        // While clogged and undrained, no new read is attempted.
        state.do_read();
        assert_eq!(mock.reads.lock().unwrap().len(), 1);

        // Consumer drains; the next readiness event delivers "two"
        // first, then reads "three" — which clogs in turn behind it.
        assert_eq!(packet_seqs(&queue), vec![1]);
        state.do_read();
        assert_eq!(packet_seqs(&queue), vec![2]);
        state.do_read();
        assert_eq!(packet_seqs(&queue), vec![3]);
    }

    #[test]
    fn clog_drop_after_exact_retry_budget() {
        let (mock, state) = setup(NioConfig::default().read_clog_tries(2));
        let src = Arc::new(MockSource::default());
        // Threshold 0: the recipient never accepts anything.
        let queue = Arc::new(EventQueue::with_threshold(0));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&src), &sink).unwrap();

        mock.script_read(ScriptRead::Data(b"doomed".to_vec()));
        mock.script_read(ScriptRead::Data(b"next".to_vec()));

        state.do_read(); // read "doomed", delivery clogs (0 tries used)
        state.do_read(); // drain failure 1 of 2 — kept, no new read
        assert_eq!(mock.reads.lock().unwrap().len(), 1);

        state.do_read(); // drain failure 2 of 2 — dropped, reads "next"
        assert_eq!(mock.reads.lock().unwrap().len(), 0);
        assert!(!state.is_closed());

        // "next" is now the sole clogged event; its seq shows "doomed"
        // consumed seq 1 before being dropped.
        let inner = state.lock();
        assert_eq!(inner.clogged.as_ref().map(|p| p.seq), Some(2));
    }

    #[test]
    fn recipient_gone_closes_without_notification() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&src), &sink).unwrap();

        queue.shutdown();
        mock.script_read(ScriptRead::Data(b"orphan".to_vec()));
        state.do_read();

        assert!(state.is_closed());
        assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
        // No notification: the consumer is gone.
        assert!(queue.dequeue_all().is_none());
    }

    #[test]
    fn stale_read_after_close_is_ignored() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&src), &sink).unwrap();

        mock.script_read(ScriptRead::Data(b"late".to_vec()));
        state.close(None);
        state.do_read();

        // Nothing consumed, nothing delivered.
        assert_eq!(mock.reads.lock().unwrap().len(), 1);
        assert!(queue.dequeue_all().is_none());
    }

    // ── Write path ───────────────────────────────────────────────────

    fn write_req(state: &SockState, payload: &[u8]) -> SockRequest {
        SockRequest::Write(WriteRequest::new(state.id(), payload.to_vec()))
    }

    #[test]
    fn first_write_registers_interest() {
        let (_mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        assert_eq!(src.mask(33), None);
        state
            .add_write_request(write_req(&state, b"hi"), &as_source(&src))
            .unwrap();
        assert_eq!(src.mask(33), Some(Interest::WRITE));
        assert_eq!(state.outstanding_writes(), 1);
    }

    #[test]
    fn write_mask_tracks_outstanding_count() {
        let (_mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        state
            .add_write_request(write_req(&state, b"payload"), &as_source(&src))
            .unwrap();
        assert_eq!(src.mask(33), Some(Interest::WRITE));

        // Single write-ready event completes the request; the mask
        // drops with the count.
        state.handle_write_ready().unwrap();
        assert_eq!(state.outstanding_writes(), 0);
        assert_eq!(src.mask(33), Some(Interest::NONE));

        // Idle → busy re-enables it.
        state
            .add_write_request(write_req(&state, b"more"), &as_source(&src))
            .unwrap();
        assert_eq!(src.mask(33), Some(Interest::WRITE));
    }

    #[test]
    fn writes_service_fifo() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        state
            .add_write_request(write_req(&state, b"first"), &as_source(&src))
            .unwrap();
        state
            .add_write_request(write_req(&state, b"second"), &as_source(&src))
            .unwrap();

        state.handle_write_ready().unwrap();
        state.handle_write_ready().unwrap();

        let written = mock.written.lock().unwrap();
        assert_eq!(written.as_slice(), &[b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn chunk_cap_bounds_each_attempt() {
        let (mock, state) = setup(NioConfig::default().max_write_len(4));
        let src = Arc::new(MockSource::default());

        state
            .add_write_request(write_req(&state, b"0123456789"), &as_source(&src))
            .unwrap();

        state.handle_write_ready().unwrap();
        state.handle_write_ready().unwrap();
        assert_eq!(state.outstanding_writes(), 1); // not done yet
        state.handle_write_ready().unwrap();
        assert_eq!(state.outstanding_writes(), 0);

        let written = mock.written.lock().unwrap();
        assert_eq!(
            written.as_slice(),
            &[b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]
        );
    }

    #[test]
    fn short_write_advances_offset() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        // Socket accepts only 3 bytes on the first attempt.
        mock.script_write(WriteOutcome::Wrote(3));
        state
            .add_write_request(write_req(&state, b"abcdef"), &as_source(&src))
            .unwrap();

        state.handle_write_ready().unwrap();
        assert_eq!(state.outstanding_writes(), 1);
        state.handle_write_ready().unwrap();
        assert_eq!(state.outstanding_writes(), 0);

        let written = mock.written.lock().unwrap();
        assert_eq!(written.as_slice(), &[b"abc".to_vec(), b"def".to_vec()]);
    }

    #[test]
    fn write_clog_rejects_sixth_plain_write() {
        let (_mock, state) = setup(NioConfig::default().write_clog_threshold(5));
        let src = Arc::new(MockSource::default());

        for i in 0..5 {
            state
                .add_write_request(write_req(&state, &[i]), &as_source(&src))
                .unwrap_or_else(|_| panic!("write {} should be admitted", i));
        }
        let rejected = state.add_write_request(write_req(&state, b"x"), &as_source(&src));
        assert!(matches!(rejected, Err(SockRequest::Write(_))));
        assert_eq!(state.outstanding_writes(), 5);
        assert!(!state.is_closed());
    }

    #[test]
    fn write_clog_close_request_closes_immediately() {
        let (mock, state) = setup(NioConfig::default().write_clog_threshold(5));
        let src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));

        for i in 0..5 {
            state
                .add_write_request(write_req(&state, &[i]), &as_source(&src))
                .unwrap();
        }
        let close = SockRequest::Close(CloseRequest {
            conn: state.id(),
            notify: Some(queue.clone() as Arc<dyn EventSink<SockEvent>>),
        });
        state.add_write_request(close, &as_source(&src)).unwrap();

        assert!(state.is_closed());
        assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            queue.dequeue_all().unwrap().pop(),
            Some(SockEvent::SinkClosed(_))
        ));
    }

    #[test]
    fn queued_close_request_services_after_writes() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        state
            .add_write_request(write_req(&state, b"bye"), &as_source(&src))
            .unwrap();
        state
            .add_write_request(
                SockRequest::Close(CloseRequest {
                    conn: state.id(),
                    notify: None,
                }),
                &as_source(&src),
            )
            .unwrap();

        state.handle_write_ready().unwrap(); // flushes "bye"
        assert!(!state.is_closed());
        state.handle_write_ready().unwrap(); // services the close
        assert!(state.is_closed());
        assert_eq!(mock.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn write_failure_closes_and_signals() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        mock.script_write(WriteOutcome::Closed);
        state
            .add_write_request(write_req(&state, b"doomed"), &as_source(&src))
            .unwrap();

        assert_eq!(state.handle_write_ready(), Err(WriteError::SinkClosed));
        assert!(state.is_closed());
        assert_eq!(src.mask(33), None);
    }

    #[test]
    fn rejected_after_close() {
        let (_mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        state.close(None);
        let res = state.add_write_request(write_req(&state, b"late"), &as_source(&src));
        assert!(res.is_err());
        assert_eq!(state.outstanding_writes(), 0);
    }

    // ── Close ────────────────────────────────────────────────────────

    #[test]
    fn close_is_idempotent() {
        let (mock, state) = setup(NioConfig::default());
        // Separate read and write multiplexers, as in the real staging.
        let read_src = Arc::new(MockSource::default());
        let write_src = Arc::new(MockSource::default());
        let queue = Arc::new(EventQueue::with_threshold(-1));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();
        state.read_init(&as_source(&read_src), &sink).unwrap();
        state
            .add_write_request(write_req(&state, b"pending"), &as_source(&write_src))
            .unwrap();

        state.close(Some(&sink));
        state.close(Some(&sink));

        assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
        // Each interest deregistered exactly once.
        assert_eq!(read_src.deregisters.load(Ordering::SeqCst), 1);
        assert_eq!(write_src.deregisters.load(Ordering::SeqCst), 1);
        // Exactly one notification.
        let events = queue.dequeue_all().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SockEvent::SinkClosed(_)));
    }

    #[test]
    fn close_discards_pending_writes() {
        let (mock, state) = setup(NioConfig::default());
        let src = Arc::new(MockSource::default());

        state
            .add_write_request(write_req(&state, b"a"), &as_source(&src))
            .unwrap();
        state
            .add_write_request(write_req(&state, b"b"), &as_source(&src))
            .unwrap();
        state.close(None);

        assert_eq!(state.outstanding_writes(), 0);
        state.handle_write_ready().unwrap();
        assert!(mock.written.lock().unwrap().is_empty());
    }

    #[test]
    fn close_notification_is_lossy() {
        let (_mock, state) = setup(NioConfig::default());
        // Full recipient: close must still complete, silently.
        let queue = Arc::new(EventQueue::with_threshold(0));
        let sink: Arc<dyn EventSink<SockEvent>> = queue.clone();

        state.close(Some(&sink));
        assert!(state.is_closed());
        assert!(queue.dequeue_all().is_none());
    }

    // ── ConnTable ────────────────────────────────────────────────────

    #[test]
    fn conn_table_round_trip() {
        let table = ConnTable::new();
        let cfg = NioConfig::default();
        let a = table.insert(Box::new(MockHandle(Arc::new(MockSock::new(10)))), &cfg);
        let b = table.insert(Box::new(MockHandle(Arc::new(MockSock::new(11)))), &cfg);

        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
        assert!(Arc::ptr_eq(&table.get(a.id()).unwrap(), &a));

        let removed = table.remove(a.id()).unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert!(table.get(a.id()).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn conn_table_never_reuses_tokens() {
        let table = ConnTable::new();
        let cfg = NioConfig::default();
        let a = table.insert(Box::new(MockHandle(Arc::new(MockSock::new(10)))), &cfg);
        let a_id = a.id();
        table.remove(a_id);
        let b = table.insert(Box::new(MockHandle(Arc::new(MockSock::new(10)))), &cfg);
        assert_ne!(a_id, b.id());
    }
}
