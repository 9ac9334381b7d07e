//! Sedge Echo Server
//!
//! TCP echo server built from three sedge stages sharing one
//! connection arena:
//!
//! - **read**  — epoll source; readiness events drive `do_read`, and
//!   completed packets land on the echo stage's queue
//! - **echo**  — queue-only; turns each inbound packet into a write
//!   request for the write stage
//! - **write** — epoll source; queue carries write/close requests,
//!   readiness events pump the per-connection write FIFOs
//!
//! Usage:
//!     cargo build --release -p sedge-echo
//!     ./target/release/sedge-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 8077
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 8077 & done

#[cfg(target_os = "linux")]
fn main() {
    linux::run();
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("sedge-echo: epoll-backed demo, Linux only");
}

#[cfg(target_os = "linux")]
mod linux {
    use std::net::TcpListener;
    use std::os::fd::FromRawFd;
    use std::sync::Arc;

    use sedge_core::{ninfo, nwarn, EventQueue, EventSink, SockEvent, SockRequest, WriteRequest};
    use sedge_nio::{
        ConnTable, EpollSource, EventHandler, FixedHint, NioConfig, ReadySource, StageEvent,
        StageWrapper, TcpSock, ThreadManager, WriteError,
    };

    const DEFAULT_PORT: u16 = 8077;

    /// Readiness → `do_read` on the owning connection.
    struct ReadHandler {
        table: Arc<ConnTable>,
    }

    impl EventHandler<SockEvent> for ReadHandler {
        fn handle_events(&mut self, batch: Vec<StageEvent<SockEvent>>) {
            for event in batch {
                if let StageEvent::Ready(ev) = event {
                    if let Some(conn) = self.table.get(ev.token) {
                        conn.do_read();
                    }
                }
            }
        }
    }

    /// Queued requests → connection write FIFOs; readiness → write pump.
    struct WriteHandler {
        table: Arc<ConnTable>,
        source: Arc<dyn ReadySource>,
    }

    impl EventHandler<SockRequest> for WriteHandler {
        fn handle_events(&mut self, batch: Vec<StageEvent<SockRequest>>) {
            for event in batch {
                match event {
                    StageEvent::Queued(req) => {
                        let Some(conn) = self.table.get(req.conn()) else {
                            continue;
                        };
                        if let Err(rejected) = conn.add_write_request(req, &self.source) {
                            // Clogged or closed: the echo stage has no
                            // retry story, so shed the payload.
                            nwarn!("echo: shedding request for {}", rejected.conn());
                        }
                    }
                    StageEvent::Ready(ev) => {
                        if let Some(conn) = self.table.get(ev.token) {
                            if let Err(WriteError::SinkClosed) = conn.handle_write_ready() {
                                nwarn!("echo: {} died mid-write", ev.token);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Inbound packets → write requests; closed connections leave the
    /// arena here.
    struct EchoHandler {
        table: Arc<ConnTable>,
        write_queue: Arc<EventQueue<SockRequest>>,
    }

    impl EventHandler<SockEvent> for EchoHandler {
        fn handle_events(&mut self, batch: Vec<StageEvent<SockEvent>>) {
            for event in batch {
                let StageEvent::Queued(ev) = event else {
                    continue;
                };
                match ev {
                    SockEvent::Packet(pkt) => {
                        let len = pkt.len;
                        let req = WriteRequest::with_range(pkt.conn, pkt.buf, 0, len);
                        if !self.write_queue.enqueue_lossy(SockRequest::Write(req)) {
                            nwarn!("echo: write stage full, dropping {} bytes", len);
                        }
                    }
                    SockEvent::SinkClosed(ev) => {
                        self.table.remove(ev.conn);
                        ninfo!("echo: {} gone, {} live", ev.conn, self.table.len());
                    }
                }
            }
        }
    }

    /// Socket setup: create, setsockopt, bind, listen — then hand the
    /// fd to the std listener for the blocking accept loop.
    fn bind_listener(port: u16) -> Result<TcpListener, i32> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(unsafe { *libc::__errno_location() });
        }

        unsafe {
            let opt: i32 = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const _,
                4,
            );
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &opt as *const _ as *const _,
                4,
            );
        }

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as u16;
        addr.sin_addr.s_addr = 0; // INADDR_ANY
        addr.sin_port = port.to_be();

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(&addr) as u32,
            )
        };
        if ret != 0 {
            let errno = unsafe { *libc::__errno_location() };
            unsafe { libc::close(fd) };
            return Err(errno);
        }

        unsafe { libc::listen(fd, 1024) };

        // Safety: fd is a freshly bound, listening socket we own.
        Ok(unsafe { TcpListener::from_raw_fd(fd) })
    }

    pub fn run() {
        let port = std::env::args()
            .nth(1)
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let table = Arc::new(ConnTable::new());
        let read_src: Arc<dyn ReadySource> =
            Arc::new(EpollSource::new().expect("epoll setup failed"));
        let write_src: Arc<dyn ReadySource> =
            Arc::new(EpollSource::new().expect("epoll setup failed"));

        let manager = ThreadManager::new();
        let hint = Arc::new(FixedHint::none());

        let read_stage = StageWrapper::<SockEvent>::new(
            "read",
            Box::new(ReadHandler {
                table: Arc::clone(&table),
            }),
            Some(Arc::clone(&read_src)),
            NioConfig::default(),
        )
        .expect("read stage config");

        let write_stage = StageWrapper::<SockRequest>::new(
            "write",
            Box::new(WriteHandler {
                table: Arc::clone(&table),
                source: Arc::clone(&write_src),
            }),
            Some(Arc::clone(&write_src)),
            NioConfig::default().queue_length(8192).write_clog_threshold(512),
        )
        .expect("write stage config");

        let write_handle = manager
            .register(write_stage, hint.clone())
            .expect("register write stage");

        let echo_stage = StageWrapper::<SockEvent>::new(
            "echo",
            Box::new(EchoHandler {
                table: Arc::clone(&table),
                write_queue: write_handle.queue(),
            }),
            None,
            NioConfig::default().queue_length(8192),
        )
        .expect("echo stage config");

        let echo_handle = manager
            .register(echo_stage, hint.clone())
            .expect("register echo stage");
        manager
            .register(read_stage, hint)
            .expect("register read stage");

        let completion: Arc<dyn EventSink<SockEvent>> = echo_handle.queue();

        let listener = match bind_listener(port) {
            Ok(l) => l,
            Err(errno) => {
                eprintln!("sedge-echo: bind failed: errno {}", errno);
                std::process::exit(1);
            }
        };
        ninfo!("sedge-echo: listening on port {}", port);

        loop {
            let stream = match listener.accept() {
                Ok((stream, _peer)) => stream,
                Err(e) => {
                    nwarn!("sedge-echo: accept failed: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let sock = match TcpSock::new(stream) {
                Ok(sock) => sock,
                Err(e) => {
                    nwarn!("sedge-echo: socket setup failed: {}", e);
                    continue;
                }
            };
            let conn = table.insert(Box::new(sock), &NioConfig::default());
            if let Err(e) = conn.read_init(&read_src, &completion) {
                nwarn!("sedge-echo: read registration failed for {}: {}", conn.id(), e);
                conn.close(None);
                table.remove(conn.id());
            }
        }
    }
}
