//! Level-triggered epoll implementation of [`ReadySource`].
//!
//! The registry maps each watched fd to its owning token, registered
//! interest, and pending (delivered-but-unprocessed) mask. Because the
//! instance is level-triggered, a handle whose owner has not yet
//! consumed an event simply shows up again on the next wait — no event
//! is ever lost to a slow stage.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use sedge_core::{nerror, ConnId};

use crate::error::{SourceError, SourceResult};
use crate::select::{Interest, ReadyEvent, ReadySource};

/// Upper bound on one readiness batch when the caller asks for "all".
const READY_BATCH: usize = 256;

struct Registration {
    token: ConnId,
    interest: Interest,
    pending: Interest,
}

/// Epoll-backed readiness multiplexer (Linux).
pub struct EpollSource {
    epoll: Epoll,
    registry: Mutex<HashMap<RawFd, Registration>>,
}

impl EpollSource {
    pub fn new() -> SourceResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(os_err)?;
        Ok(Self {
            epoll,
            registry: Mutex::new(HashMap::new()),
        })
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<RawFd, Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flags_for(interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.contains(Interest::READ) {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.contains(Interest::WRITE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn wait(&self, timeout: Duration, max: usize) -> Option<Vec<ReadyEvent>> {
        let cap = max.clamp(1, READY_BATCH);
        let mut events = vec![EpollEvent::empty(); cap];

        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let n = match self.epoll.wait(&mut events, EpollTimeout::from(ms)) {
            Ok(n) => n,
            Err(Errno::EINTR) => return None,
            Err(e) => {
                nerror!("epoll: wait failed: {}", e);
                return None;
            }
        };
        if n == 0 {
            return None;
        }

        let mut registry = self.registry();
        let mut batch = Vec::with_capacity(n);
        for event in &events[..n] {
            let fd = event.data() as RawFd;
            // A handle deregistered between the kernel firing and us
            // taking the registry lock is a stale event; skip it.
            let Some(reg) = registry.get_mut(&fd) else {
                continue;
            };

            let fired = event.events();
            let mut ready = Interest::NONE;
            if fired.contains(EpollFlags::EPOLLIN) {
                ready = ready.insert(Interest::READ);
            }
            if fired.contains(EpollFlags::EPOLLOUT) {
                ready = ready.insert(Interest::WRITE);
            }
            // Error/hangup surfaces through whichever interest the
            // owner registered: the next read/write attempt fails and
            // takes the close path.
            if fired.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                ready = ready.insert(reg.interest);
            }

            let ready = ready.intersect(reg.interest);
            if ready.is_empty() {
                continue;
            }
            reg.pending = reg.pending.insert(ready);
            batch.push(ReadyEvent {
                token: reg.token,
                ready,
            });
        }

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

impl ReadySource for EpollSource {
    fn register(&self, fd: RawFd, interest: Interest, token: ConnId) -> SourceResult<()> {
        let mut registry = self.registry();
        if registry.contains_key(&fd) {
            return Err(SourceError::AlreadyRegistered);
        }

        // Safety: the caller owns the socket behind `fd` and keeps it
        // open for the lifetime of the registration; close() always
        // deregisters before releasing the socket.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(Self::flags_for(interest), fd as u64);
        match self.epoll.add(borrowed, event) {
            Ok(()) => {}
            Err(Errno::EEXIST) => return Err(SourceError::AlreadyRegistered),
            Err(e) => return Err(os_err(e)),
        }

        registry.insert(
            fd,
            Registration {
                token,
                interest,
                pending: Interest::NONE,
            },
        );
        Ok(())
    }

    fn update(&self, fd: RawFd, interest: Interest) -> SourceResult<()> {
        let mut registry = self.registry();
        let reg = registry.get_mut(&fd).ok_or(SourceError::NotRegistered)?;

        // Safety: see register().
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(Self::flags_for(interest), fd as u64);
        match self.epoll.modify(borrowed, &mut event) {
            Ok(()) => {}
            Err(Errno::ENOENT) => return Err(SourceError::NotRegistered),
            Err(e) => return Err(os_err(e)),
        }

        reg.interest = interest;
        reg.pending = reg.pending.intersect(interest);
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> SourceResult<()> {
        let mut registry = self.registry();
        if registry.remove(&fd).is_none() {
            return Err(SourceError::NotRegistered);
        }

        // Safety: see register(). The fd may already be closed by the
        // time a connection tears down; the kernel then reports
        // ENOENT/EBADF, which is fine — the watch is gone either way.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(os_err(e)),
        }
    }

    fn num_active(&self) -> usize {
        self.registry().len()
    }

    fn blocking_dequeue(&self, timeout: Duration, max: usize) -> Option<Vec<ReadyEvent>> {
        self.wait(timeout, max)
    }

    fn blocking_dequeue_all(&self, timeout: Duration) -> Option<Vec<ReadyEvent>> {
        self.wait(timeout, READY_BATCH)
    }

    fn clear_pending(&self, fd: RawFd, interest: Interest) {
        if let Some(reg) = self.registry().get_mut(&fd) {
            reg.pending = reg.pending.remove(interest);
        }
    }

    fn pending(&self, fd: RawFd) -> Interest {
        self.registry()
            .get(&fd)
            .map_or(Interest::NONE, |reg| reg.pending)
    }
}

fn os_err(e: Errno) -> SourceError {
    SourceError::Os(e as i32)
}
