//! The readiness-abstraction contract.
//!
//! A [`ReadySource`] is a registry of watched socket handles. Each
//! registration carries an interest mask and the [`ConnId`] token of
//! the owning connection state machine — a non-owning back-reference,
//! so neither side manages the other's lifetime. Workers pull batches
//! of [`ReadyEvent`]s from it, blocking with a bounded timeout.
//!
//! Any select/poll/epoll/kqueue-backed implementation must satisfy:
//!
//! - a handle never yields a readiness event for an interest it is not
//!   registered for;
//! - a handle registers at most once per source (`AlreadyRegistered`
//!   otherwise); interest changes go through `update`;
//! - `deregister` happens exactly once per handle, at connection close
//!   (the state machine's `closed` flag guards double-deregistration);
//! - `num_active` is cheap — the worker loop consults it every
//!   iteration to decide whether polling is worthwhile at all.

use std::os::fd::RawFd;
use std::time::Duration;

use sedge_core::ConnId;

use crate::error::SourceResult;

/// Readiness interest mask: read-ready and/or write-ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn insert(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[inline]
    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    #[inline]
    pub fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.insert(rhs)
    }
}

/// A readiness notification for one watched handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Token of the owning connection.
    pub token: ConnId,
    /// Which registered interest(s) fired.
    pub ready: Interest,
}

/// Registry of watched handles producing batches of ready handles.
pub trait ReadySource: Send + Sync {
    /// Watch `fd` for `interest`, owned by the connection `token`.
    fn register(&self, fd: RawFd, interest: Interest, token: ConnId) -> SourceResult<()>;

    /// Replace the interest mask of an already-registered handle. Used
    /// to enable/disable write-readiness as outstanding writes come and
    /// go; an empty mask keeps the handle registered but silent.
    fn update(&self, fd: RawFd, interest: Interest) -> SourceResult<()>;

    /// Stop watching `fd`. Tolerates handles whose underlying socket is
    /// already gone.
    fn deregister(&self, fd: RawFd) -> SourceResult<()>;

    /// Number of currently registered handles.
    fn num_active(&self) -> usize;

    /// Block up to `timeout` for readiness; return at most `max` ready
    /// handles, or `None` on timeout.
    fn blocking_dequeue(&self, timeout: Duration, max: usize) -> Option<Vec<ReadyEvent>>;

    /// Block up to `timeout` for readiness; return every ready handle,
    /// or `None` on timeout.
    fn blocking_dequeue_all(&self, timeout: Duration) -> Option<Vec<ReadyEvent>>;

    /// Clear delivered-but-unprocessed readiness bits for `fd`. Called
    /// by the owning state machine once it has consumed the event.
    fn clear_pending(&self, fd: RawFd, interest: Interest);

    /// Delivered-but-unprocessed readiness bits for `fd`.
    fn pending(&self, fd: RawFd) -> Interest;
}
