//! Completion-recipient contract.
//!
//! The socket layer never talks to its consumer directly; it enqueues
//! events into a sink and reacts to the three possible outcomes.
//!
//! **Contract:**
//! - `enqueue()` must never block the caller.
//! - A `Full` rejection is transient: the caller may retry later
//!   (the connection state machine buffers one clogged event and
//!   retries on subsequent readiness).
//! - A `Closed` rejection is permanent: the consumer is gone and the
//!   caller must stop producing for it.

use core::fmt;

/// A rejected enqueue. Carries the item back so the caller can buffer
/// or drop it.
#[derive(Debug)]
pub enum SinkError<T> {
    /// Sink is at capacity right now; retry may succeed.
    Full(T),
    /// Sink consumer is permanently gone.
    Closed(T),
}

impl<T> SinkError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            SinkError::Full(item) | SinkError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Display for SinkError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Full(_) => write!(f, "sink full"),
            SinkError::Closed(_) => write!(f, "sink closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for SinkError<T> {}

/// Anything that accepts events from the socket layer.
///
/// Implemented by [`crate::queue::EventQueue`]; test code supplies
/// scripted doubles.
pub trait EventSink<T>: Send + Sync {
    /// Enqueue one event. Never blocks.
    fn enqueue(&self, item: T) -> Result<(), SinkError<T>>;

    /// Best-effort enqueue: drops the item instead of failing when the
    /// sink is full. Returns whether the item was accepted.
    fn enqueue_lossy(&self, item: T) -> bool;
}
