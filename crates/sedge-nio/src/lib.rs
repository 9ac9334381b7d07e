//! # sedge-nio — the non-blocking socket I/O core
//!
//! Turns raw readiness notifications from an OS multiplexer into queued
//! application events, with backpressure, batching, and a
//! per-connection state machine for partial reads and writes.
//!
//! The moving parts, leaves first:
//!
//! - [`select::ReadySource`] — the readiness-abstraction contract any
//!   multiplexer must satisfy; [`epoll::EpollSource`] is the
//!   level-triggered Linux implementation.
//! - [`sock_state::SockState`] — one record per connection, driving
//!   non-blocking read, FIFO write servicing, clog handling, and
//!   idempotent close. Connections live in a [`sock_state::ConnTable`]
//!   arena addressed by stable [`sedge_core::ConnId`] tokens.
//! - [`stage::StageWrapper`] — binds a handler to a bounded queue and
//!   (optionally) a readiness source.
//! - [`manager::ThreadManager`] — one dedicated worker thread per
//!   stage, running the drain/select/spin loop for the life of the
//!   process. Stage deregistration is deliberately unsupported.
//!
//! Data flows readiness → worker → state machine → completion queue →
//! handler; backpressure flows the other way as clogged reads and
//! rejected writes.

pub mod config;
pub mod error;
pub mod manager;
pub mod select;
pub mod sock_state;
pub mod stage;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod epoll;
        pub use epoll::EpollSource;
    }
}

pub use config::NioConfig;
pub use error::{SourceError, StageError, WriteError};
pub use manager::{StageHandle, ThreadManager};
pub use select::{Interest, ReadyEvent, ReadySource};
pub use sock_state::{ConnTable, ReadOutcome, SockIo, SockState, TcpSock, WriteOutcome};
pub use stage::{AggregationHint, EventHandler, FixedHint, StageEvent, StageStats, StageWrapper};
