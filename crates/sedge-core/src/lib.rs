//! # sedge-core — primitives for the staged socket I/O layer
//!
//! This crate holds the platform-agnostic half of sedge:
//!
//! - [`queue::EventQueue`] — the admission-controlled FIFO every stage
//!   pulls from. Producers are arbitrary threads; each queue has a
//!   single consuming worker.
//! - [`sink::EventSink`] — the delivery contract between the socket
//!   layer and whatever consumes its completion events.
//! - [`event`] — connection identifiers, inbound packets, write/close
//!   requests, and the sequence-number discipline.
//! - [`nlog`] — leveled stderr logging, configured from the
//!   environment.
//!
//! Everything that touches file descriptors or a multiplexer lives in
//! `sedge-nio`. Components there depend on the traits here, never the
//! other way around.

pub mod event;
pub mod nlog;
pub mod queue;
pub mod sink;

pub use event::{next_seq, ConnId, CloseRequest, InPacket, SinkClosedEvent, SockEvent, SockRequest, WriteRequest};
pub use queue::{EnqueuePredicate, EventQueue, ThresholdPredicate};
pub use sink::{EventSink, SinkError};
