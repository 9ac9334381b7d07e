//! Stage configuration.
//!
//! One `NioConfig` per stage, passed at construction. `-1` sentinels
//! mean "unbounded/disabled" throughout, matching the queue-length
//! contract exposed to external callers.

use std::time::Duration;

/// Configuration for a socket I/O stage.
#[derive(Debug, Clone)]
pub struct NioConfig {
    /// Admission threshold of the stage's event queue (-1 = unbounded)
    pub queue_length: i64,

    /// Size of each connection's read buffer in bytes
    pub read_buffer_size: usize,

    /// Delivery retries before a clogged read event is dropped
    /// (-1 = retry forever)
    pub read_clog_tries: i32,

    /// Hand inbound payloads to the recipient as copies (`true`) or by
    /// buffer handoff with a fresh allocation (`false`)
    pub read_buffer_copy: bool,

    /// Outstanding-write count at which further plain writes are
    /// rejected and close requests short-circuit (-1 = disabled)
    pub write_clog_threshold: i64,

    /// Maximum bytes attempted per non-blocking write call, so one
    /// large write cannot starve other connections in the same worker
    /// iteration (-1 = no cap)
    pub max_write_len: i64,

    /// Readiness-dequeue rounds per worker iteration
    pub select_spin: usize,

    /// Non-blocking queue-drain rounds per worker iteration
    pub event_queue_spin: usize,

    /// Timeout for one blocking readiness dequeue
    pub select_timeout: Duration,

    /// Timeout for one blocking event-queue dequeue
    pub event_queue_timeout: Duration,
}

impl Default for NioConfig {
    fn default() -> Self {
        Self {
            queue_length: -1,
            read_buffer_size: 8192,
            read_clog_tries: 100,
            read_buffer_copy: false,
            write_clog_threshold: -1,
            max_write_len: 65536,
            select_spin: 10,
            event_queue_spin: 10,
            select_timeout: Duration::from_millis(1000),
            event_queue_timeout: Duration::from_millis(1000),
        }
    }
}

impl NioConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event queue admission threshold (-1 = unbounded)
    pub fn queue_length(mut self, n: i64) -> Self {
        self.queue_length = n;
        self
    }

    /// Set the per-connection read buffer size
    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n;
        self
    }

    /// Set clogged-read delivery retries (-1 = retry forever)
    pub fn read_clog_tries(mut self, n: i32) -> Self {
        self.read_clog_tries = n;
        self
    }

    /// Copy inbound payloads instead of handing off the read buffer
    pub fn read_buffer_copy(mut self, copy: bool) -> Self {
        self.read_buffer_copy = copy;
        self
    }

    /// Set the write backpressure threshold (-1 = disabled)
    pub fn write_clog_threshold(mut self, n: i64) -> Self {
        self.write_clog_threshold = n;
        self
    }

    /// Set the per-call write chunk cap (-1 = no cap)
    pub fn max_write_len(mut self, n: i64) -> Self {
        self.max_write_len = n;
        self
    }

    /// Set readiness and queue dequeue timeouts together
    pub fn dequeue_timeouts(mut self, select: Duration, event_queue: Duration) -> Self {
        self.select_timeout = select;
        self.event_queue_timeout = event_queue;
        self
    }

    /// Set the per-iteration spin counts
    pub fn spins(mut self, select_spin: usize, event_queue_spin: usize) -> Self {
        self.select_spin = select_spin;
        self.event_queue_spin = event_queue_spin;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.queue_length != -1 && self.queue_length < 1 {
            return Err("queue_length must be -1 or at least 1");
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be at least 1");
        }
        if self.read_clog_tries != -1 && self.read_clog_tries < 1 {
            return Err("read_clog_tries must be -1 or at least 1");
        }
        if self.write_clog_threshold != -1 && self.write_clog_threshold < 1 {
            return Err("write_clog_threshold must be -1 or at least 1");
        }
        if self.max_write_len != -1 && self.max_write_len < 1 {
            return Err("max_write_len must be -1 or at least 1");
        }
        if self.select_spin == 0 || self.event_queue_spin == 0 {
            return Err("spin counts must be at least 1");
        }
        Ok(())
    }
}
