//! Stage runtime: a handler bound to one bounded queue and (optionally)
//! one readiness multiplexer.
//!
//! A stage is constructed with a [`NioConfig`] and handed to the
//! [`crate::manager::ThreadManager`], which runs it on a dedicated
//! worker for the rest of the process lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sedge_core::EventQueue;

use crate::config::NioConfig;
use crate::error::StageError;
use crate::select::{ReadyEvent, ReadySource};

/// One element of a worker dispatch batch.
#[derive(Debug)]
pub enum StageEvent<T> {
    /// Readiness-derived: a watched handle fired.
    Ready(ReadyEvent),
    /// Queue-derived: an application event admitted past the stage
    /// queue's predicate.
    Queued(T),
}

/// The handler contract consumed by the worker loop.
///
/// `handle_events` receives a non-empty ordered batch. A panic inside
/// it is caught and logged by the worker; the batch is considered
/// processed either way and the loop keeps running.
pub trait EventHandler<T>: Send {
    /// Called once, before the stage's worker starts.
    fn init(&mut self, cfg: &NioConfig) {
        let _ = cfg;
    }

    /// Called if the stage is ever torn down. With deregistration
    /// unsupported this never fires in practice; it exists for
    /// symmetry with `init`.
    fn destroy(&mut self) {}

    fn handle_events(&mut self, batch: Vec<StageEvent<T>>);
}

/// Supplies the worker's batching target. May vary over time based on
/// external load feedback; -1 means "no cap, take everything".
pub trait AggregationHint: Send + Sync {
    fn aggregation_target(&self) -> i64;
}

/// Constant aggregation target.
#[derive(Debug, Clone, Copy)]
pub struct FixedHint(pub i64);

impl FixedHint {
    /// No cap.
    pub fn none() -> Self {
        FixedHint(-1)
    }
}

impl AggregationHint for FixedHint {
    #[inline]
    fn aggregation_target(&self) -> i64 {
        self.0
    }
}

/// Service-rate statistics, recorded per readiness dispatch.
#[derive(Debug, Default)]
pub struct StageStats {
    batches: AtomicU64,
    events: AtomicU64,
    service_nanos: AtomicU64,
}

impl StageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_service_rate(&self, batch_len: usize, elapsed: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(batch_len as u64, Ordering::Relaxed);
        self.service_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn service_time(&self) -> Duration {
        Duration::from_nanos(self.service_nanos.load(Ordering::Relaxed))
    }
}

/// A named stage: handler + admission-controlled queue + optional
/// readiness source.
pub struct StageWrapper<T> {
    name: String,
    queue: Arc<EventQueue<T>>,
    source: Option<Arc<dyn ReadySource>>,
    handler: Box<dyn EventHandler<T>>,
    stats: Arc<StageStats>,
    config: NioConfig,
}

impl<T: Send + 'static> StageWrapper<T> {
    /// Build a stage. The queue's admission threshold comes from
    /// `config.queue_length` (-1 = unbounded).
    pub fn new(
        name: impl Into<String>,
        handler: Box<dyn EventHandler<T>>,
        source: Option<Arc<dyn ReadySource>>,
        config: NioConfig,
    ) -> Result<Self, StageError> {
        config.validate().map_err(StageError::Config)?;
        Ok(Self {
            name: name.into(),
            queue: Arc::new(EventQueue::with_threshold(config.queue_length)),
            source,
            handler,
            stats: Arc::new(StageStats::new()),
            config,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stage's event queue; producers enqueue into this.
    pub fn queue(&self) -> Arc<EventQueue<T>> {
        Arc::clone(&self.queue)
    }

    pub fn stats(&self) -> Arc<StageStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &NioConfig {
        &self.config
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        Arc<EventQueue<T>>,
        Option<Arc<dyn ReadySource>>,
        Box<dyn EventHandler<T>>,
        Arc<StageStats>,
        NioConfig,
    ) {
        (
            self.name,
            self.queue,
            self.source,
            self.handler,
            self.stats,
            self.config,
        )
    }
}
