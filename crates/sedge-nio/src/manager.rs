//! Stage thread manager and the per-stage worker loop.
//!
//! One dedicated OS thread per stage, started at registration and
//! running until process exit. The worker is the sole consumer of its
//! stage's queue and multiplexer; blocking happens only at those two
//! dequeue points, so a slow handler stalls its own stage and nothing
//! else.
//!
//! Deregistration is deliberately unsupported: stages are permanent for
//! the process lifetime, and asking to remove one is a programming
//! error that fails loudly.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sedge_core::{nerror, ninfo, EventQueue};

use crate::config::NioConfig;
use crate::error::StageError;
use crate::select::ReadySource;
use crate::stage::{AggregationHint, EventHandler, StageEvent, StageStats, StageWrapper};

/// Handle returned from registration: the producer-facing surface of a
/// running stage.
pub struct StageHandle<T> {
    name: String,
    queue: Arc<EventQueue<T>>,
    stats: Arc<StageStats>,
}

impl<T> StageHandle<T> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> Arc<EventQueue<T>> {
        Arc::clone(&self.queue)
    }

    pub fn stats(&self) -> Arc<StageStats> {
        Arc::clone(&self.stats)
    }

    /// Tear the stage down. Always fails: deregistration is not
    /// supported by this layer.
    pub fn destroy(&self, manager: &ThreadManager) -> Result<(), StageError> {
        manager.deregister(&self.name)
    }
}

/// Spawns and tracks one worker thread per registered stage.
pub struct ThreadManager {
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    fn threads(&self) -> MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stage: init its handler, then start its worker.
    pub fn register<T: Send + 'static>(
        &self,
        stage: StageWrapper<T>,
        hint: Arc<dyn AggregationHint>,
    ) -> Result<StageHandle<T>, StageError> {
        let (name, queue, source, mut handler, stats, config) = stage.into_parts();
        handler.init(&config);

        let handle = StageHandle {
            name: name.clone(),
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
        };

        let thread = thread::Builder::new()
            .name(format!("sedge-worker <{}>", name))
            .spawn(move || worker_loop(name, queue, source, handler, stats, config, hint))
            .map_err(StageError::SpawnFailed)?;

        self.threads().push((handle.name.clone(), thread));
        Ok(handle)
    }

    /// Not supported: stages are permanent for the process lifetime.
    pub fn deregister(&self, _stage: &str) -> Result<(), StageError> {
        Err(StageError::DeregisterUnsupported)
    }

    /// Not supported: stages are permanent for the process lifetime.
    pub fn deregister_all(&self) -> Result<(), StageError> {
        Err(StageError::DeregisterUnsupported)
    }

    pub fn num_stages(&self) -> usize {
        self.threads().len()
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop<T: Send + 'static>(
    name: String,
    queue: Arc<EventQueue<T>>,
    source: Option<Arc<dyn ReadySource>>,
    mut handler: Box<dyn EventHandler<T>>,
    stats: Arc<StageStats>,
    config: NioConfig,
    hint: Arc<dyn AggregationHint>,
) {
    ninfo!("{}: worker started", name);
    loop {
        run_iteration(
            &name,
            &queue,
            source.as_ref(),
            handler.as_mut(),
            &stats,
            &config,
            hint.as_ref(),
        );
        // Give other stages' workers a turn before looping.
        thread::yield_now();
    }
}

/// One pass of the worker state machine:
/// drain-queue-while-no-handles → readiness spin → queue spin.
fn run_iteration<T: Send>(
    name: &str,
    queue: &EventQueue<T>,
    source: Option<&Arc<dyn ReadySource>>,
    handler: &mut dyn EventHandler<T>,
    stats: &StageStats,
    config: &NioConfig,
    hint: &dyn AggregationHint,
) {
    let agg = hint.aggregation_target();

    match source {
        None => {
            // Queue-only stage: a single bounded blocking drain per
            // iteration keeps the worker parked while idle.
            if let Some(items) = drain_blocking(queue, agg, config.event_queue_timeout) {
                dispatch(name, handler, queued(items));
            }
            return;
        }
        Some(src) => {
            // Nothing watched yet: a multiplex call would be wasted, so
            // serve queued control events until handles appear.
            while src.num_active() == 0 {
                if let Some(items) = drain_blocking(queue, agg, config.event_queue_timeout) {
                    dispatch(name, handler, queued(items));
                }
            }

            for _ in 0..config.select_spin {
                let batch = if agg < 0 {
                    src.blocking_dequeue_all(config.select_timeout)
                } else {
                    src.blocking_dequeue(config.select_timeout, agg as usize)
                };
                if let Some(events) = batch {
                    let len = events.len();
                    if len == 0 {
                        continue;
                    }
                    let start = Instant::now();
                    dispatch(
                        name,
                        handler,
                        events.into_iter().map(StageEvent::Ready).collect(),
                    );
                    stats.record_service_rate(len, start.elapsed());
                }
            }
        }
    }

    for _ in 0..config.event_queue_spin {
        let batch = if agg < 0 {
            queue.dequeue_all()
        } else {
            queue.dequeue(agg as usize)
        };
        if let Some(items) = batch {
            dispatch(name, handler, queued(items));
            break;
        }
    }
}

fn drain_blocking<T: Send>(queue: &EventQueue<T>, agg: i64, timeout: Duration) -> Option<Vec<T>> {
    if agg < 0 {
        queue.blocking_dequeue_all(timeout)
    } else {
        queue.blocking_dequeue(timeout, agg as usize)
    }
}

fn queued<T>(items: Vec<T>) -> Vec<StageEvent<T>> {
    items.into_iter().map(StageEvent::Queued).collect()
}

/// Hand a batch to the handler. Handler faults are isolated: logged,
/// and the batch is considered processed.
fn dispatch<T>(name: &str, handler: &mut dyn EventHandler<T>, batch: Vec<StageEvent<T>>) {
    if batch.is_empty() {
        return;
    }
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.handle_events(batch))) {
        nerror!(
            "{}: handler fault during dispatch: {}",
            name,
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<opaque panic payload>"
    }
}
