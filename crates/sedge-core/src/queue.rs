//! Bounded event queue with admission control.
//!
//! One `EventQueue` backs each stage. Producers from arbitrary threads
//! enqueue; the stage's single worker dequeues, either non-blocking
//! (batch drain) or blocking with a bounded timeout. Admission is
//! delegated to a pluggable predicate so the capacity policy stays
//! separate from the container, with [`ThresholdPredicate`] as the
//! stock length-based policy.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::sink::{EventSink, SinkError};

/// Admission check run before an item is appended.
///
/// `pending` is the queue length at the moment of the check; returning
/// `false` rejects the item.
pub trait EnqueuePredicate<T>: Send + Sync {
    fn accept(&self, pending: usize, item: &T) -> bool;
}

/// Length-threshold admission policy.
///
/// A threshold of `-1` admits everything; otherwise enqueue is rejected
/// once the queue already holds `threshold` items.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdPredicate {
    threshold: i64,
}

impl ThresholdPredicate {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    #[inline]
    pub fn threshold(&self) -> i64 {
        self.threshold
    }
}

impl<T> EnqueuePredicate<T> for ThresholdPredicate {
    #[inline]
    fn accept(&self, pending: usize, _item: &T) -> bool {
        self.threshold < 0 || (pending as i64) < self.threshold
    }
}

struct QueueInner<T> {
    buf: VecDeque<T>,
    shutdown: bool,
}

/// FIFO event queue: many producers, one consuming worker.
///
/// Blocking happens only in the `blocking_dequeue*` calls; every
/// producer-side operation returns immediately.
pub struct EventQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
    predicate: Option<Box<dyn EnqueuePredicate<T>>>,
}

impl<T: Send> EventQueue<T> {
    /// Create an unbounded queue (no admission predicate).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buf: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            predicate: None,
        }
    }

    /// Create a queue with the stock threshold policy.
    /// A threshold of `-1` is equivalent to [`EventQueue::new`].
    pub fn with_threshold(threshold: i64) -> Self {
        if threshold < 0 {
            Self::new()
        } else {
            Self::with_predicate(Box::new(ThresholdPredicate::new(threshold)))
        }
    }

    /// Create a queue with a custom admission predicate.
    pub fn with_predicate(predicate: Box<dyn EnqueuePredicate<T>>) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    /// Mark the consumer as gone. Pending items stay dequeueable, but
    /// every further enqueue fails with `SinkError::Closed` and blocked
    /// dequeuers are woken.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Append one item, subject to the admission predicate.
    pub fn enqueue(&self, item: T) -> Result<(), SinkError<T>> {
        let mut inner = self.lock();
        if inner.shutdown {
            return Err(SinkError::Closed(item));
        }
        if let Some(pred) = &self.predicate {
            if !pred.accept(inner.buf.len(), &item) {
                return Err(SinkError::Full(item));
            }
        }
        inner.buf.push_back(item);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Best-effort enqueue: a full queue silently drops the item.
    /// Returns whether the item was accepted.
    pub fn enqueue_lossy(&self, item: T) -> bool {
        self.enqueue(item).is_ok()
    }

    /// Take up to `max` items without blocking. `None` when empty.
    pub fn dequeue(&self, max: usize) -> Option<Vec<T>> {
        let mut inner = self.lock();
        Self::drain(&mut inner, max)
    }

    /// Take everything without blocking. `None` when empty.
    pub fn dequeue_all(&self) -> Option<Vec<T>> {
        let mut inner = self.lock();
        Self::drain(&mut inner, usize::MAX)
    }

    /// Wait up to `timeout` for at least one item, then take up to
    /// `max`. `None` on timeout.
    pub fn blocking_dequeue(&self, timeout: Duration, max: usize) -> Option<Vec<T>> {
        let mut inner = self.wait_nonempty(timeout)?;
        Self::drain(&mut inner, max)
    }

    /// Wait up to `timeout` for at least one item, then take them all.
    /// `None` on timeout.
    pub fn blocking_dequeue_all(&self, timeout: Duration) -> Option<Vec<T>> {
        let mut inner = self.wait_nonempty(timeout)?;
        Self::drain(&mut inner, usize::MAX)
    }

    fn wait_nonempty(&self, timeout: Duration) -> Option<MutexGuard<'_, QueueInner<T>>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.buf.is_empty() {
            if inner.shutdown {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
        Some(inner)
    }

    fn drain(inner: &mut QueueInner<T>, max: usize) -> Option<Vec<T>> {
        if inner.buf.is_empty() {
            return None;
        }
        let take = inner.buf.len().min(max);
        Some(inner.buf.drain(..take).collect())
    }
}

impl<T: Send> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> EventSink<T> for EventQueue<T> {
    fn enqueue(&self, item: T) -> Result<(), SinkError<T>> {
        EventQueue::enqueue(self, item)
    }

    fn enqueue_lossy(&self, item: T) -> bool {
        EventQueue::enqueue_lossy(self, item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = EventQueue::new();
        for i in 0..5 {
            q.enqueue(i).unwrap();
        }
        assert_eq!(q.dequeue_all().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(q.dequeue_all().is_none());
    }

    #[test]
    fn threshold_rejects_then_admits_after_drain() {
        // Threshold 2: A, B admitted; C rejected; after one dequeue, C fits.
        let q = EventQueue::with_threshold(2);
        q.enqueue("a").unwrap();
        q.enqueue("b").unwrap();
        match q.enqueue("c") {
            Err(SinkError::Full(item)) => assert_eq!(item, "c"),
            other => panic!("expected Full, got {:?}", other.map_err(|e| e.into_inner())),
        }
        assert_eq!(q.dequeue(1).unwrap(), vec!["a"]);
        q.enqueue("c").unwrap();
        assert_eq!(q.dequeue_all().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn negative_threshold_is_unbounded() {
        let q = EventQueue::with_threshold(-1);
        for i in 0..10_000 {
            q.enqueue(i).unwrap();
        }
        assert_eq!(q.len(), 10_000);
    }

    #[test]
    fn lossy_enqueue_drops_on_full() {
        let q = EventQueue::with_threshold(1);
        assert!(q.enqueue_lossy(1));
        assert!(!q.enqueue_lossy(2));
        assert_eq!(q.dequeue_all().unwrap(), vec![1]);
    }

    #[test]
    fn dequeue_respects_max() {
        let q = EventQueue::new();
        for i in 0..6 {
            q.enqueue(i).unwrap();
        }
        assert_eq!(q.dequeue(4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(q.dequeue(4).unwrap(), vec![4, 5]);
    }

    #[test]
    fn blocking_dequeue_times_out() {
        let q: EventQueue<u32> = EventQueue::new();
        let start = Instant::now();
        assert!(q.blocking_dequeue(Duration::from_millis(20), 8).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn blocking_dequeue_wakes_on_enqueue() {
        let q = Arc::new(EventQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                q.enqueue(42u32).unwrap();
            })
        };
        let got = q.blocking_dequeue_all(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(got.unwrap(), vec![42]);
    }

    #[test]
    fn shutdown_rejects_producers_but_drains() {
        let q = EventQueue::new();
        q.enqueue(1).unwrap();
        q.shutdown();
        match q.enqueue(2) {
            Err(SinkError::Closed(item)) => assert_eq!(item, 2),
            _ => panic!("expected Closed"),
        }
        assert_eq!(q.dequeue_all().unwrap(), vec![1]);
        // Empty + shut down: blocking dequeue returns immediately.
        assert!(q.blocking_dequeue_all(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        let q = Arc::new(EventQueue::with_threshold(-1));
        let mut handles = vec![];
        for t in 0..4 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    q.enqueue(t * 1000 + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut total = 0;
        while let Some(batch) = q.dequeue(64) {
            total += batch.len();
        }
        assert_eq!(total, 1000);
    }

    struct EvenOnly;
    impl EnqueuePredicate<u32> for EvenOnly {
        fn accept(&self, _pending: usize, item: &u32) -> bool {
            item % 2 == 0
        }
    }

    #[test]
    fn custom_predicate() {
        let q = EventQueue::with_predicate(Box::new(EvenOnly));
        q.enqueue(2).unwrap();
        assert!(matches!(q.enqueue(3), Err(SinkError::Full(3))));
        assert_eq!(q.dequeue_all().unwrap(), vec![2]);
    }
}
