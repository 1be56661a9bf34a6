//! A thread-safe delay queue. Each element carries a reveal time; `pop`
//! waits until the earliest reveal time has arrived.
//!
//! The store uses one of these to drive product eviction: every insertion
//! pushes the product index with the residence delay, and a single
//! eviction task pops.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Queue entry. Ordered so the binary heap surfaces the earliest reveal
/// time first, with insertion order breaking ties.
struct Entry<V> {
    at: Instant,
    seq: u64,
    value: V,
}

impl<V> PartialEq for Entry<V> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<V> Eq for Entry<V> {}

impl<V> Ord for Entry<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the earliest.
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl<V> PartialOrd for Entry<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner<V> {
    heap: Mutex<BinaryHeap<Entry<V>>>,
    notify: Notify,
    seq: Mutex<u64>,
}

/// A delay queue. Cheap to clone; clones share the same queue.
pub struct DelayQueue<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for DelayQueue<V> {
    fn clone(&self) -> Self {
        DelayQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Default for DelayQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DelayQueue<V> {
    pub fn new() -> Self {
        DelayQueue {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                seq: Mutex::new(0),
            }),
        }
    }

    /// Schedules a value to become available after `delay`.
    pub fn push(&self, value: V, delay: Duration) {
        let mut heap = self.inner.heap.lock();
        let seq = {
            let mut seq = self.inner.seq.lock();
            *seq += 1;
            *seq
        };
        heap.push(Entry {
            at: Instant::now() + delay,
            seq,
            value,
        });
        drop(heap);
        self.inner.notify.notify_waiters();
    }

    /// Removes and returns the value with the earliest reveal time not
    /// later than now, waiting as long as necessary. Concurrent pops see
    /// each element at most once.
    pub async fn pop(&self) -> V {
        loop {
            // Register for wakeups before inspecting the heap so a push
            // between the peek and the await is never missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut heap = self.inner.heap.lock();
                match heap.peek() {
                    Some(entry) if entry.at <= Instant::now() => {
                        return heap.pop().expect("peeked entry").value;
                    }
                    Some(entry) => Some(entry.at),
                    None => None,
                }
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at.into()) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.heap.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// Drops every queued element.
    pub fn clear(&self) {
        self.inner.heap.lock().clear();
    }
}
