use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct RelayEntry<T> {
    pub item: T,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub enum Dequeued<T> {
    Item(RelayEntry<T>),
    Timeout,
    /// The queue was closed, and all entries that were in it at the time have been dequeued
    Closed,
}

struct Inner<T> {
    entries: VecDeque<RelayEntry<T>>,
    closed: bool,
}

/// A bounded queue decoupling a producer with externally fixed cadence from a consumer with
///  variable latency.
///
/// The producer is never blocked: when the queue is full, [RelayQueue::enqueue] evicts the oldest
///  entry to make room. For live monitoring the freshest data is worth more than a stale backlog.
///
/// The lock is held only for O(1) deque operations and never across an await.
pub struct RelayQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    notify: Notify,
    num_evicted: AtomicU64,
}

impl<T> RelayQueue<T> {
    pub fn new(capacity: usize) -> RelayQueue<T> {
        assert!(capacity > 0, "relay queue capacity must be positive");

        RelayQueue {
            capacity,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            num_evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an item, evicting the oldest entry if the queue is full. The evicted entry is
    ///  returned. Items enqueued after [RelayQueue::close] are discarded.
    pub fn enqueue(&self, item: T) -> Option<RelayEntry<T>> {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                debug!("relay queue is closed - discarding item");
                return None;
            }

            let evicted = if inner.entries.len() >= self.capacity {
                inner.entries.pop_front()
            }
            else {
                None
            };
            inner.entries.push_back(RelayEntry {
                item,
                enqueued_at: Instant::now(),
            });
            evicted
        };

        if evicted.is_some() {
            let num_evicted = self.num_evicted.fetch_add(1, Ordering::Relaxed) + 1;
            trace!("relay queue full - evicted oldest entry ({} evictions so far)", num_evicted);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_dequeue(&self) -> Option<RelayEntry<T>> {
        self.inner.lock().unwrap().entries.pop_front()
    }

    /// Waits up to `timeout` for an entry. After the queue is closed, remaining entries are still
    ///  returned before [Dequeued::Closed].
    pub async fn dequeue(&self, timeout: Duration) -> Dequeued<T> {
        let deadline = Instant::now() + timeout;
        loop {
            // register for notification *before* checking, otherwise a wakeup between check and
            //  wait would be lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.entries.pop_front() {
                    return Dequeued::Item(entry);
                }
                if inner.closed {
                    return Dequeued::Closed;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Dequeued::Timeout;
            }
        }
    }

    /// Marks the queue as closed and wakes up all waiting consumers
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// total number of entries evicted to make room for newer ones
    pub fn num_evicted(&self) -> u64 {
        self.num_evicted.load(Ordering::Relaxed)
    }
}
