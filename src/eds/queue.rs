//! Bounded blocking priority queue connecting stage producers to workers
//!
//! Ordering is `(priority ascending, enqueue sequence ascending)`; the
//! sequence counter guarantees FIFO among equal priorities, which the
//! reader relies on for request ordering. `enqueue` blocks while the queue
//! is full and `dequeue` blocks while it is empty; both are the only
//! suspension points in the runtime.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use thiserror::Error;

use crate::domain_types::QueueCapacity;
use crate::eds::event::StageEvent;

/// Errors surfaced by queue operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
}

struct Entry<E> {
    priority: u32,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    // Reversed so the max-heap pops the smallest (priority, seq) pair.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<E> {
    heap: BinaryHeap<Entry<E>>,
    next_seq: u64,
    closed: bool,
}

/// Bounded, thread-safe priority queue with blocking enqueue and dequeue.
pub struct EventQueue<E> {
    capacity: usize,
    inner: Mutex<Inner<E>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<E: StageEvent> EventQueue<E> {
    /// Creates an empty queue bounded at `capacity` events.
    pub fn new(capacity: QueueCapacity) -> Self {
        Self {
            capacity: capacity.as_usize(),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Adds an event, blocking while the queue is full.
    ///
    /// Returns [`QueueError::Closed`] once [`close`](Self::close) has been
    /// called, including for producers that were blocked at that moment.
    pub fn enqueue(&self, event: E) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        while !inner.closed && inner.heap.len() >= self.capacity {
            inner = self
                .not_full
                .wait(inner)
                .expect("queue mutex poisoned");
        }
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority: event.priority().as_u32(),
            seq,
            event,
        });
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the earliest event, blocking while the queue is empty.
    ///
    /// After [`close`](Self::close), remaining events are still handed out
    /// in order; once the queue is drained every caller gets
    /// [`QueueError::Closed`].
    pub fn dequeue(&self) -> Result<E, QueueError> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if let Some(entry) = inner.heap.pop() {
                self.not_full.notify_one();
                return Ok(entry.event);
            }
            if inner.closed {
                return Err(QueueError::Closed);
            }
            inner = self
                .not_empty
                .wait(inner)
                .expect("queue mutex poisoned");
        }
    }

    /// Closes the queue and wakes every blocked producer and consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").heap.len()
    }

    /// True when no events are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("queue mutex poisoned").closed
    }
}
