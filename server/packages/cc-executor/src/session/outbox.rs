use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutboxError {
    #[error("outbound queue is full ({capacity} messages)")]
    Overflow { capacity: usize },
    #[error("outbound queue is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub sequence: u64,
    pub payload: String,
}

#[derive(Debug, Default)]
struct OutboxInner {
    queue: VecDeque<PendingMessage>,
    next_sequence: u64,
    closed: bool,
    overflowed: bool,
}

/// Ordered, bounded queue of serialized frames for one session. Any task may
/// push; only the connection writer pops. Messages stay queued while the
/// session has no connection and are replayed, in order, to the next one.
#[derive(Debug)]
pub struct Outbox {
    inner: Mutex<OutboxInner>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(OutboxInner::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `payload`. Exceeding the capacity closes the outbox for good.
    pub fn push(&self, payload: String) -> Result<u64, OutboxError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(OutboxError::Closed);
        }
        if inner.queue.len() >= self.capacity {
            inner.closed = true;
            inner.overflowed = true;
            drop(inner);
            self.notify.notify_one();
            return Err(OutboxError::Overflow {
                capacity: self.capacity,
            });
        }
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        inner.queue.push_back(PendingMessage { sequence, payload });
        drop(inner);
        self.notify.notify_one();
        Ok(sequence)
    }

    pub fn try_pop(&self) -> Option<PendingMessage> {
        self.lock().queue.pop_front()
    }

    /// Puts back a message the writer failed to deliver.
    pub fn requeue_front(&self, message: PendingMessage) {
        self.lock().queue.push_front(message);
    }

    /// Resolves after the next push or close.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_overflowed(&self) -> bool {
        self.lock().overflowed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
