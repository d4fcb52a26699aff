//! Bounded async hand-off queue with drop-oldest overflow.
//!
//! Producers never wait: when the queue is full the oldest item is evicted and
//! a warning is logged. Consumers await [`BoundedQueue::pop`] until an item
//! arrives or the queue is closed and drained.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// Capacity used for every bridge queue unless configured otherwise.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Result of pushing into a [`BoundedQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
    Closed,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped_total: u64,
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped_total: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues `item` without waiting, evicting the oldest entry when full.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut state = self.lock_state();
            if state.closed {
                return PushOutcome::Closed;
            }
            let mut outcome = PushOutcome::Queued;
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped_total = state.dropped_total.saturating_add(1);
                outcome = PushOutcome::DroppedOldest;
                tracing::warn!(
                    queue = self.name,
                    capacity = self.capacity,
                    dropped_total = state.dropped_total,
                    "queue full, dropped oldest item"
                );
            }
            state.items.push_back(item);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next item. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock_state();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock_state().items.pop_front()
    }

    /// Stops accepting new items and wakes every waiting consumer.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn len(&self) -> usize {
        self.lock_state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.lock_state().dropped_total
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
