use super::Queue;
use crate::{error::QueueError, types::WorkUnit};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;

/// An unbounded, per-topic FIFO living in process memory.
///
/// Depth is the number of units pushed but not yet popped. Once closed,
/// pushes fail with [`QueueError::Closed`] while consumers may still drain
/// what is left.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, VecDeque<WorkUnit>>>,
    closed: AtomicBool,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest unit from `topic`, if any.
    pub fn pop(&self, topic: &str) -> Option<WorkUnit> {
        self.topics.lock().get_mut(topic)?.pop_front()
    }

    /// Waits for the next unit on `topic`.
    ///
    /// Returns `None` once the queue is closed and `topic` is drained.
    pub async fn recv(&self, topic: &str) -> Option<WorkUnit> {
        loop {
            // Register before checking so a concurrent push can't slip
            // between the check and the wait.
            let notified = self.notify.notified();
            if let Some(unit) = self.pop(topic) {
                return Some(unit);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().values().all(VecDeque::is_empty)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Removes and returns everything queued on `topic`.
    pub fn drain(&self, topic: &str) -> Vec<WorkUnit> {
        self.topics
            .lock()
            .get_mut(topic)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

impl Queue for MemoryQueue {
    async fn push(&self, topic: &str, unit: &WorkUnit) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push_back(unit.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self, topic: &str) -> Result<usize, QueueError> {
        Ok(self.len(topic))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
