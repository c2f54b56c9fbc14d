//! Bounded task queues shared between a resource's proxies and its workers.
//!
//! A [`TaskQueue`] is a cloneable handle to one bounded FIFO. Producers wait
//! when it is full and consumers wait when it is empty; waiting is a
//! notify-or-poll loop so a missed wake-up costs at most one poll interval.
//! The put-lock makes a group of puts (for example one STOP per worker)
//! indivisible with respect to other producers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flowpool_core::Status;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

/// Default back-off between empty/full re-checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What a worker should do with a task message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Process,
    Stop,
}

/// Inbound message: a unit of work (or a stop signal) for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub uuid: Uuid,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl TaskMessage {
    pub fn process(payload: Value) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            command: Command::Process,
            payload: Some(payload),
        }
    }

    pub fn stop() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            command: Command::Stop,
            payload: None,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.command == Command::Stop
    }
}

/// Outbound message: the outcome of one PROCESS task, matched by `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub status: Status,
}

impl ResultMessage {
    pub const fn ok(uuid: Uuid, payload: Value) -> Self {
        Self {
            uuid,
            payload: Some(payload),
            status: Status::ok(),
        }
    }

    pub const fn failed(uuid: Uuid, status: Status) -> Self {
        Self {
            uuid,
            payload: None,
            status,
        }
    }
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A plain mapping could not be coerced into the queue's message type.
    #[error("Payload does not match the queue message type: {0}")]
    Coerce(#[from] serde_json::Error),
}

struct QueueInner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    poll_interval: Duration,
    not_empty: Notify,
    not_full: Notify,
    put_lock: tokio::sync::Mutex<()>,
}

/// Bounded multi-producer multi-consumer queue.
pub struct TaskQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl<T> TaskQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                poll_interval,
                not_empty: Notify::new(),
                not_full: Notify::new(),
                put_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without waiting. Hands the item back when the queue is full.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items();
            if items.len() >= self.inner.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.inner.not_empty.notify_waiters();
        Ok(())
    }

    /// Dequeue without waiting.
    pub fn try_get(&self) -> Option<T> {
        let item = self.items().pop_front();
        if item.is_some() {
            self.inner.not_full.notify_waiters();
        }
        item
    }

    /// Enqueue, waiting for room. Serialised against grouped puts.
    pub async fn put(&self, item: T) {
        let _lock = self.inner.put_lock.lock().await;
        self.put_unlocked(item).await;
    }

    /// Dequeue, waiting until an item is available.
    ///
    /// Cancel-safe: an item is only removed once the future completes.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_get() {
                return item;
            }
            let _ = tokio::time::timeout(self.inner.poll_interval, notified).await;
        }
    }

    async fn put_unlocked(&self, mut item: T) {
        loop {
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_put(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
            let _ = tokio::time::timeout(self.inner.poll_interval, notified).await;
        }
    }

    /// Take the put-lock. Other producers' `put` calls wait until the guard
    /// is dropped.
    pub async fn lock_puts(&self) -> PutGuard<'_, T> {
        PutGuard {
            queue: self,
            _lock: self.inner.put_lock.lock().await,
        }
    }

    /// Push an item back to the head of the queue, ignoring capacity.
    pub fn requeue_front(&self, item: T) {
        self.items().push_front(item);
        self.inner.not_empty.notify_waiters();
    }

    /// Keep only the items matching `keep`. Returns how many were removed.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let removed = {
            let mut items = self.items();
            let before = items.len();
            items.retain(|item| keep(item));
            before - items.len()
        };
        if removed > 0 {
            self.inner.not_full.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Whether two handles refer to the same underlying queue.
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: DeserializeOwned> TaskQueue<T> {
    /// Coerce a plain JSON mapping into the message type and enqueue it.
    pub async fn put_mapping(&self, value: Value) -> Result<(), QueueError> {
        let item: T = serde_json::from_value(value)?;
        self.put(item).await;
        Ok(())
    }
}

/// Exclusive producer access to a queue; see [`TaskQueue::lock_puts`].
pub struct PutGuard<'a, T> {
    queue: &'a TaskQueue<T>,
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

impl<T> PutGuard<'_, T> {
    pub async fn put(&self, item: T) {
        self.queue.put_unlocked(item).await;
    }
}
