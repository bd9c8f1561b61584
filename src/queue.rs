//! Bounded hand-off between the transport and the pipeline workers.
//!
//! The transport side only ever waits for queue space, never for the store. When the
//! queue is full the configured [`BackpressurePolicy`] decides between waiting
//! a bounded time for space and evicting the oldest queued message.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

use crate::payload::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum BackpressurePolicy {
    /// Wait up to `timeout` for space, then reject the incoming message.
    BoundedWait { timeout: Duration },
    /// Evict the oldest queued message to make room.
    DropOldest,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::BoundedWait {
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// The message was enqueued after evicting the oldest one, returned here.
    DroppedOldest(Message),
    /// The message was not enqueued: no space in time, or the queue is closed.
    Rejected(Message),
}

#[derive(Debug)]
pub struct IngestQueue {
    items: Mutex<VecDeque<Message>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl IngestQueue {
    pub fn new(capacity: usize) -> IngestQueue {
        let capacity = capacity.max(1);
        IngestQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn push(&self, msg: Message, policy: BackpressurePolicy) -> PushOutcome {
        match policy {
            BackpressurePolicy::DropOldest => self.push_drop_oldest(msg),
            BackpressurePolicy::BoundedWait { timeout } => self.push_bounded(msg, timeout).await,
        }
    }

    fn push_drop_oldest(&self, msg: Message) -> PushOutcome {
        if self.is_closed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Rejected(msg);
        }
        let evicted = {
            let mut items = self.items.lock();
            let evicted = match items.len() >= self.capacity {
                true => items.pop_front(),
                false => None,
            };
            items.push_back(msg);
            evicted
        };
        self.not_empty.notify_one();
        match evicted {
            Some(oldest) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "[IngestQueue] queue full, dropped oldest message for '{}'",
                    oldest.path
                );
                PushOutcome::DroppedOldest(oldest)
            }
            None => PushOutcome::Enqueued,
        }
    }

    async fn push_bounded(&self, msg: Message, timeout: Duration) -> PushOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let space = self.not_full.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if self.is_closed() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::Rejected(msg);
            }
            {
                let mut items = self.items.lock();
                if items.len() < self.capacity {
                    items.push_back(msg);
                    drop(items);
                    self.not_empty.notify_one();
                    return PushOutcome::Enqueued;
                }
            }

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "[IngestQueue] queue full for {:?}, rejected message for '{}'",
                    timeout,
                    msg.path
                );
                return PushOutcome::Rejected(msg);
            }
        }
    }

    /// Next message in arrival order. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let available = self.not_empty.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            let next = self.items.lock().pop_front();
            if let Some(msg) = next {
                self.not_full.notify_one();
                return Some(msg);
            }
            if self.is_closed() {
                return None;
            }
            available.await;
        }
    }

    /// Stop accepting messages. Queued messages can still be popped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages lost to backpressure or to a closed queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg(path: &str) -> Message {
        Message::structural(path)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = IngestQueue::new(4);
        let wait = BackpressurePolicy::default();
        for path in ["a", "b", "c"] {
            assert_eq!(queue.push(msg(path), wait).await, PushOutcome::Enqueued);
        }
        assert_eq!(queue.pop().await.unwrap().path, "a");
        assert_eq!(queue.pop().await.unwrap().path, "b");
        assert_eq!(queue.pop().await.unwrap().path, "c");
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() {
        let queue = IngestQueue::new(2);
        let policy = BackpressurePolicy::DropOldest;
        queue.push(msg("a"), policy).await;
        queue.push(msg("b"), policy).await;
        match queue.push(msg("c"), policy).await {
            PushOutcome::DroppedOldest(oldest) => assert_eq!(oldest.path, "a"),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await.unwrap().path, "b");
        assert_eq!(queue.pop().await.unwrap().path, "c");
    }

    #[tokio::test]
    async fn test_bounded_wait_rejects_after_timeout() {
        let queue = IngestQueue::new(1);
        let policy = BackpressurePolicy::BoundedWait {
            timeout: Duration::from_millis(20),
        };
        assert_eq!(queue.push(msg("a"), policy).await, PushOutcome::Enqueued);
        match queue.push(msg("b"), policy).await {
            PushOutcome::Rejected(rejected) => assert_eq!(rejected.path, "b"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_bounded_wait_resumes_when_space_frees() {
        let queue = Arc::new(IngestQueue::new(1));
        let policy = BackpressurePolicy::BoundedWait {
            timeout: Duration::from_secs(5),
        };
        queue.push(msg("a"), policy).await;

        let producer = queue.clone();
        let blocked = tokio::spawn(async move { producer.push(msg("b"), policy).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pop().await.unwrap().path, "a");

        assert_eq!(blocked.await.unwrap(), PushOutcome::Enqueued);
        assert_eq!(queue.pop().await.unwrap().path, "b");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(IngestQueue::new(4));
        queue.push(msg("a"), BackpressurePolicy::DropOldest).await;
        queue.close();
        assert!(matches!(
            queue.push(msg("b"), BackpressurePolicy::DropOldest).await,
            PushOutcome::Rejected(_)
        ));
        assert_eq!(queue.pop().await.unwrap().path, "a");
        assert_eq!(queue.pop().await, None);

        let idle = Arc::new(IngestQueue::new(1));
        let consumer = idle.clone();
        let waiting = tokio::spawn(async move { consumer.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        idle.close();
        assert_eq!(waiting.await.unwrap(), None);
    }
}
