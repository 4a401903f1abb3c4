//! Bounded delivery queue between a broker pump and its stream consumers.
//!
//! A pump pushes payloads in; any number of consumers drain them
//! competitively through [`MsgStream`] handles — each item goes to exactly
//! one consumer. The queue is bounded: when full, the oldest item is dropped
//! and the drop is reported through the installed hook so a slow consumer
//! can never wedge the backend connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use super::BrokerError;

type DropHook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct DeliveryQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    drop_hook: Option<DropHook>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    err: Option<BrokerError>,
}

impl<T> DeliveryQueue<T> {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Self::build(capacity, None)
    }

    pub(crate) fn with_drop_hook(capacity: usize, hook: DropHook) -> Arc<Self> {
        Self::build(capacity, Some(hook))
    }

    fn build(capacity: usize, drop_hook: Option<DropHook>) -> Arc<Self> {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                err: None,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            drop_hook,
        })
    }

    /// Enqueue an item, evicting the oldest one on overflow.
    ///
    /// Items pushed after [`close`](Self::close) are discarded.
    pub(crate) fn push(&self, item: T) {
        let mut dropped = false;
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            if state.items.len() == self.capacity {
                state.items.pop_front();
                dropped = true;
            }
            state.items.push_back(item);
        }
        if dropped {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped_total = total, "delivery queue overflow, oldest item dropped");
            if let Some(hook) = &self.drop_hook {
                hook();
            }
        }
        self.notify.notify_one();
    }

    /// Dequeue the next item, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub(crate) async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(item) = state.items.pop_front() {
                    if !state.items.is_empty() {
                        // keep waking co-consumers while items remain
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. The first close wins; a later close cannot replace
    /// an error already recorded by the pump.
    pub(crate) fn close(&self, err: Option<BrokerError>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.err = err;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// The error that closed the queue, if any.
    pub(crate) fn error(&self) -> Option<BrokerError> {
        self.state.lock().unwrap().err.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Items evicted by overflow so far.
    #[cfg(test)]
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A handle on a broker stream.
///
/// Handles are cheap to clone; all clones drain the same underlying queue,
/// so each payload is received by exactly one of them.
pub struct MsgStream<T> {
    queue: Arc<DeliveryQueue<T>>,
}

impl<T> Clone for MsgStream<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> MsgStream<T> {
    pub(crate) fn new(queue: Arc<DeliveryQueue<T>>) -> Self {
        Self { queue }
    }

    /// Receive the next payload; `None` when the stream has closed.
    pub async fn recv(&self) -> Option<T> {
        self.queue.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn push_then_recv() {
        let q = DeliveryQueue::new(4);
        q.push(1);
        q.push(2);
        assert_eq!(q.recv().await, Some(1));
        assert_eq!(q.recv().await, Some(2));
    }

    #[tokio::test]
    async fn recv_waits_for_push() {
        let q = DeliveryQueue::new(4);
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(7);
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let q = DeliveryQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.recv().await, Some(2));
        assert_eq!(q.recv().await, Some(3));
    }

    #[tokio::test]
    async fn drop_hook_fires() {
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let q = DeliveryQueue::with_drop_hook(
            1,
            Box::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        );
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = DeliveryQueue::new(4);
        q.push(1);
        q.close(Some(BrokerError::Unavailable("backend gone".into())));
        assert_eq!(q.recv().await, Some(1));
        assert_eq!(q.recv().await, None);
        assert!(matches!(q.error(), Some(BrokerError::Unavailable(_))));

        // second close does not overwrite the recorded error
        q.close(None);
        assert!(matches!(q.error(), Some(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn competitive_consumers_each_get_items_once() {
        let q = DeliveryQueue::new(64);
        let s1 = MsgStream::new(q.clone());
        let s2 = MsgStream::new(q.clone());

        let t1 = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(v) = s1.recv().await {
                got.push(v);
            }
            got
        });
        let t2 = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(v) = s2.recv().await {
                got.push(v);
            }
            got
        });

        for i in 0..50 {
            q.push(i);
            tokio::task::yield_now().await;
        }
        q.close(None);

        let mut all = t1.await.unwrap();
        all.extend(t2.await.unwrap());
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }
}
