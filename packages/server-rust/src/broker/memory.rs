//! In-process broker with at-least-once queues.
//!
//! Queues are created on first use. A subscription receives messages in
//! publish order; an unsettled delivery returns to the front of its queue
//! when dropped (for instance when the consuming task panics) and is handed
//! out again flagged as redelivered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{Acker, BrokerError, Delivery};
use crate::traits::{MessageBroker, Subscription};

#[derive(Debug)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: Mutex<VecDeque<Message>>,
    notify: Notify,
    next_tag: AtomicU64,
    unacked: AtomicUsize,
    closed: AtomicBool,
}

impl QueueState {
    fn push_back(&self, message: Message) {
        self.ready.lock().push_back(message);
        self.notify.notify_one();
    }

    fn requeue(&self, body: Vec<u8>) {
        self.ready.lock().push_front(Message {
            body,
            redelivered: true,
        });
        self.notify.notify_one();
    }

    fn pop(self: &Arc<Self>) -> Option<Delivery> {
        let message = self.ready.lock().pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.unacked.fetch_add(1, Ordering::SeqCst);
        let acker = MemoryAcker {
            queue: Arc::clone(self),
            tag,
            body: Some(message.body.clone()),
        };
        Some(Delivery::new(
            tag,
            message.body,
            message.redelivered,
            Box::new(acker),
        ))
    }
}

// ---------------------------------------------------------------------------
// MemoryAcker
// ---------------------------------------------------------------------------

/// Holds a copy of the body until the delivery is settled.
struct MemoryAcker {
    queue: Arc<QueueState>,
    tag: u64,
    body: Option<Vec<u8>>,
}

impl MemoryAcker {
    fn settle(&mut self, requeue: bool) {
        if let Some(body) = self.body.take() {
            self.queue.unacked.fetch_sub(1, Ordering::SeqCst);
            if requeue {
                debug!(tag = self.tag, "requeueing delivery");
                self.queue.requeue(body);
            }
        }
    }
}

impl Acker for MemoryAcker {
    fn ack(mut self: Box<Self>) {
        self.settle(false);
    }

    fn nack(mut self: Box<Self>, requeue: bool) {
        self.settle(requeue);
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.settle(true);
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// [`MessageBroker`] backed by in-process queues.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Make subsequent publishes fail with [`BrokerError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Close every queue. Waiting subscriptions end; publishes fail.
    pub fn close(&self) {
        for entry in &self.queues {
            entry.value().closed.store(true, Ordering::SeqCst);
            entry.value().notify.notify_waiters();
        }
    }

    /// Messages waiting to be delivered on `queue`.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map_or(0, |state| state.ready.lock().len())
    }

    /// Messages delivered on `queue` but not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map_or(0, |state| state.unacked.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("publishing disabled".to_string()));
        }
        let state = self.queue(queue);
        if state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        state.push_back(Message {
            body,
            redelivered: false,
        });
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let state = self.queue(queue);
        if state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(Box::new(MemorySubscription { queue: state }))
    }
}

struct MemorySubscription {
    queue: Arc<QueueState>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(delivery) = self.queue.pop() {
                return Some(delivery);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
