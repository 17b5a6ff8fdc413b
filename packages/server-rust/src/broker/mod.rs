//! Message broker port and the in-process adapter.
//!
//! The provisioning gateway publishes envelopes through [`MessageBroker`];
//! the coordinator consumes them through a [`Subscription`]. Each message
//! arrives as a [`Delivery`] that must be settled with [`Delivery::ack`] or
//! [`Delivery::nack`]. A delivery dropped unsettled is requeued.
//!
//! [`MemoryBroker`] keeps queues in process; [`AmqpBroker`] (feature `amqp`)
//! talks to RabbitMQ, where queued and unacknowledged requests outlive the
//! server process.
//!
//! [`MessageBroker`]: crate::traits::MessageBroker
//! [`Subscription`]: crate::traits::Subscription

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Failure to reach or use the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is unavailable: {0}")]
    Unavailable(String),
    #[error("broker connection closed")]
    Closed,
}

/// Settles a delivery with the broker that produced it.
pub trait Acker: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>, requeue: bool);
}

/// One message handed to a consumer, owned until it is settled.
pub struct Delivery {
    /// Broker-assigned tag, unique per queue.
    pub tag: u64,
    pub body: Vec<u8>,
    /// Set when the message was handed out before and not acknowledged.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    #[must_use]
    pub fn new(tag: u64, body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            tag,
            body,
            redelivered,
            acker,
        }
    }

    /// Remove the message from the queue for good.
    pub fn ack(self) {
        self.acker.ack();
    }

    /// Reject the message, optionally putting it back on the queue.
    pub fn nack(self, requeue: bool) {
        self.acker.nack(requeue);
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
