//! Queue backend abstraction and the two interchangeable implementations.
//!
//! The contract is at-least-once: a dequeued message that is never acked is
//! redelivered after its visibility timeout. Scheduler logic only ever sees
//! the `QueueBackend` trait; the variant is chosen once at construction.

pub mod adapter;
pub mod broker;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

pub use adapter::QueueAdapter;
pub use broker::BrokerQueue;
pub use stream::StreamQueue;

use crate::error::QueueError;
use crate::task::ScheduleMessage;

/// Opaque handle identifying one delivery of one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    pub delivery_id: Uuid,
    pub task_id: Uuid,
}

/// A dequeued message together with its delivery handle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub message: ScheduleMessage,
}

/// Uniform interface over a durable message queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a message. Fails with `QueueError::Full` at capacity.
    async fn enqueue(&self, message: ScheduleMessage) -> Result<(), QueueError>;

    /// Pull up to `batch_size` messages, blocking up to `wait_timeout` when
    /// none are available. Every returned message has had its
    /// `attempt_count` incremented for this delivery.
    async fn dequeue(
        &self,
        batch_size: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Permanently settle a delivery.
    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError>;

    /// Return a delivery to the queue, visible again after `requeue_delay`.
    async fn nack(&self, handle: &DeliveryHandle, requeue_delay: Duration)
        -> Result<(), QueueError>;

    /// Messages waiting for delivery (ready + delayed, excluding in-flight).
    async fn depth(&self) -> Result<usize, QueueError>;

    fn name(&self) -> &'static str;
}

/// Backend variant, selected once at construction from configuration.
#[derive(Debug, Clone)]
pub enum QueueBackendConfig {
    /// Append-ordered log with pending-entry reclaim. Strict arrival order.
    Stream {
        visibility_timeout: Duration,
        capacity: usize,
    },
    /// Priority-aware delivery with delayed requeue.
    Broker {
        visibility_timeout: Duration,
        capacity: usize,
    },
}

impl Default for QueueBackendConfig {
    fn default() -> Self {
        Self::Stream {
            visibility_timeout: Duration::from_secs(30),
            capacity: 10_000,
        }
    }
}

impl QueueBackendConfig {
    /// Build the configured backend.
    pub fn build(&self) -> Arc<dyn QueueBackend> {
        match *self {
            Self::Stream {
                visibility_timeout,
                capacity,
            } => Arc::new(StreamQueue::new(visibility_timeout, capacity)),
            Self::Broker {
                visibility_timeout,
                capacity,
            } => Arc::new(BrokerQueue::new(visibility_timeout, capacity)),
        }
    }
}
