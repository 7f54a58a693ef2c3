use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::{Delivery, EventBusError, QueueName, Topology};

/// Delivery count after which a requeued message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Durable topic bus with at-least-once delivery.
///
/// Messages routed to a queue with a TTL are held back and, once expired,
/// re-published under the queue's dead-letter routing key. Consuming a TTL
/// queue is what drives that expiry.
#[async_trait]
pub trait EventBus: Send + Sync {
    fn topology(&self) -> &Topology;

    /// Declares the exchange, queues and bindings. Safe to call from every
    /// component on startup; only the first call does any work.
    async fn declare_topology(&self) -> Result<(), EventBusError>;

    /// Routes `payload` to every queue bound to `routing_key` and returns the
    /// number of queues it landed in (zero means unroutable, dropped).
    async fn publish(&self, routing_key: &str, payload: &str) -> Result<usize, EventBusError>;

    /// Takes the next message from any of `queues`, waiting up to `wait`.
    async fn consume(
        &self,
        queues: &[QueueName],
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, EventBusError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventBusError>;

    /// `requeue = false` discards the message. With `requeue = true` it goes
    /// back to its queue, or to the dead-letter queue once it has been
    /// delivered `max_deliveries` times.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), EventBusError>;

    /// Returns messages a previous incarnation of `consumer` took but never
    /// settled to the head of their ready queues. Each counts as a delivery,
    /// so a message at the delivery limit is dead-lettered instead.
    async fn recover_unacked(&self, queues: &[QueueName], consumer: &str) -> Result<usize, EventBusError>;

    /// [`EventBus::recover_unacked`] for every consumer named `<group>-<n>`,
    /// whatever concurrency the previous run used.
    async fn recover_consumer_group(&self, queues: &[QueueName], group: &str) -> Result<usize, EventBusError>;

    /// Ready plus delayed messages in `queue`.
    async fn queue_depth(&self, queue: QueueName) -> Result<usize, EventBusError>;
}

/// Name of the `index`th consumer of a worker group.
pub fn group_consumer(group: &str, index: usize) -> String {
    format!("{}-{}", group, index)
}

pub fn is_group_member(consumer: &str, group: &str) -> bool {
    consumer
        .strip_prefix(group)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

pub async fn publish_json<B, T>(bus: &B, routing_key: &str, event: &T) -> Result<usize, EventBusError>
where
    B: EventBus + ?Sized,
    T: Serialize + Sync,
{
    let payload = serde_json::to_string(event)?;
    let routed = bus.publish(routing_key, &payload).await?;
    debug!("Published {} to {} queue(s)", routing_key, routed);
    Ok(routed)
}
