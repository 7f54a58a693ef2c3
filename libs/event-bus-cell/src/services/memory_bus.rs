use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::services::bus::{is_group_member, EventBus, DEFAULT_MAX_DELIVERIES};
use crate::{DeathReason, Delivery, Envelope, EventBusError, QueueName, Topology};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    delayed: Vec<(Instant, Envelope)>,
}

#[derive(Default)]
struct BusState {
    queues: HashMap<QueueName, QueueState>,
    unacked: HashMap<String, Vec<(QueueName, Envelope)>>,
    fail_publishes: bool,
}

/// Process-local broker with the same routing, TTL and delivery-limit
/// behaviour as [`crate::RedisEventBus`]. Uses tokio's clock so tests can
/// run with paused time.
pub struct InMemoryEventBus {
    topology: Topology,
    max_deliveries: u32,
    state: Mutex<BusState>,
    notify: Notify,
    declared: OnceCell<()>,
}

impl InMemoryEventBus {
    pub fn new(topology: Topology) -> Self {
        Self::with_max_deliveries(topology, DEFAULT_MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(topology: Topology, max_deliveries: u32) -> Self {
        Self {
            topology,
            max_deliveries: max_deliveries.max(1),
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
            declared: OnceCell::new(),
        }
    }

    /// Makes every subsequent publish fail, for exercising publish-failure paths.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Snapshot of the ready and delayed messages of `queue`, oldest first.
    pub fn messages(&self, queue: QueueName) -> Vec<Envelope> {
        let state = self.lock();
        state
            .queues
            .get(&queue)
            .map(|q| {
                q.ready
                    .iter()
                    .cloned()
                    .chain(q.delayed.iter().map(|(_, env)| env.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, consumer: &str) -> usize {
        self.lock().unacked.get(consumer).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route_into(&self, state: &mut BusState, envelope: &Envelope, now: Instant) -> usize {
        let targets = self.topology.route(&envelope.routing_key);
        for queue in &targets {
            let ttl = self.topology.queue(*queue).and_then(|spec| spec.message_ttl());
            let entry = state.queues.entry(*queue).or_default();
            match ttl {
                Some(ttl) => entry.delayed.push((now + ttl, envelope.clone())),
                None => entry.ready.push_back(envelope.clone()),
            }
        }
        targets.len()
    }

    fn expire_due(&self, state: &mut BusState, queue: QueueName, now: Instant) {
        let Some(dlx_key) = self
            .topology
            .queue(queue)
            .and_then(|spec| spec.dead_letter_routing_key.clone())
        else {
            return;
        };

        let due: Vec<Envelope> = match state.queues.get_mut(&queue) {
            Some(q) => {
                let (due, waiting): (Vec<_>, Vec<_>) =
                    q.delayed.drain(..).partition(|(expires_at, _)| *expires_at <= now);
                q.delayed = waiting;
                due.into_iter().map(|(_, env)| env).collect()
            }
            None => return,
        };

        for envelope in due {
            let moved = envelope.dead_lettered(queue, DeathReason::Expired, &dlx_key);
            let routed = self.route_into(state, &moved, now);
            debug!("Message {} expired from {} and was routed to {} queue(s)", envelope.message_id, queue, routed);
        }
    }

    fn next_expiry(&self, state: &BusState, queues: &[QueueName]) -> Option<Instant> {
        queues
            .iter()
            .filter_map(|q| state.queues.get(q))
            .flat_map(|q| q.delayed.iter().map(|(at, _)| *at))
            .min()
    }

    fn take_unacked(&self, state: &mut BusState, delivery: &Delivery) -> Result<Envelope, EventBusError> {
        let held = state
            .unacked
            .get_mut(&delivery.consumer)
            .ok_or_else(|| EventBusError::UnknownDelivery(delivery.raw.clone()))?;
        let index = held
            .iter()
            .position(|(_, env)| delivery_tag(env) == delivery.raw)
            .ok_or_else(|| EventBusError::UnknownDelivery(delivery.raw.clone()))?;
        Ok(held.remove(index).1)
    }

    /// Requeues an envelope that was handed out but not acked. At the
    /// delivery limit it goes to the dead-letter queue instead. `front`
    /// puts it back at the head of its queue.
    fn redeliver(&self, state: &mut BusState, queue: QueueName, envelope: Envelope, front: bool) {
        let requeued = envelope.redelivered();
        if requeued.delivery_count >= self.max_deliveries {
            warn!(
                "Message {} hit the delivery limit ({}) on {}, dead-lettering",
                envelope.message_id, self.max_deliveries, queue
            );
            let moved = envelope.dead_lettered(queue, DeathReason::DeliveryLimit, QueueName::DeadLetter.routing_key());
            self.route_into(state, &moved, Instant::now());
            return;
        }

        let ready = &mut state.queues.entry(queue).or_default().ready;
        if front {
            ready.push_front(requeued);
        } else {
            ready.push_back(requeued);
        }
    }

    fn recover_consumer(&self, state: &mut BusState, queues: &[QueueName], consumer: &str) -> usize {
        let held = state.unacked.remove(consumer).unwrap_or_default();
        let (recover, keep): (Vec<_>, Vec<_>) = held.into_iter().partition(|(q, _)| queues.contains(q));
        if !keep.is_empty() {
            state.unacked.insert(consumer.to_string(), keep);
        }

        // Newest first, so the oldest ends up at the head
        let count = recover.len();
        for (queue, envelope) in recover.into_iter().rev() {
            self.redeliver(state, queue, envelope, true);
        }
        count
    }
}

fn delivery_tag(envelope: &Envelope) -> String {
    format!("{}:{}", envelope.message_id, envelope.delivery_count)
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn declare_topology(&self) -> Result<(), EventBusError> {
        self.declared
            .get_or_init(|| async {
                let mut state = self.lock();
                for spec in &self.topology.queues {
                    state.queues.entry(spec.name).or_default();
                }
                info!(
                    "Declared exchange {} with {} queues (in-memory)",
                    self.topology.exchange.name,
                    self.topology.queues.len()
                );
            })
            .await;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &str) -> Result<usize, EventBusError> {
        self.declare_topology().await?;

        let routed = {
            let mut state = self.lock();
            if state.fail_publishes {
                return Err(EventBusError::PublishRejected("broker unavailable".to_string()));
            }
            let envelope = Envelope::new(routing_key, payload);
            self.route_into(&mut state, &envelope, Instant::now())
        };

        if routed == 0 {
            warn!("Message with routing key {} matched no queue and was dropped", routing_key);
        }
        self.notify.notify_waiters();
        Ok(routed)
    }

    async fn consume(
        &self,
        queues: &[QueueName],
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, EventBusError> {
        self.declare_topology().await?;
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.lock();
                let now = Instant::now();

                for queue in queues {
                    self.expire_due(&mut state, *queue, now);
                }

                for queue in queues {
                    let popped = state.queues.get_mut(queue).and_then(|q| q.ready.pop_front());
                    if let Some(envelope) = popped {
                        let raw = delivery_tag(&envelope);
                        state
                            .unacked
                            .entry(consumer.to_string())
                            .or_default()
                            .push((*queue, envelope.clone()));
                        return Ok(Some(Delivery {
                            queue: *queue,
                            consumer: consumer.to_string(),
                            envelope,
                            raw,
                        }));
                    }
                }

                self.next_expiry(&state, queues)
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventBusError> {
        let mut state = self.lock();
        self.take_unacked(&mut state, delivery)?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), EventBusError> {
        {
            let mut state = self.lock();
            let envelope = self.take_unacked(&mut state, delivery)?;

            if !requeue {
                debug!("Message {} rejected without requeue", envelope.message_id);
                return Ok(());
            }

            self.redeliver(&mut state, delivery.queue, envelope, false);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover_unacked(&self, queues: &[QueueName], consumer: &str) -> Result<usize, EventBusError> {
        let recovered = {
            let mut state = self.lock();
            self.recover_consumer(&mut state, queues, consumer)
        };

        if recovered > 0 {
            info!("Recovered {} unacked message(s) for consumer {}", recovered, consumer);
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn recover_consumer_group(&self, queues: &[QueueName], group: &str) -> Result<usize, EventBusError> {
        let recovered = {
            let mut state = self.lock();
            let mut members: Vec<String> = state
                .unacked
                .keys()
                .filter(|consumer| is_group_member(consumer, group))
                .cloned()
                .collect();
            members.sort();
            members
                .iter()
                .map(|consumer| self.recover_consumer(&mut state, queues, consumer))
                .sum::<usize>()
        };

        if recovered > 0 {
            info!("Recovered {} unacked message(s) for consumer group {}", recovered, group);
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<usize, EventBusError> {
        let state = self.lock();
        Ok(state
            .queues
            .get(&queue)
            .map(|q| q.ready.len() + q.delayed.len())
            .unwrap_or(0))
    }
}
