use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use shared_config::AppConfig;

use crate::services::bus::{is_group_member, EventBus, DEFAULT_MAX_DELIVERIES};
use crate::{DeathReason, Delivery, Envelope, EventBusError, QueueName, Topology};

/// Moves a member out of a delay set only if it is still there, so two
/// consumers expiring the same message cannot both re-route it.
const EXPIRE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  for i = 2, #KEYS do
    redis.call('LPUSH', KEYS[i], ARGV[2])
  end
  return 1
end
return 0
"#;

/// Removes a message from an unacked list and, if it was there, pushes its
/// replacement onto every target list with ARGV[3] (`LPUSH` appends to the
/// queue, `RPUSH` puts it next in line).
const SETTLE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
  for i = 2, #KEYS do
    redis.call(ARGV[3], KEYS[i], ARGV[2])
  end
  return 1
end
return 0
"#;

const EXPIRE_BATCH: usize = 100;
const SCAN_COUNT: usize = 100;

/// Redis-backed broker. Each queue is a ready list, plus a sorted set
/// scored by expiry time when the queue has a TTL. Each consumer owns an
/// unacked list per queue, so messages survive a consumer crash.
pub struct RedisEventBus {
    pool: Pool,
    topology: Topology,
    prefix: String,
    max_deliveries: u32,
    declared: OnceCell<()>,
    expire_script: Script,
    settle_script: Script,
}

impl RedisEventBus {
    pub async fn new(config: &AppConfig, topology: Topology) -> Result<Self, EventBusError> {
        let redis_url = config.redis_url_or_default();
        let bus = Self::connect(&redis_url, topology, "bus").await?;
        Ok(bus.with_max_deliveries(config.bus_max_deliveries))
    }

    pub async fn connect(redis_url: &str, topology: Topology, prefix: &str) -> Result<Self, EventBusError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| EventBusError::PoolError(format!("Pool creation error: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| EventBusError::PoolError(format!("Connection error: {}", e)))?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis event bus connected to {}", mask_url(redis_url));

        Ok(Self {
            pool,
            topology,
            prefix: prefix.to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            declared: OnceCell::new(),
            expire_script: Script::new(EXPIRE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        })
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    fn ready_key(&self, queue: QueueName) -> String {
        format!("{}:{}:ready", self.prefix, queue)
    }

    fn delayed_key(&self, queue: QueueName) -> String {
        format!("{}:{}:delayed", self.prefix, queue)
    }

    fn unacked_key(&self, queue: QueueName, consumer: &str) -> String {
        format!("{}:{}:unacked:{}", self.prefix, queue, consumer)
    }

    fn topology_key(&self) -> String {
        format!("{}:topology:{}", self.prefix, self.topology.exchange.name)
    }

    async fn get_connection(&self) -> Result<Connection, EventBusError> {
        self.pool
            .get()
            .await
            .map_err(|e| EventBusError::PoolError(e.to_string()))
    }

    /// Destination list keys plus delay-set entries for `envelope`.
    fn plan_route(&self, envelope: &Envelope) -> (Vec<String>, Vec<(String, i64)>) {
        let mut lists = Vec::new();
        let mut delayed = Vec::new();
        let now_ms = Utc::now().timestamp_millis();

        for queue in self.topology.route(&envelope.routing_key) {
            match self.topology.queue(queue).and_then(|spec| spec.message_ttl_ms) {
                Some(ttl) => delayed.push((self.delayed_key(queue), now_ms + ttl as i64)),
                None => lists.push(self.ready_key(queue)),
            }
        }
        (lists, delayed)
    }

    /// The envelope to put back after an unsettled delivery and the lists it
    /// goes to. `None` targets mean its own ready queue; at the delivery
    /// limit it is routed to the dead-letter queue instead.
    fn plan_redelivery(&self, queue: QueueName, envelope: &Envelope) -> (Envelope, Option<Vec<String>>) {
        let requeued = envelope.redelivered();
        if requeued.delivery_count < self.max_deliveries {
            return (requeued, None);
        }

        warn!(
            "Message {} hit the delivery limit ({}) on {}, dead-lettering",
            envelope.message_id, self.max_deliveries, queue
        );
        let moved = envelope.dead_lettered(queue, DeathReason::DeliveryLimit, QueueName::DeadLetter.routing_key());
        let (lists, _) = self.plan_route(&moved);
        (moved, Some(lists))
    }

    /// Atomically swaps `raw` in `unacked` for `replacement` on `targets`.
    /// False when `raw` was no longer there.
    async fn settle(
        &self,
        conn: &mut Connection,
        unacked: &str,
        raw: &str,
        replacement: &Envelope,
        targets: &[String],
        push: &str,
    ) -> Result<bool, EventBusError> {
        let mut invocation = self.settle_script.key(unacked);
        for target in targets {
            invocation.key(target);
        }
        let applied: i32 = invocation
            .arg(raw)
            .arg(serde_json::to_string(replacement)?)
            .arg(push)
            .invoke_async(&mut *conn)
            .await?;
        Ok(applied == 1)
    }

    async fn expire_due(&self, conn: &mut Connection, queue: QueueName) -> Result<usize, EventBusError> {
        let Some(dlx_key) = self
            .topology
            .queue(queue)
            .filter(|spec| spec.message_ttl_ms.is_some())
            .and_then(|spec| spec.dead_letter_routing_key.clone())
        else {
            return Ok(0);
        };

        let delayed_key = self.delayed_key(queue);
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(EXPIRE_BATCH)
            .query_async(&mut *conn)
            .await?;

        let mut moved = 0;
        for raw in due {
            let envelope: Envelope = match serde_json::from_str(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping unreadable message from {}: {}", delayed_key, e);
                    let _: () = conn.zrem(&delayed_key, &raw).await?;
                    continue;
                }
            };

            let forwarded = envelope.dead_lettered(queue, DeathReason::Expired, &dlx_key);
            let (lists, nested_delays) = self.plan_route(&forwarded);
            if !nested_delays.is_empty() {
                warn!("Dead-letter route from {} targets another TTL queue; delaying is not chained", queue);
            }

            let mut invocation = self.expire_script.key(&delayed_key);
            for list in &lists {
                invocation.key(list);
            }
            let applied: i32 = invocation
                .arg(&raw)
                .arg(serde_json::to_string(&forwarded)?)
                .invoke_async(&mut *conn)
                .await?;
            moved += applied as usize;
        }

        if moved > 0 {
            debug!("Expired {} message(s) from {} to {}", moved, queue, dlx_key);
        }
        Ok(moved)
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn declare_topology(&self) -> Result<(), EventBusError> {
        self.declared
            .get_or_try_init(|| async {
                let mut conn = self.get_connection().await?;
                let key = self.topology_key();

                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.hset(&key, "exchange", serde_json::to_string(&self.topology.exchange)?).ignore();
                for spec in &self.topology.queues {
                    pipe.hset(&key, format!("queue:{}", spec.name), serde_json::to_string(spec)?).ignore();
                }
                pipe.hset(&key, "bindings", serde_json::to_string(&self.topology.bindings)?).ignore();
                let _: () = pipe.query_async(&mut conn).await?;

                info!(
                    "Declared exchange {} with {} queues",
                    self.topology.exchange.name,
                    self.topology.queues.len()
                );
                Ok::<(), EventBusError>(())
            })
            .await?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &str) -> Result<usize, EventBusError> {
        self.declare_topology().await?;

        let envelope = Envelope::new(routing_key, payload);
        let raw = serde_json::to_string(&envelope)?;
        let (lists, delayed) = self.plan_route(&envelope);
        let routed = lists.len() + delayed.len();

        if routed == 0 {
            warn!("Message with routing key {} matched no queue and was dropped", routing_key);
            return Ok(0);
        }

        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for list in &lists {
            pipe.lpush(list, &raw).ignore();
        }
        for (set, score) in &delayed {
            pipe.zadd(set, &raw, *score).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(routed)
    }

    async fn consume(
        &self,
        queues: &[QueueName],
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, EventBusError> {
        self.declare_topology().await?;
        let mut conn = self.get_connection().await?;

        for queue in queues {
            self.expire_due(&mut conn, *queue).await?;
        }

        let mut blocking_candidate = None;
        for queue in queues {
            let ready = self.ready_key(*queue);
            let unacked = self.unacked_key(*queue, consumer);
            let raw: Option<String> = conn.rpoplpush(&ready, &unacked).await?;
            if let Some(raw) = raw {
                return to_delivery(*queue, consumer, raw).map(Some);
            }
            if blocking_candidate.is_none() && self.topology.queue(*queue).and_then(|s| s.message_ttl_ms).is_none() {
                blocking_candidate = Some(*queue);
            }
        }

        let Some(queue) = blocking_candidate else {
            tokio::time::sleep(wait).await;
            return Ok(None);
        };

        let timeout = wait.as_secs_f64().max(0.1);
        let raw: Option<String> = conn
            .brpoplpush(self.ready_key(queue), self.unacked_key(queue, consumer), timeout)
            .await?;

        match raw {
            Some(raw) => to_delivery(queue, consumer, raw).map(Some),
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventBusError> {
        let mut conn = self.get_connection().await?;
        let removed: i32 = conn
            .lrem(self.unacked_key(delivery.queue, &delivery.consumer), 1, &delivery.raw)
            .await?;
        if removed == 0 {
            return Err(EventBusError::UnknownDelivery(delivery.envelope.message_id.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), EventBusError> {
        let unacked = self.unacked_key(delivery.queue, &delivery.consumer);
        let mut conn = self.get_connection().await?;

        if !requeue {
            let _: i32 = conn.lrem(&unacked, 1, &delivery.raw).await?;
            debug!("Message {} rejected without requeue", delivery.envelope.message_id);
            return Ok(());
        }

        let (replacement, dead_letter) = self.plan_redelivery(delivery.queue, &delivery.envelope);
        let targets = dead_letter.unwrap_or_else(|| vec![self.ready_key(delivery.queue)]);
        let applied = self
            .settle(&mut conn, &unacked, &delivery.raw, &replacement, &targets, "LPUSH")
            .await?;

        if !applied {
            return Err(EventBusError::UnknownDelivery(delivery.envelope.message_id.to_string()));
        }
        Ok(())
    }

    async fn recover_unacked(&self, queues: &[QueueName], consumer: &str) -> Result<usize, EventBusError> {
        let mut conn = self.get_connection().await?;
        let mut recovered = 0;

        for queue in queues {
            let unacked = self.unacked_key(*queue, consumer);
            // Newest first, so the oldest ends up next in line
            loop {
                let raw: Option<String> = conn.lindex(&unacked, 0).await?;
                let Some(raw) = raw else {
                    break;
                };

                let envelope: Envelope = match serde_json::from_str(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Dropping unreadable message from {}: {}", unacked, e);
                        let _: i32 = conn.lrem(&unacked, 1, &raw).await?;
                        continue;
                    }
                };

                let (replacement, dead_letter) = self.plan_redelivery(*queue, &envelope);
                let (targets, push) = match dead_letter {
                    Some(lists) => (lists, "LPUSH"),
                    None => (vec![self.ready_key(*queue)], "RPUSH"),
                };
                if self.settle(&mut conn, &unacked, &raw, &replacement, &targets, push).await? {
                    recovered += 1;
                }
            }
        }

        if recovered > 0 {
            info!("Recovered {} unacked message(s) for consumer {}", recovered, consumer);
        }
        Ok(recovered)
    }

    async fn recover_consumer_group(&self, queues: &[QueueName], group: &str) -> Result<usize, EventBusError> {
        let mut conn = self.get_connection().await?;
        let mut members = BTreeSet::new();

        for queue in queues {
            let key_prefix = self.unacked_key(*queue, "");
            let pattern = format!("{}{}-*", escape_glob(&key_prefix), escape_glob(group));
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                members.extend(
                    keys.iter()
                        .filter_map(|key| key.strip_prefix(&key_prefix))
                        .filter(|consumer| is_group_member(consumer, group))
                        .map(str::to_string),
                );
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }
        drop(conn);

        let mut recovered = 0;
        for consumer in &members {
            recovered += self.recover_unacked(queues, consumer).await?;
        }
        if recovered > 0 {
            info!(
                "Recovered {} unacked message(s) across {} consumer(s) of group {}",
                recovered,
                members.len(),
                group
            );
        }
        Ok(recovered)
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<usize, EventBusError> {
        let mut conn = self.get_connection().await?;
        let ready: usize = conn.llen(self.ready_key(queue)).await?;
        let delayed: usize = conn.zcard(self.delayed_key(queue)).await?;
        Ok(ready + delayed)
    }
}

fn to_delivery(queue: QueueName, consumer: &str, raw: String) -> Result<Delivery, EventBusError> {
    let envelope: Envelope = serde_json::from_str(&raw)?;
    Ok(Delivery {
        queue,
        consumer: consumer.to_string(),
        envelope,
        raw,
    })
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn mask_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}****{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
