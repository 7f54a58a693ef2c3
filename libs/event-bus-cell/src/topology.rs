use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EventBusError;

pub const APPOINTMENTS_EXCHANGE: &str = "appointments";

/// Default time a message waits in the retry queue before being
/// dead-lettered back to `appointment.created`.
pub const DEFAULT_RETRY_TTL: Duration = Duration::from_millis(60_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "appointment.created")]
    Created,
    #[serde(rename = "appointment.retry")]
    Retry,
    #[serde(rename = "appointment.confirmed")]
    Confirmed,
    #[serde(rename = "appointment.dlq")]
    DeadLetter,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Created,
        QueueName::Retry,
        QueueName::Confirmed,
        QueueName::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Created => "appointment.created",
            QueueName::Retry => "appointment.retry",
            QueueName::Confirmed => "appointment.confirmed",
            QueueName::DeadLetter => "appointment.dlq",
        }
    }

    /// Every queue is bound with a routing key equal to its own name.
    pub fn routing_key(&self) -> &'static str {
        self.as_str()
    }

    pub fn parse(name: &str) -> Result<Self, EventBusError> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == name)
            .ok_or_else(|| EventBusError::UnknownQueue(name.to_string()))
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    Topic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: QueueName,
    pub durable: bool,
    /// Messages older than this are dead-lettered instead of delivered.
    pub message_ttl_ms: Option<u64>,
    /// Routing key used on the same exchange when a message expires or
    /// exceeds its delivery limit.
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    fn durable(name: QueueName) -> Self {
        Self {
            name,
            durable: true,
            message_ttl_ms: None,
            dead_letter_routing_key: None,
        }
    }

    pub fn message_ttl(&self) -> Option<Duration> {
        self.message_ttl_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub queue: QueueName,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub exchange: ExchangeSpec,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// The appointment confirmation topology: one durable topic exchange and
    /// four durable queues, the retry queue delaying by TTL and routing
    /// expired messages back to `appointment.created`.
    pub fn appointments(retry_ttl: Duration) -> Self {
        let retry = QueueSpec {
            name: QueueName::Retry,
            durable: true,
            message_ttl_ms: Some(retry_ttl.as_millis() as u64),
            dead_letter_routing_key: Some(QueueName::Created.routing_key().to_string()),
        };

        let queues = vec![
            QueueSpec::durable(QueueName::Created),
            retry,
            QueueSpec::durable(QueueName::Confirmed),
            QueueSpec::durable(QueueName::DeadLetter),
        ];

        let bindings = QueueName::ALL
            .into_iter()
            .map(|queue| Binding {
                queue,
                pattern: queue.routing_key().to_string(),
            })
            .collect();

        Self {
            exchange: ExchangeSpec {
                name: APPOINTMENTS_EXCHANGE.to_string(),
                kind: ExchangeKind::Topic,
                durable: true,
            },
            queues,
            bindings,
        }
    }

    pub fn queue(&self, name: QueueName) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn require_queue(&self, name: QueueName) -> Result<&QueueSpec, EventBusError> {
        self.queue(name)
            .ok_or_else(|| EventBusError::UnknownQueue(name.to_string()))
    }

    /// Queues a message published with `routing_key` lands in. Each queue
    /// appears at most once even when several bindings match.
    pub fn route(&self, routing_key: &str) -> Vec<QueueName> {
        let mut targets = Vec::new();
        for binding in &self.bindings {
            if topic_matches(&binding.pattern, routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue);
            }
        }
        targets
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::appointments(DEFAULT_RETRY_TTL)
    }
}

/// AMQP topic matching: words are dot-separated, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && match_words(rest, key_rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_each_key_to_its_own_queue() {
        let topology = Topology::default();
        for queue in QueueName::ALL {
            assert_eq!(topology.route(queue.routing_key()), vec![queue]);
        }
        assert!(topology.route("appointment.unknown").is_empty());
    }

    #[test]
    fn retry_queue_dead_letters_to_created() {
        let topology = Topology::appointments(Duration::from_secs(60));
        let retry = topology.queue(QueueName::Retry).unwrap();

        assert_eq!(retry.message_ttl(), Some(Duration::from_millis(60_000)));
        assert_eq!(retry.dead_letter_routing_key.as_deref(), Some("appointment.created"));
        assert!(topology.queues.iter().all(|q| q.durable));
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("appointment.*", "appointment.created"));
        assert!(!topic_matches("appointment.*", "appointment.created.v2"));
        assert!(topic_matches("appointment.#", "appointment.created.v2"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.dlq", "appointment.dlq"));
        assert!(!topic_matches("appointment.created", "appointment.confirmed"));
    }

    #[test]
    fn parses_queue_names() {
        assert_eq!(QueueName::parse("appointment.dlq").unwrap(), QueueName::DeadLetter);
        assert!(QueueName::parse("appointment.nope").is_err());
    }
}
