use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::QueueName;

/// Why a message left its queue without being acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    Expired,
    DeliveryLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeathRecord {
    pub reason: DeathReason,
    pub queue: QueueName,
    pub at: DateTime<Utc>,
}

/// Stored form of a message. `payload` holds the exact JSON bytes the
/// publisher produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub routing_key: String,
    pub payload: String,
    pub published_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub death: Option<DeathRecord>,
}

impl Envelope {
    pub fn new(routing_key: &str, payload: &str) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            routing_key: routing_key.to_string(),
            payload: payload.to_string(),
            published_at: Utc::now(),
            delivery_count: 0,
            death: None,
        }
    }

    pub(crate) fn dead_lettered(&self, from: QueueName, reason: DeathReason, routing_key: &str) -> Self {
        Self {
            message_id: self.message_id,
            routing_key: routing_key.to_string(),
            payload: self.payload.clone(),
            published_at: self.published_at,
            delivery_count: 0,
            death: Some(DeathRecord {
                reason,
                queue: from,
                at: Utc::now(),
            }),
        }
    }

    pub(crate) fn redelivered(&self) -> Self {
        Self {
            delivery_count: self.delivery_count + 1,
            ..self.clone()
        }
    }
}

/// A message handed to one consumer. It stays in that consumer's unacked
/// set until `ack` or `nack` is called on the bus.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: QueueName,
    pub consumer: String,
    pub envelope: Envelope,
    pub(crate) raw: String,
}

impl Delivery {
    pub fn payload(&self) -> &str {
        &self.envelope.payload
    }

    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.envelope.payload)
    }

    /// True once the message has been requeued at least once.
    pub fn redelivered(&self) -> bool {
        self.envelope.delivery_count > 0
    }
}

/// Carried on `appointment.created` and `appointment.retry`. A projection of
/// the appointment row; the row stays the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationEvent {
    pub appointment_id: Uuid,
    pub professional_id: Uuid,
    pub patient_id: Uuid,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl ConfirmationEvent {
    pub fn first_attempt(appointment_id: Uuid, professional_id: Uuid, patient_id: Uuid) -> Self {
        Self {
            appointment_id,
            professional_id,
            patient_id,
            attempt: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn next_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedEvent {
    pub appointment_id: Uuid,
    pub professional_id: Uuid,
    pub patient_id: Uuid,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// Terminal record for an appointment whose confirmation exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEvent {
    pub appointment_id: Uuid,
    pub professional_id: Uuid,
    pub patient_id: Uuid,
    pub attempts: u32,
    pub last_response: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}
