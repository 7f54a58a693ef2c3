use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_config::AppConfig;

pub const APPOINTMENT_CREATED_EVENT: &str = "appointment.created";

/// Outbound webhook body. Field order is the wire order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: String,
    pub data: WebhookAppointmentData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAppointmentData {
    pub appointment_id: Uuid,
    pub professional: WebhookProfessional,
    pub patient: WebhookPatient,
    pub appointment_date: String,
    pub start_time: String,
    pub end_time: String,
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookProfessional {
    pub id: Uuid,
    pub name: Option<String>,
    pub specialty: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPatient {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Result of one call to the Notification Endpoint. `response` is the JSON
/// text stored as the appointment's last confirmation response.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationOutcome {
    pub delivered: bool,
    pub http_status: Option<u16>,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySent,
    Cancelled,
    RetriesExhausted,
    /// The delivery's attempt number no longer matches the stored count.
    StaleAttempt { event: u32, stored: u32 },
    /// Another consumer recorded an outcome first.
    LostRace,
}

/// What the processor did with a delivery. Everything except `Rejected` is
/// acknowledged; `Rejected` is dropped without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Confirmed { attempts: u32 },
    RetryScheduled { attempt: u32 },
    DeadLettered { attempts: u32 },
    /// The notification went out but the appointment was cancelled before
    /// the outcome was written, so it stays cancelled.
    DeliveredAfterCancel { attempts: u32 },
    Skipped(SkipReason),
    Rejected(String),
}

impl Disposition {
    pub fn should_ack(&self) -> bool {
        !matches!(self, Disposition::Rejected(_))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    /// How long one consume call blocks before the loop re-checks shutdown.
    pub poll_wait: Duration,
    /// Pause after a failed consume or a requeued processing error.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "confirmation-worker".to_string(),
            concurrency: 4,
            poll_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            concurrency: config.worker_concurrency.max(1) as usize,
            ..Self::default()
        }
    }
}
