use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info, instrument, warn};

use appointment_cell::{
    Appointment, AppointmentStatus, ConfirmationState, ConfirmationUpdate, ProfileDirectory, ReservationStore,
};
use event_bus_cell::{
    publish_json, ConfirmationEvent, ConfirmedEvent, DeadLetterEvent, Delivery, EventBus, QueueName,
};
use shared_config::AppConfig;

use crate::error::ConfirmationError;
use crate::models::{
    Disposition, NotificationOutcome, SkipReason, WebhookAppointmentData, WebhookPatient, WebhookPayload,
    WebhookProfessional, APPOINTMENT_CREATED_EVENT,
};
use crate::services::notifier::Notifier;
use crate::services::signing::SignedPayload;

/// Runs one confirmation attempt per delivery. The appointment row, not the
/// message, is the source of truth for the attempt count.
pub struct ConfirmationProcessor {
    store: Arc<dyn ReservationStore>,
    profiles: Arc<dyn ProfileDirectory>,
    bus: Arc<dyn EventBus>,
    notifier: Arc<dyn Notifier>,
    webhook_secret: String,
    max_retries: u32,
}

impl ConfirmationProcessor {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        profiles: Arc<dyn ProfileDirectory>,
        bus: Arc<dyn EventBus>,
        notifier: Arc<dyn Notifier>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            profiles,
            bus,
            notifier,
            webhook_secret: config.webhook_secret.clone(),
            max_retries: config.confirmation_max_retries.max(1),
        }
    }

    /// `Err` means the delivery should be requeued.
    #[instrument(skip(self, delivery), fields(queue = %delivery.queue, redelivered = delivery.redelivered()))]
    pub async fn handle(&self, delivery: &Delivery) -> Result<Disposition, ConfirmationError> {
        let event: ConfirmationEvent = match delivery.parse() {
            Ok(event) => event,
            Err(e) => {
                error!("Malformed confirmation event: {}", e);
                return Ok(Disposition::Rejected(format!("malformed event: {}", e)));
            }
        };

        info!(
            "Processing confirmation for appointment {} (attempt {})",
            event.appointment_id, event.attempt
        );

        let Some(appointment) = self.store.get_appointment(event.appointment_id).await? else {
            error!("Appointment {} not found, rejecting event", event.appointment_id);
            return Ok(Disposition::Rejected(format!(
                "appointment {} not found",
                event.appointment_id
            )));
        };

        if let Some(reason) = self.skip_reason(&event, &appointment) {
            info!("Skipping appointment {}: {:?}", appointment.id, reason);
            return Ok(Disposition::Skipped(reason));
        }

        let payload = self.build_payload(&appointment).await?;
        let signed = SignedPayload::new(APPOINTMENT_CREATED_EVENT, &payload, &self.webhook_secret)?;
        let outcome = self.notifier.notify(&signed).await;

        if outcome.delivered {
            self.on_delivered(&appointment, outcome).await
        } else {
            self.on_failed(&event, &appointment, outcome).await
        }
    }

    fn skip_reason(&self, event: &ConfirmationEvent, appointment: &Appointment) -> Option<SkipReason> {
        if appointment.status == AppointmentStatus::Cancelled {
            return Some(SkipReason::Cancelled);
        }
        match appointment.confirmation_state(self.max_retries) {
            ConfirmationState::SentOk => return Some(SkipReason::AlreadySent),
            ConfirmationState::DeadLettered => return Some(SkipReason::RetriesExhausted),
            ConfirmationState::NotSent | ConfirmationState::PendingRetry => {}
        }
        if event.attempt != appointment.confirmation_attempts {
            return Some(SkipReason::StaleAttempt {
                event: event.attempt,
                stored: appointment.confirmation_attempts,
            });
        }
        None
    }

    async fn build_payload(&self, appointment: &Appointment) -> Result<WebhookPayload, ConfirmationError> {
        let (patient, professional) = futures::try_join!(
            self.profiles.patient(appointment.patient_id),
            self.profiles.professional(appointment.professional_id),
        )
        .map_err(|e| ConfirmationError::Profile(e.to_string()))?;

        if patient.is_none() || professional.is_none() {
            warn!(
                "Profile data missing for appointment {}, sending ids only",
                appointment.id
            );
        }

        Ok(WebhookPayload {
            event: APPOINTMENT_CREATED_EVENT.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data: WebhookAppointmentData {
                appointment_id: appointment.id,
                professional: WebhookProfessional {
                    id: appointment.professional_id,
                    name: professional.as_ref().map(|p| p.name.clone()),
                    specialty: professional.and_then(|p| p.specialty),
                },
                patient: WebhookPatient {
                    id: appointment.patient_id,
                    name: patient.as_ref().map(|p| p.name.clone()),
                    email: patient.and_then(|p| p.email),
                },
                appointment_date: appointment.date.to_string(),
                start_time: appointment.start_time.format("%H:%M").to_string(),
                end_time: appointment.end_time.format("%H:%M").to_string(),
                status: appointment.status.to_string(),
                reason: appointment.reason.clone(),
            },
        })
    }

    async fn on_delivered(
        &self,
        appointment: &Appointment,
        outcome: NotificationOutcome,
    ) -> Result<Disposition, ConfirmationError> {
        let attempts = appointment.confirmation_attempts + 1;
        let update = ConfirmationUpdate {
            attempts,
            sent: true,
            confirm: true,
            response: outcome.response,
            attempted_at: Utc::now(),
        };

        let Some(recorded) = self
            .store
            .record_confirmation_attempt(appointment.id, appointment.confirmation_attempts, &update)
            .await?
        else {
            return Ok(Disposition::Skipped(SkipReason::LostRace));
        };

        if recorded.status == AppointmentStatus::Cancelled {
            warn!(
                "Appointment {} was cancelled while its confirmation was in flight, leaving it cancelled",
                appointment.id
            );
            return Ok(Disposition::DeliveredAfterCancel { attempts });
        }

        info!(
            "Appointment {} confirmed after {} attempt(s) (HTTP {:?})",
            appointment.id, attempts, outcome.http_status
        );

        let confirmed = ConfirmedEvent {
            appointment_id: appointment.id,
            professional_id: appointment.professional_id,
            patient_id: appointment.patient_id,
            attempts,
            timestamp: Utc::now(),
        };
        if let Err(e) = publish_json(self.bus.as_ref(), QueueName::Confirmed.routing_key(), &confirmed).await {
            error!("Failed to publish appointment.confirmed for {}: {}", appointment.id, e);
        }

        Ok(Disposition::Confirmed { attempts })
    }

    async fn on_failed(
        &self,
        event: &ConfirmationEvent,
        appointment: &Appointment,
        outcome: NotificationOutcome,
    ) -> Result<Disposition, ConfirmationError> {
        let attempts = appointment.confirmation_attempts + 1;
        let attempted_at = Utc::now();
        warn!(
            "Webhook for appointment {} failed on attempt {} of {}",
            appointment.id, attempts, self.max_retries
        );

        // Next hop goes out before the attempt is recorded: a crash in between
        // can only duplicate the event.
        let disposition = if attempts < self.max_retries {
            let retry = event.next_attempt(attempts);
            publish_json(self.bus.as_ref(), QueueName::Retry.routing_key(), &retry).await?;
            info!("Scheduled retry {} for appointment {}", attempts, appointment.id);
            Disposition::RetryScheduled { attempt: attempts }
        } else {
            let dead = DeadLetterEvent {
                appointment_id: appointment.id,
                professional_id: appointment.professional_id,
                patient_id: appointment.patient_id,
                attempts,
                last_response: Some(outcome.response.clone()),
                last_attempt_at: Some(attempted_at),
                timestamp: Utc::now(),
            };
            publish_json(self.bus.as_ref(), QueueName::DeadLetter.routing_key(), &dead).await?;
            error!(
                "Appointment {} dead-lettered after {} failed confirmation attempts",
                appointment.id, attempts
            );
            Disposition::DeadLettered { attempts }
        };

        let update = ConfirmationUpdate {
            attempts,
            sent: false,
            confirm: false,
            response: outcome.response,
            attempted_at,
        };
        let recorded = self
            .store
            .record_confirmation_attempt(appointment.id, appointment.confirmation_attempts, &update)
            .await?;
        if recorded.is_none() {
            debug!("Attempt {} for appointment {} was recorded by another consumer", attempts, appointment.id);
            return Ok(Disposition::Skipped(SkipReason::LostRace));
        }

        Ok(disposition)
    }
}
