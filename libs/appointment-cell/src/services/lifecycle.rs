// libs/appointment-cell/src/services/lifecycle.rs
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use event_bus_cell::{publish_json, ConfirmedEvent, EventBus, QueueName};

use crate::error::AppointmentError;
use crate::models::{Appointment, AppointmentStatus};
use crate::store::ReservationStore;

/// Business status changes after booking: manual confirmation, completion,
/// no-show and cancellation.
pub struct AppointmentLifecycleService {
    store: Arc<dyn ReservationStore>,
    bus: Arc<dyn EventBus>,
}

impl AppointmentLifecycleService {
    pub fn new(store: Arc<dyn ReservationStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Validate that a status transition is allowed
    pub fn validate_status_transition(
        current_status: AppointmentStatus,
        new_status: AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        if !Self::get_valid_transitions(current_status).contains(&new_status) {
            warn!("Invalid status transition attempted: {} -> {}", current_status, new_status);
            return Err(AppointmentError::InvalidStatusTransition {
                from: current_status,
                to: new_status,
            });
        }
        Ok(())
    }

    pub fn get_valid_transitions(current_status: AppointmentStatus) -> &'static [AppointmentStatus] {
        match current_status {
            AppointmentStatus::Pending => &[
                AppointmentStatus::Confirmed,
                AppointmentStatus::Cancelled,
                AppointmentStatus::NoShow,
            ],
            AppointmentStatus::Confirmed => &[
                AppointmentStatus::Completed,
                AppointmentStatus::Cancelled,
                AppointmentStatus::NoShow,
            ],
            // Terminal states
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow => &[],
        }
    }

    pub async fn update_status(
        &self,
        appointment_id: Uuid,
        new_status: AppointmentStatus,
    ) -> Result<Appointment, AppointmentError> {
        let current = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or(AppointmentError::AppointmentNotFound(appointment_id))?;

        Self::validate_status_transition(current.status, new_status)?;

        let updated = self
            .store
            .transition_status(appointment_id, current.status, new_status)
            .await?
            .ok_or(AppointmentError::ConcurrentUpdate(appointment_id))?;

        info!("Appointment {} moved {} -> {}", appointment_id, current.status, new_status);

        match new_status {
            AppointmentStatus::Cancelled => self.release_slot(&updated).await,
            AppointmentStatus::Confirmed => self.publish_confirmed(&updated).await,
            _ => {}
        }

        Ok(updated)
    }

    pub async fn cancel(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.update_status(appointment_id, AppointmentStatus::Cancelled).await
    }

    async fn release_slot(&self, appointment: &Appointment) {
        // The lock self-expires, so a failed release only delays rebooking.
        match self
            .store
            .release_slot_lock(appointment.professional_id, appointment.date, appointment.start_time)
            .await
        {
            Ok(true) => debug!("Released slot lock for appointment {}", appointment.id),
            Ok(false) => debug!("No locked slot to release for appointment {}", appointment.id),
            Err(e) => warn!("Could not release slot lock for appointment {}: {}", appointment.id, e),
        }
    }

    async fn publish_confirmed(&self, appointment: &Appointment) {
        let event = ConfirmedEvent {
            appointment_id: appointment.id,
            professional_id: appointment.professional_id,
            patient_id: appointment.patient_id,
            attempts: appointment.confirmation_attempts,
            timestamp: Utc::now(),
        };

        if let Err(e) = publish_json(self.bus.as_ref(), QueueName::Confirmed.routing_key(), &event).await {
            error!("Failed to publish appointment.confirmed for {}: {}", appointment.id, e);
        }
    }
}
