// libs/appointment-cell/src/services/booking.rs
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use event_bus_cell::{publish_json, ConfirmationEvent, EventBus, QueueName};
use shared_config::AppConfig;

use crate::error::AppointmentError;
use crate::models::{Appointment, AppointmentFilter, ReserveRequest};
use crate::profiles::ProfileDirectory;
use crate::store::ReservationStore;

/// Reservation Coordinator: existence checks, slot locking, appointment
/// creation and the `appointment.created` event for one booking request.
pub struct AppointmentBookingService {
    store: Arc<dyn ReservationStore>,
    profiles: Arc<dyn ProfileDirectory>,
    bus: Arc<dyn EventBus>,
    lock_duration: ChronoDuration,
}

impl AppointmentBookingService {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        profiles: Arc<dyn ProfileDirectory>,
        bus: Arc<dyn EventBus>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            profiles,
            bus,
            lock_duration: ChronoDuration::minutes(config.slot_lock_minutes.max(1)),
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            professional_id = %request.professional_id,
            patient_id = %request.patient_id,
            date = %request.date,
            start_time = %request.start_time
        )
    )]
    pub async fn reserve(&self, request: ReserveRequest) -> Result<Appointment, AppointmentError> {
        request.validate()?;
        info!("Starting reservation");

        // **Step 1: Patient and professional must exist**
        let (patient, professional) = futures::try_join!(
            self.profiles.patient(request.patient_id),
            self.profiles.professional(request.professional_id),
        )
        .map_err(|e| AppointmentError::Profile(e.to_string()))?;

        if patient.is_none() {
            return Err(AppointmentError::PatientNotFound(request.patient_id));
        }
        if professional.is_none() {
            return Err(AppointmentError::ProfessionalNotFound(request.professional_id));
        }

        // **Step 2: Fast-path slot lookup**
        let slot = match self
            .store
            .find_free_slot(request.professional_id, request.date, request.start_time)
            .await?
        {
            Some(slot) => slot,
            None => return Err(self.explain_missing_slot(&request).await?),
        };
        debug!("Candidate slot {}", slot.id);

        if slot.end_time != request.end_time {
            return Err(AppointmentError::InvalidTimeWindow(format!(
                "end time {} does not match the slot ending at {}",
                request.end_time, slot.end_time
            )));
        }

        // **Step 3: Atomic lock + uniqueness re-check + insert**
        let lock_until = Utc::now() + self.lock_duration;
        let appointment = self.store.reserve(slot.id, &request, lock_until).await.map_err(|e| {
            warn!("Reservation lost at commit: {}", e);
            AppointmentError::from(e)
        })?;

        info!("Appointment {} created as {}", appointment.id, appointment.status);

        // **Step 4: Emit the created event; the appointment stays committed either way**
        self.publish_created(&appointment).await;

        Ok(appointment)
    }

    /// No free slot: report `Conflict` when an appointment already holds the
    /// tuple, `SlotUnavailable` otherwise.
    async fn explain_missing_slot(&self, request: &ReserveRequest) -> Result<AppointmentError, AppointmentError> {
        let holder = self
            .store
            .find_active_appointment(request.professional_id, request.date, request.start_time)
            .await?;

        Ok(match holder {
            Some(existing) => {
                debug!("Tuple already held by appointment {}", existing.id);
                AppointmentError::Conflict
            }
            None => AppointmentError::SlotUnavailable,
        })
    }

    async fn publish_created(&self, appointment: &Appointment) {
        let event = ConfirmationEvent::first_attempt(
            appointment.id,
            appointment.professional_id,
            appointment.patient_id,
        );

        match publish_json(self.bus.as_ref(), QueueName::Created.routing_key(), &event).await {
            Ok(0) => error!(
                "appointment.created for {} matched no queue; it will not be confirmed until republished",
                appointment.id
            ),
            Ok(_) => info!("Published appointment.created for {}", appointment.id),
            Err(e) => error!(
                "Failed to publish appointment.created for {}: {}. Appointment stays PENDING without a confirmation event",
                appointment.id, e
            ),
        }
    }

    pub async fn get_appointment(&self, id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store
            .get_appointment(id)
            .await?
            .ok_or(AppointmentError::AppointmentNotFound(id))
    }

    pub async fn list_appointments(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, AppointmentError> {
        debug!("Listing appointments with {:?}", filter);
        Ok(self.store.list_appointments(filter).await?)
    }
}
