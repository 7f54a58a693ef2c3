use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::AppointmentError;
use crate::models::{AppointmentFilter, Availability, AvailableSlot};
use crate::profiles::ProfileDirectory;
use crate::store::ReservationStore;

pub struct AvailabilityService {
    store: Arc<dyn ReservationStore>,
    profiles: Arc<dyn ProfileDirectory>,
}

impl AvailabilityService {
    pub fn new(store: Arc<dyn ReservationStore>, profiles: Arc<dyn ProfileDirectory>) -> Self {
        Self { store, profiles }
    }

    /// Slots of the day, each flagged bookable when it is available, not
    /// under an unexpired lock and not taken by a non-cancelled appointment.
    pub async fn availability(&self, professional_id: Uuid, date: NaiveDate) -> Result<Availability, AppointmentError> {
        let professional = self
            .profiles
            .professional(professional_id)
            .await
            .map_err(|e| AppointmentError::Profile(e.to_string()))?
            .ok_or(AppointmentError::ProfessionalNotFound(professional_id))?;

        let slots = self.store.slots_for_day(professional_id, date).await?;
        let appointments = self
            .store
            .list_appointments(&AppointmentFilter::for_day(professional_id, date))
            .await?;

        let taken: HashSet<_> = appointments
            .iter()
            .filter(|a| a.status.holds_slot())
            .map(|a| a.start_time)
            .collect();

        let now = Utc::now();
        let slots: Vec<AvailableSlot> = slots
            .into_iter()
            .map(|slot| AvailableSlot {
                slot_id: slot.id,
                start_time: slot.start_time,
                end_time: slot.end_time,
                available: slot.is_free(now) && !taken.contains(&slot.start_time),
            })
            .collect();

        debug!(
            "Professional {} has {} of {} slots open on {}",
            professional_id,
            slots.iter().filter(|s| s.available).count(),
            slots.len(),
            date
        );

        Ok(Availability {
            professional,
            date,
            slots,
        })
    }
}
