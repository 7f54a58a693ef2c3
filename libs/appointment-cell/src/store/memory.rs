use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Appointment, AppointmentFilter, AppointmentStatus, ConfirmationUpdate, ReserveRequest, Slot,
};
use crate::store::ReservationStore;

#[derive(Default)]
struct Tables {
    slots: HashMap<Uuid, Slot>,
    appointments: HashMap<Uuid, Appointment>,
}

/// Process-local store. A single mutex plays the role of the transaction, so
/// every `reserve` observes and commits a consistent snapshot.
#[derive(Default)]
pub struct InMemoryReservationStore {
    tables: Mutex<Tables>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slots(slots: impl IntoIterator<Item = Slot>) -> Self {
        let store = Self::new();
        for slot in slots {
            store.insert_slot(slot);
        }
        store
    }

    pub fn insert_slot(&self, slot: Slot) {
        self.lock().slots.insert(slot.id, slot);
    }

    pub fn insert_appointment(&self, appointment: Appointment) {
        self.lock().appointments.insert(appointment.id, appointment);
    }

    pub fn slot(&self, id: Uuid) -> Option<Slot> {
        self.lock().slots.get(&id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted(mut appointments: Vec<Appointment>) -> Vec<Appointment> {
    appointments.sort_by(|a, b| (a.date, a.start_time, a.created_at).cmp(&(b.date, b.start_time, b.created_at)));
    appointments
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn find_free_slot(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Option<Slot>, StoreError> {
        let now = Utc::now();
        let tables = self.lock();
        Ok(tables
            .slots
            .values()
            .find(|s| {
                s.professional_id == professional_id
                    && s.date == date
                    && s.start_time == start_time
                    && s.is_free(now)
            })
            .cloned())
    }

    async fn find_active_appointment(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Option<Appointment>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .appointments
            .values()
            .find(|a| a.occupies(professional_id, date, start_time))
            .cloned())
    }

    async fn reserve(
        &self,
        slot_id: Uuid,
        request: &ReserveRequest,
        lock_until: DateTime<Utc>,
    ) -> Result<Appointment, StoreError> {
        let now = Utc::now();
        let mut tables = self.lock();

        let mut slot = match tables.slots.get(&slot_id) {
            Some(slot) if slot.is_free(now) => slot.clone(),
            _ => return Err(StoreError::SlotUnavailable),
        };
        slot.locked = true;
        slot.lock_expires_at = Some(lock_until);

        let taken = tables
            .appointments
            .values()
            .any(|a| a.occupies(request.professional_id, request.date, request.start_time));
        if taken {
            debug!("Tuple already booked, aborting reservation on slot {}", slot_id);
            return Err(StoreError::Conflict);
        }

        let appointment = Appointment::pending(request);
        tables.slots.insert(slot.id, slot);
        tables.appointments.insert(appointment.id, appointment.clone());
        Ok(appointment)
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.lock().appointments.get(&id).cloned())
    }

    async fn list_appointments(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError> {
        let matching = self
            .lock()
            .appointments
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        Ok(sorted(matching).into_iter().take(filter.effective_limit()).collect())
    }

    async fn slots_for_day(&self, professional_id: Uuid, date: NaiveDate) -> Result<Vec<Slot>, StoreError> {
        let mut slots: Vec<Slot> = self
            .lock()
            .slots
            .values()
            .filter(|s| s.professional_id == professional_id && s.date == date)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.start_time);
        Ok(slots)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<Option<Appointment>, StoreError> {
        let mut tables = self.lock();
        let appointment = tables.appointments.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if appointment.status != from {
            return Ok(None);
        }
        appointment.status = to;
        appointment.updated_at = Utc::now();
        Ok(Some(appointment.clone()))
    }

    async fn record_confirmation_attempt(
        &self,
        id: Uuid,
        expected_attempts: u32,
        update: &ConfirmationUpdate,
    ) -> Result<Option<Appointment>, StoreError> {
        let mut tables = self.lock();
        let appointment = tables.appointments.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if appointment.confirmation_attempts != expected_attempts {
            return Ok(None);
        }

        appointment.confirmation_attempts = update.attempts;
        appointment.confirmation_sent = update.sent;
        appointment.last_confirmation_response = Some(update.response.clone());
        appointment.last_attempt_at = Some(update.attempted_at);
        if update.confirm && appointment.status == AppointmentStatus::Pending {
            appointment.status = AppointmentStatus::Confirmed;
        }
        appointment.updated_at = Utc::now();
        Ok(Some(appointment.clone()))
    }

    async fn release_slot_lock(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let slot = tables.slots.values_mut().find(|s| {
            s.professional_id == professional_id && s.date == date && s.start_time == start_time && s.locked
        });
        match slot {
            Some(slot) => {
                slot.locked = false;
                slot.lock_expires_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request_for(slot: &Slot) -> ReserveRequest {
        ReserveRequest {
            patient_id: Uuid::new_v4(),
            professional_id: slot.professional_id,
            date: slot.date,
            start_time: slot.start_time,
            end_time: slot.end_time,
            reason: Some("Check-up".to_string()),
        }
    }

    fn slot() -> Slot {
        Slot::new(
            Uuid::new_v4(),
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn reserve_locks_slot_and_inserts_pending() {
        let slot = slot();
        let store = InMemoryReservationStore::with_slots([slot.clone()]);
        let lock_until = Utc::now() + Duration::minutes(5);

        let appointment = store.reserve(slot.id, &request_for(&slot), lock_until).await.unwrap();

        assert_eq!(appointment.status, AppointmentStatus::Pending);
        let stored = store.slot(slot.id).unwrap();
        assert!(stored.locked);
        assert_eq!(stored.lock_expires_at, Some(lock_until));
    }

    #[tokio::test]
    async fn conflict_leaves_slot_untouched() {
        let slot = slot();
        let store = InMemoryReservationStore::with_slots([slot.clone()]);
        let existing = Appointment::pending(&request_for(&slot));
        store.insert_appointment(existing);

        let result = store
            .reserve(slot.id, &request_for(&slot), Utc::now() + Duration::minutes(5))
            .await;

        assert!(matches!(result, Err(StoreError::Conflict)));
        assert!(!store.slot(slot.id).unwrap().locked);
    }

    #[tokio::test]
    async fn attempt_cas_rejects_stale_count() {
        let slot = slot();
        let store = InMemoryReservationStore::with_slots([slot.clone()]);
        let appointment = store
            .reserve(slot.id, &request_for(&slot), Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        let update = ConfirmationUpdate {
            attempts: 1,
            sent: false,
            confirm: false,
            response: "{}".to_string(),
            attempted_at: Utc::now(),
        };
        let written = store.record_confirmation_attempt(appointment.id, 0, &update).await.unwrap();
        assert_eq!(written.map(|a| a.confirmation_attempts), Some(1));
        assert!(store.record_confirmation_attempt(appointment.id, 0, &update).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirm_does_not_revive_cancelled_appointment() {
        let slot = slot();
        let store = InMemoryReservationStore::with_slots([slot.clone()]);
        let appointment = store
            .reserve(slot.id, &request_for(&slot), Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        store
            .transition_status(appointment.id, AppointmentStatus::Pending, AppointmentStatus::Cancelled)
            .await
            .unwrap();

        let update = ConfirmationUpdate {
            attempts: 1,
            sent: true,
            confirm: true,
            response: "{}".to_string(),
            attempted_at: Utc::now(),
        };
        let written = store
            .record_confirmation_attempt(appointment.id, 0, &update)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(written.status, AppointmentStatus::Cancelled);
        assert!(written.confirmation_sent);
        assert_eq!(written.confirmation_attempts, 1);
    }
}
