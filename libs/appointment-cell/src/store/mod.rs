pub mod memory;
pub mod supabase;

pub use memory::InMemoryReservationStore;
pub use supabase::SupabaseReservationStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Appointment, AppointmentFilter, AppointmentStatus, ConfirmationUpdate, ReserveRequest, Slot,
};

/// Combined Slot + Appointment store.
///
/// `reserve` is the only multi-row write and must run as one atomic unit:
/// re-read the slot, lock it until `lock_until`, re-check the
/// `(professional_id, date, start_time)` tuple, insert the appointment as
/// `PENDING`. A unique constraint on that tuple over non-cancelled rows is the
/// final arbiter when two reservations race.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Slot matching the tuple that is available and not under an unexpired lock.
    async fn find_free_slot(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Option<Slot>, StoreError>;

    /// Non-cancelled appointment occupying the tuple, if any.
    async fn find_active_appointment(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Option<Appointment>, StoreError>;

    async fn reserve(
        &self,
        slot_id: Uuid,
        request: &ReserveRequest,
        lock_until: DateTime<Utc>,
    ) -> Result<Appointment, StoreError>;

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>, StoreError>;

    async fn list_appointments(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError>;

    async fn slots_for_day(&self, professional_id: Uuid, date: NaiveDate) -> Result<Vec<Slot>, StoreError>;

    /// Moves the appointment from `from` to `to`. Returns `None` when the row
    /// exists but no longer has status `from`.
    async fn transition_status(
        &self,
        id: Uuid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Writes a confirmation outcome only if the stored attempt count still
    /// equals `expected_attempts`, and returns the row as written. `None`
    /// means another writer got there first. The status is never moved off
    /// anything but `PENDING`.
    async fn record_confirmation_attempt(
        &self,
        id: Uuid,
        expected_attempts: u32,
        update: &ConfirmationUpdate,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Clears the soft lock on the slot for the tuple. Returns whether a
    /// locked slot was found.
    async fn release_slot_lock(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<bool, StoreError>;
}
