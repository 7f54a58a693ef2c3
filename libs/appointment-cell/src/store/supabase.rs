use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::supabase::{SupabaseClient, SupabaseError};

use crate::error::StoreError;
use crate::models::{
    Appointment, AppointmentFilter, AppointmentStatus, ConfirmationUpdate, ReserveRequest, Slot,
};
use crate::store::ReservationStore;

/// SQLSTATEs raised by `reserve_appointment` (see `migrations/`).
const SLOT_UNAVAILABLE_STATE: &str = "BK001";
const TUPLE_TAKEN_STATE: &str = "BK002";
const UNIQUE_VIOLATION_STATE: &str = "23505";

/// Store backed by PostgREST. The reservation transaction runs server-side
/// in the `reserve_appointment` function.
pub struct SupabaseReservationStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseReservationStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn patch_one(&self, path: &str, body: Value) -> Result<Option<Appointment>, StoreError> {
        let rows: Vec<Appointment> = self
            .supabase
            .request_returning(Method::PATCH, path, body)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, StoreError> {
        let rows: Vec<T> = self.supabase.request(Method::GET, path, None, None).await?;
        Ok(rows)
    }
}

fn map_reserve_error(e: SupabaseError) -> StoreError {
    match e.sql_state() {
        Some(SLOT_UNAVAILABLE_STATE) => StoreError::SlotUnavailable,
        Some(TUPLE_TAKEN_STATE) | Some(UNIQUE_VIOLATION_STATE) => StoreError::Conflict,
        _ => StoreError::Backend(e.to_string()),
    }
}

fn backend(e: SupabaseError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn list_path(filter: &AppointmentFilter) -> String {
    let mut query_parts = vec!["select=*".to_string()];

    if let Some(status) = filter.status {
        query_parts.push(format!("status=eq.{}", status));
    }
    if let Some(professional_id) = filter.professional_id {
        query_parts.push(format!("professional_id=eq.{}", professional_id));
    }
    if let Some(patient_id) = filter.patient_id {
        query_parts.push(format!("patient_id=eq.{}", patient_id));
    }
    if let Some(from_date) = filter.from_date {
        query_parts.push(format!("date=gte.{}", from_date));
    }
    if let Some(to_date) = filter.to_date {
        query_parts.push(format!("date=lte.{}", to_date));
    }

    query_parts.push("order=date.asc,start_time.asc".to_string());
    query_parts.push(format!("limit={}", filter.effective_limit()));

    format!("/rest/v1/appointments?{}", query_parts.join("&"))
}

#[async_trait]
impl ReservationStore for SupabaseReservationStore {
    async fn find_free_slot(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Option<Slot>, StoreError> {
        let path = format!(
            "/rest/v1/slots?professional_id=eq.{}&date=eq.{}&start_time=eq.{}&is_available=eq.true",
            professional_id, date, start_time
        );
        let slots: Vec<Slot> = self.fetch(&path).await?;

        // Lock expiry is judged against our clock, same as the in-process store.
        let now = Utc::now();
        Ok(slots.into_iter().find(|s| s.is_free(now)))
    }

    async fn find_active_appointment(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Option<Appointment>, StoreError> {
        let path = format!(
            "/rest/v1/appointments?professional_id=eq.{}&date=eq.{}&start_time=eq.{}&status=neq.{}&limit=1",
            professional_id,
            date,
            start_time,
            AppointmentStatus::Cancelled
        );
        let rows: Vec<Appointment> = self.fetch(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn reserve(
        &self,
        slot_id: Uuid,
        request: &ReserveRequest,
        lock_until: DateTime<Utc>,
    ) -> Result<Appointment, StoreError> {
        let args = json!({
            "p_slot_id": slot_id,
            "p_patient_id": request.patient_id,
            "p_professional_id": request.professional_id,
            "p_date": request.date,
            "p_start_time": request.start_time,
            "p_end_time": request.end_time,
            "p_reason": request.reason,
            "p_lock_until": lock_until.to_rfc3339(),
        });

        self.supabase
            .rpc::<Appointment>("reserve_appointment", args)
            .await
            .map_err(|e| {
                let mapped = map_reserve_error(e);
                debug!("reserve_appointment rejected slot {}: {}", slot_id, mapped);
                mapped
            })
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", id);
        let rows: Vec<Appointment> = self.fetch(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn list_appointments(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError> {
        self.fetch(&list_path(filter)).await
    }

    async fn slots_for_day(&self, professional_id: Uuid, date: NaiveDate) -> Result<Vec<Slot>, StoreError> {
        let path = format!(
            "/rest/v1/slots?professional_id=eq.{}&date=eq.{}&order=start_time.asc",
            professional_id, date
        );
        self.fetch(&path).await
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<Option<Appointment>, StoreError> {
        let path = format!("/rest/v1/appointments?id=eq.{}&status=eq.{}", id, from);
        let body = json!({
            "status": to,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let rows: Vec<Appointment> = self
            .supabase
            .request_returning(Method::PATCH, &path, body)
            .await
            .map_err(backend)?;

        match rows.into_iter().next() {
            Some(updated) => Ok(Some(updated)),
            None => match self.get_appointment(id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn record_confirmation_attempt(
        &self,
        id: Uuid,
        expected_attempts: u32,
        update: &ConfirmationUpdate,
    ) -> Result<Option<Appointment>, StoreError> {
        let path = format!(
            "/rest/v1/appointments?id=eq.{}&confirmation_attempts=eq.{}",
            id, expected_attempts
        );

        let body = json!({
            "confirmation_attempts": update.attempts,
            "confirmation_sent": update.sent,
            "last_confirmation_response": update.response,
            "last_attempt_at": update.attempted_at.to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        });

        if update.confirm {
            let mut confirming = body.clone();
            if let Some(fields) = confirming.as_object_mut() {
                fields.insert(
                    "status".to_string(),
                    Value::String(AppointmentStatus::Confirmed.to_string()),
                );
            }
            let confirm_path = format!("{}&status=eq.{}", path, AppointmentStatus::Pending);
            if let Some(row) = self.patch_one(&confirm_path, confirming).await? {
                return Ok(Some(row));
            }
            debug!("Appointment {} left PENDING or lost the attempt race, recording counters only", id);
        }

        let written = self.patch_one(&path, body).await?;
        if written.is_none() {
            warn!(
                "Confirmation attempt for appointment {} not recorded: stored count is no longer {}",
                id, expected_attempts
            );
        }
        Ok(written)
    }

    async fn release_slot_lock(
        &self,
        professional_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<bool, StoreError> {
        let path = format!(
            "/rest/v1/slots?professional_id=eq.{}&date=eq.{}&start_time=eq.{}&is_locked=eq.true",
            professional_id, date, start_time
        );
        let body = json!({
            "is_locked": false,
            "lock_expires_at": null,
        });

        let rows: Vec<Value> = self
            .supabase
            .request_returning(Method::PATCH, &path, body)
            .await
            .map_err(backend)?;
        Ok(!rows.is_empty())
    }
}
