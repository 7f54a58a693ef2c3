// libs/appointment-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppointmentError;

// ==============================================================================
// SLOTS
// ==============================================================================

/// Bookable window for one professional. `locked` is a soft, time-boxed hold
/// that stops counting once `lock_expires_at` has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Uuid,
    pub professional_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(rename = "is_available")]
    pub available: bool,
    #[serde(rename = "is_locked")]
    pub locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn new(professional_id: Uuid, date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            professional_id,
            date,
            start_time,
            end_time,
            available: true,
            locked: false,
            lock_expires_at: None,
        }
    }

    /// A lock without an expiry never lapses on its own.
    pub fn lock_active(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.lock_expires_at.map_or(true, |expires| expires > now)
    }

    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        self.available && !self.lock_active(now)
    }
}

// ==============================================================================
// APPOINTMENTS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::NoShow => "NO_SHOW",
        }
    }

    /// Every status except `Cancelled` occupies the professional's time.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    pub confirmation_sent: bool,
    pub confirmation_attempts: u32,
    pub last_confirmation_response: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn pending(request: &ReserveRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            professional_id: request.professional_id,
            date: request.date,
            start_time: request.start_time,
            end_time: request.end_time,
            status: AppointmentStatus::Pending,
            reason: request.reason.clone(),
            confirmation_sent: false,
            confirmation_attempts: 0,
            last_confirmation_response: None,
            last_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn occupies(&self, professional_id: Uuid, date: NaiveDate, start_time: NaiveTime) -> bool {
        self.status.holds_slot()
            && self.professional_id == professional_id
            && self.date == date
            && self.start_time == start_time
    }

    pub fn confirmation_state(&self, max_retries: u32) -> ConfirmationState {
        if self.confirmation_sent {
            ConfirmationState::SentOk
        } else if self.confirmation_attempts == 0 {
            ConfirmationState::NotSent
        } else if self.confirmation_attempts < max_retries {
            ConfirmationState::PendingRetry
        } else {
            ConfirmationState::DeadLettered
        }
    }
}

/// Confirmation sub-status, derived from the attempt counters and
/// independent of the business `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationState {
    NotSent,
    PendingRetry,
    SentOk,
    DeadLettered,
}

impl ConfirmationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConfirmationState::SentOk | ConfirmationState::DeadLettered)
    }
}

/// Outcome of one notification call, written with a compare-and-set on the
/// previous attempt count. `confirm` moves the appointment to `CONFIRMED`
/// only if it is still `PENDING` at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationUpdate {
    pub attempts: u32,
    pub sent: bool,
    pub confirm: bool,
    pub response: String,
    pub attempted_at: DateTime<Utc>,
}

// ==============================================================================
// REQUESTS AND QUERIES
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub date: NaiveDate,
    #[serde(with = "clock_time")]
    pub start_time: NaiveTime,
    #[serde(with = "clock_time")]
    pub end_time: NaiveTime,
    pub reason: Option<String>,
}

impl ReserveRequest {
    pub fn validate(&self) -> Result<(), AppointmentError> {
        if self.end_time <= self.start_time {
            return Err(AppointmentError::InvalidTimeWindow(format!(
                "end time {} must be after start time {}",
                self.end_time, self.start_time
            )));
        }
        if let Some(reason) = &self.reason {
            if reason.chars().count() > MAX_REASON_LENGTH {
                return Err(AppointmentError::Validation(format!(
                    "reason must be at most {} characters",
                    MAX_REASON_LENGTH
                )));
            }
        }
        Ok(())
    }
}

pub const MAX_REASON_LENGTH: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentFilter {
    pub status: Option<AppointmentStatus>,
    pub professional_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

impl AppointmentFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }

    pub fn for_day(professional_id: Uuid, date: NaiveDate) -> Self {
        Self {
            professional_id: Some(professional_id),
            from_date: Some(date),
            to_date: Some(date),
            limit: Some(MAX_LIST_LIMIT),
            ..Self::default()
        }
    }

    pub fn matches(&self, appointment: &Appointment) -> bool {
        self.status.map_or(true, |s| appointment.status == s)
            && self.professional_id.map_or(true, |id| appointment.professional_id == id)
            && self.patient_id.map_or(true, |id| appointment.patient_id == id)
            && self.from_date.map_or(true, |d| appointment.date >= d)
            && self.to_date.map_or(true, |d| appointment.date <= d)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
}

// ==============================================================================
// PROFILES AND AVAILABILITY
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSummary {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfessionalSummary {
    pub id: Uuid,
    pub name: String,
    pub specialty: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableSlot {
    pub slot_id: Uuid,
    #[serde(with = "clock_time")]
    pub start_time: NaiveTime,
    #[serde(with = "clock_time")]
    pub end_time: NaiveTime,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub professional: ProfessionalSummary,
    pub date: NaiveDate,
    pub slots: Vec<AvailableSlot>,
}

/// `HH:MM` on the way out; `HH:MM` or `HH:MM:SS` accepted on the way in.
pub mod clock_time {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid time '{}', expected HH:MM", raw)))
    }

    pub fn parse(raw: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn expired_lock_counts_as_unlocked() {
        let now = Utc::now();
        let mut slot = Slot::new(Uuid::new_v4(), now.date_naive(), time(10, 0), time(10, 30));
        slot.locked = true;

        slot.lock_expires_at = Some(now - Duration::seconds(1));
        assert!(slot.is_free(now));

        slot.lock_expires_at = Some(now + Duration::minutes(5));
        assert!(!slot.is_free(now));

        slot.lock_expires_at = None;
        assert!(!slot.is_free(now));
    }

    #[test]
    fn status_uses_upper_case_wire_names() {
        assert_eq!(serde_json::to_value(AppointmentStatus::NoShow).unwrap(), json!("NO_SHOW"));
        let parsed: AppointmentStatus = serde_json::from_value(json!("CONFIRMED")).unwrap();
        assert_eq!(parsed, AppointmentStatus::Confirmed);
    }

    #[test]
    fn reserve_request_accepts_short_and_long_times() {
        let request: ReserveRequest = serde_json::from_value(json!({
            "patientId": Uuid::new_v4(),
            "professionalId": Uuid::new_v4(),
            "date": "2025-03-10",
            "startTime": "10:00",
            "endTime": "10:30:00",
            "reason": null
        }))
        .unwrap();

        assert_eq!(request.start_time, time(10, 0));
        assert_eq!(request.end_time, time(10, 30));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn empty_window_is_rejected() {
        let request = ReserveRequest {
            patient_id: Uuid::new_v4(),
            professional_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            start_time: time(10, 0),
            end_time: time(10, 0),
            reason: None,
        };
        assert!(matches!(request.validate(), Err(AppointmentError::InvalidTimeWindow(_))));
    }

    #[test]
    fn confirmation_state_follows_counters() {
        let request = ReserveRequest {
            patient_id: Uuid::new_v4(),
            professional_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            start_time: time(10, 0),
            end_time: time(10, 30),
            reason: None,
        };
        let mut appointment = Appointment::pending(&request);
        assert_eq!(appointment.confirmation_state(3), ConfirmationState::NotSent);

        appointment.confirmation_attempts = 2;
        assert_eq!(appointment.confirmation_state(3), ConfirmationState::PendingRetry);

        appointment.confirmation_attempts = 3;
        assert!(appointment.confirmation_state(3).is_terminal());

        appointment.confirmation_sent = true;
        assert_eq!(appointment.confirmation_state(3), ConfirmationState::SentOk);
    }
}
