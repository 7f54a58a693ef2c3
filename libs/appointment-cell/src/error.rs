use thiserror::Error;
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::AppointmentStatus;

/// Failures reported by a [`crate::store::ReservationStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("slot is no longer available")]
    SlotUnavailable,

    #[error("an active appointment already exists for this professional, date and start time")]
    Conflict,

    #[error("appointment {0} not found")]
    NotFound(Uuid),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AppointmentError {
    #[error("Patient {0} not found")]
    PatientNotFound(Uuid),

    #[error("Professional {0} not found")]
    ProfessionalNotFound(Uuid),

    #[error("Appointment {0} not found")]
    AppointmentNotFound(Uuid),

    #[error("Requested slot is not available")]
    SlotUnavailable,

    #[error("An appointment already exists for this time")]
    Conflict,

    #[error("Appointment {0} was modified concurrently")]
    ConcurrentUpdate(Uuid),

    #[error("Invalid time window: {0}")]
    InvalidTimeWindow(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cannot change status from {from} to {to}")]
    InvalidStatusTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Profile lookup failed: {0}")]
    Profile(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<StoreError> for AppointmentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SlotUnavailable => AppointmentError::SlotUnavailable,
            StoreError::Conflict => AppointmentError::Conflict,
            StoreError::NotFound(id) => AppointmentError::AppointmentNotFound(id),
            StoreError::Backend(msg) => AppointmentError::Store(msg),
        }
    }
}

impl From<AppointmentError> for AppError {
    fn from(e: AppointmentError) -> Self {
        match e {
            AppointmentError::PatientNotFound(_)
            | AppointmentError::ProfessionalNotFound(_)
            | AppointmentError::AppointmentNotFound(_) => AppError::NotFound(e.to_string()),
            AppointmentError::SlotUnavailable
            | AppointmentError::Conflict
            | AppointmentError::ConcurrentUpdate(_) => AppError::Conflict(e.to_string()),
            AppointmentError::InvalidTimeWindow(_)
            | AppointmentError::InvalidStatusTransition { .. } => AppError::BadRequest(e.to_string()),
            AppointmentError::Validation(msg) => AppError::ValidationError(msg),
            AppointmentError::Profile(msg) => AppError::ExternalService(msg),
            AppointmentError::Store(msg) => AppError::Database(msg),
        }
    }
}
