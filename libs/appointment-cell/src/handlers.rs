// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{
    Appointment, AppointmentFilter, AvailabilityQuery, ReserveRequest, UpdateStatusRequest,
};
use crate::router::AppointmentCellState;

const PROFESSIONAL_ROLE: &str = "professional";

fn caller_id(user: &User) -> Result<Uuid, AppError> {
    Uuid::parse_str(&user.id).map_err(|_| AppError::Auth("Caller id is not a valid UUID".to_string()))
}

fn is_participant(user: &User, appointment: &Appointment) -> bool {
    user.is_admin()
        || appointment.patient_id.to_string() == user.id
        || appointment.professional_id.to_string() == user.id
}

#[axum::debug_handler]
pub async fn book_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(user): Extension<User>,
    Json(request): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    // Patients book for themselves; staff may book on a patient's behalf
    let is_patient = request.patient_id.to_string() == user.id;
    if !is_patient && !user.is_admin() && !user.has_role(PROFESSIONAL_ROLE) {
        return Err(AppError::Forbidden("Not authorized to book appointment for this patient".to_string()));
    }

    let appointment = state.booking.reserve(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "appointment": appointment,
            "message": "Appointment reserved, confirmation pending"
        })),
    ))
}

#[axum::debug_handler]
pub async fn list_appointments(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(user): Extension<User>,
    Query(mut filter): Query<AppointmentFilter>,
) -> Result<Json<Value>, AppError> {
    if !user.is_admin() {
        let id = caller_id(&user)?;
        if user.has_role(PROFESSIONAL_ROLE) {
            filter.professional_id = Some(id);
        } else {
            filter.patient_id = Some(id);
        }
    }

    let appointments = state.booking.list_appointments(&filter).await?;

    Ok(Json(json!({
        "success": true,
        "total": appointments.len(),
        "appointments": appointments
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.booking.get_appointment(appointment_id).await?;

    if !is_participant(&user, &appointment) {
        return Err(AppError::Forbidden("Not authorized to view this appointment".to_string()));
    }

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.booking.get_appointment(appointment_id).await?;

    if !is_participant(&user, &appointment) {
        return Err(AppError::Forbidden("Not authorized to cancel this appointment".to_string()));
    }

    let cancelled = state.lifecycle.cancel(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": cancelled,
        "message": "Appointment cancelled"
    })))
}

#[axum::debug_handler]
pub async fn update_appointment_status(
    State(state): State<Arc<AppointmentCellState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.booking.get_appointment(appointment_id).await?;

    let is_professional = appointment.professional_id.to_string() == user.id;
    if !is_professional && !user.is_admin() {
        return Err(AppError::Forbidden("Only the professional or an admin can change status".to_string()));
    }

    let updated = state.lifecycle.update_status(appointment_id, request.status).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": updated
    })))
}

#[axum::debug_handler]
pub async fn get_availability(
    State(state): State<Arc<AppointmentCellState>>,
    Path(professional_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Value>, AppError> {
    let availability = state.availability.availability(professional_id, query.date).await?;

    Ok(Json(json!({
        "success": true,
        "availability": availability
    })))
}
