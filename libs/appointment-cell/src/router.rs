// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};

use event_bus_cell::EventBus;
use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::profiles::ProfileDirectory;
use crate::services::{AppointmentBookingService, AppointmentLifecycleService, AvailabilityService};
use crate::store::ReservationStore;

pub struct AppointmentCellState {
    pub config: Arc<AppConfig>,
    pub booking: AppointmentBookingService,
    pub lifecycle: AppointmentLifecycleService,
    pub availability: AvailabilityService,
}

impl AppointmentCellState {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ReservationStore>,
        profiles: Arc<dyn ProfileDirectory>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            booking: AppointmentBookingService::new(store.clone(), profiles.clone(), bus.clone(), &config),
            lifecycle: AppointmentLifecycleService::new(store.clone(), bus),
            availability: AvailabilityService::new(store, profiles),
            config,
        }
    }
}

pub fn appointment_routes(state: Arc<AppointmentCellState>) -> Router {
    // All appointment operations require authentication
    Router::new()
        .route("/", post(handlers::book_appointment).get(handlers::list_appointments))
        .route("/{appointment_id}", get(handlers::get_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .route("/{appointment_id}/status", patch(handlers::update_appointment_status))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware))
        .with_state(state)
}

pub fn professional_routes(state: Arc<AppointmentCellState>) -> Router {
    Router::new()
        .route("/{professional_id}/availability", get(handlers::get_availability))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware))
        .with_state(state)
}
