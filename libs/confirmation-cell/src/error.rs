use thiserror::Error;

use appointment_cell::StoreError;
use event_bus_cell::EventBusError;

/// Processing failures that leave the delivery unsettled; the worker nacks
/// the message with requeue.
#[derive(Error, Debug)]
pub enum ConfirmationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event bus error: {0}")]
    Bus(#[from] EventBusError),

    #[error("Profile lookup failed: {0}")]
    Profile(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Notifier setup failed: {0}")]
    Notifier(String),
}
