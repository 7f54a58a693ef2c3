pub mod error;
pub mod handlers;
pub mod models;
pub mod profiles;
pub mod router;
pub mod services;
pub mod store;

pub use error::*;
pub use models::*;
pub use profiles::*;
pub use services::*;
pub use store::*;
pub use router::{appointment_routes, professional_routes, AppointmentCellState};
