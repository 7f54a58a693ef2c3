pub mod error;
pub mod models;
pub mod services;
pub mod topology;

pub use error::*;
pub use models::*;
pub use services::*;
pub use topology::*;
