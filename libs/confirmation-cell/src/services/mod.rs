pub mod notifier;
pub mod processor;
pub mod signing;
pub mod worker;

pub use notifier::{HttpNotifier, Notifier, EVENT_HEADER, SIGNATURE_HEADER};
pub use processor::ConfirmationProcessor;
pub use signing::{sign, verify_signature, SignedPayload};
pub use worker::ConfirmationWorker;
