mod admission;
mod error_handler;
mod idempotency;

pub use admission::admission;
pub use error_handler::log_errors;
pub use idempotency::idempotency;
