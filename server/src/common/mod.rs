pub mod cancellation;
pub mod errors;
pub mod resource_guard;

pub use cancellation::{Bounded, receive_bounded, run_bounded};
pub use errors::{ServiceBusError, ServiceBusResult};
pub use resource_guard::acquire_lock_with_timeout;
