//! Bulk operations on messages identified by sequence number.
//!
//! - `collector`: peek-lock scan that finds target messages and releases the rest
//! - `deleter`: delete by sequence number
//! - `purger`: drain an entity
//! - `sender`: resend copies with per-message fallback
//! - `resubmitter`: move dead-lettered messages back to their entity
//! - `types`: results and shared context

pub mod collector;
pub mod deleter;
pub mod purger;
pub mod resubmitter;
pub mod sender;
pub mod types;

pub use collector::MessageCollector;
pub use deleter::MessageDeleter;
pub use purger::MessagePurger;
pub use resubmitter::DeadLetterResubmitter;
pub use sender::MessageResender;
pub use types::{BulkOperationContext, BulkOperationResult};
