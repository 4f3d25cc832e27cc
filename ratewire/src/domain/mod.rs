//! Domain value objects.

pub mod message;
pub mod priority;

pub use message::{DEFAULT_MAX_ATTEMPTS, OutboundMessage};
pub use priority::MessagePriority;
