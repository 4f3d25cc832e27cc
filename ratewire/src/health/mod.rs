//! Queue health monitoring.
//!
//! [`HealthWatchdog`] periodically classifies every registered dispatcher by
//! mailbox occupancy and raises leveled alerts through an [`AlertCallback`].

mod report;
mod watchdog;

pub use report::{ChannelHealth, HealthLevel, HealthReport};
pub use watchdog::{AlertCallback, HealthWatchdog, WatchdogStats};
