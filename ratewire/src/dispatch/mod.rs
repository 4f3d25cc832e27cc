//! Per-channel queueing and delivery.

pub mod delivery;
pub mod dispatcher;
pub mod mailbox;

pub use delivery::{DeliveryError, DeliveryFunction, FnDelivery, from_fn};
pub use dispatcher::{
    ChannelDispatcher, DispatcherLimits, DispatcherStats, DispatcherTotals, QueueDepths,
};
pub use mailbox::{Admission, PriorityMailbox};
