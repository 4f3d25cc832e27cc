//! ratewire library crate.
//!
//! Priority-ordered, rate-limited dispatch of outbound messages to external
//! channels that enforce their own send caps.
//!
//! - [`dispatch::ChannelDispatcher`] queues and paces messages for one channel.
//! - [`coordinator::GlobalCoordinator`] keeps all channels under a shared global budget.
//! - [`health::HealthWatchdog`] watches mailbox occupancy and raises alerts.
//! - [`hub::DispatchHub`] builds and runs all of the above from a [`config::DispatchConfig`].

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod health;
pub mod hub;
pub mod limiter;
pub mod logging;

pub use error::{Error, Result};
