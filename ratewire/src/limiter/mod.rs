//! Rate and retry primitives.

pub mod backoff;
pub mod fixed_window;
pub mod target_window;
pub mod token_bucket;

pub use backoff::RetryBackoff;
pub use fixed_window::FixedWindowLimiter;
pub use target_window::TargetWindowLimiter;
pub use token_bucket::RateBudget;
