//! Delivery boundary.
//!
//! The dispatcher's only I/O goes through a [`DeliveryFunction`]. Whatever the
//! implementation does (returns an error, panics), the dispatch loop sees a
//! single `Result<(), DeliveryError>`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

use crate::domain::OutboundMessage;

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    /// The channel refused the message for good (unknown or blocked
    /// recipient, bad credentials). Never retried.
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// The channel asked us to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    /// The delivery function panicked.
    #[error("delivery panicked: {0}")]
    Panicked(String),
}

/// Sends one message to the external channel.
///
/// Must be safe to call again with the same message on retry.
#[async_trait]
pub trait DeliveryFunction: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Adapter turning an async closure into a [`DeliveryFunction`].
pub struct FnDelivery<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> DeliveryFunction for FnDelivery<F>
where
    F: Fn(OutboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeliveryError>> + Send,
{
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        (self.f)(message.clone()).await
    }
}

/// Wrap an async closure as a shared delivery function.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn DeliveryFunction>
where
    F: Fn(OutboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
{
    Arc::new(FnDelivery { f })
}

/// Run one attempt, turning a panic into [`DeliveryError::Panicked`].
pub(crate) async fn deliver_guarded(
    delivery: &dyn DeliveryFunction,
    message: &OutboundMessage,
) -> Result<(), DeliveryError> {
    match AssertUnwindSafe(delivery.deliver(message))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(DeliveryError::Panicked(panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
