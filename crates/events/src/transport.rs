//! Event transport abstraction (mechanics only).
//!
//! The transport owns broker connections, partitioning, consumer-group
//! coordination and offset handling. The projector only sees:
//!
//! - `Ok(Some(envelope))`: a unit of work
//! - `Ok(None)`: an absent delivery, ignored by consumers
//! - `Err(TransportClosed)`: permanent closure; no further deliveries will arrive
//!
//! Delivery is at-least-once; consumers must tolerate redelivery.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{Envelope, EnvelopeMetadata};

/// Permanent transport closure.
///
/// Distinct from the end-of-stream token, which only means "nothing to read
/// right now".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport closed: {reason}")]
pub struct TransportClosed {
    reason: String,
}

impl TransportClosed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Settles envelopes once handling is over.
///
/// Called exactly once per envelope the consumer finished with (applied or
/// reported). Envelopes never settled stay eligible for redelivery.
pub trait Acknowledge: Send + Sync {
    fn ack(&self, metadata: &EnvelopeMetadata);
}

/// Source of envelopes, consumed by a single receive loop.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next delivery.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportClosed>;

    /// Where finished envelopes are reported, for transports that track
    /// delivery. `None` means delivery is settled on receipt.
    fn acknowledger(&self) -> Option<Arc<dyn Acknowledge>> {
        None
    }
}

#[async_trait]
impl<T> Transport for Box<T>
where
    T: Transport + ?Sized,
{
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportClosed> {
        (**self).recv().await
    }

    fn acknowledger(&self) -> Option<Arc<dyn Acknowledge>> {
        (**self).acknowledger()
    }
}
