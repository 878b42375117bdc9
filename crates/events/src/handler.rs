use async_trait::async_trait;

use readmodel_core::DocumentId;

use crate::Envelope;

/// What applying one envelope did to the read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted(DocumentId),
    Updated { matched: u64, modified: u64 },
    Deleted(u64),
    /// Nothing to apply (end-of-stream token).
    Skipped,
}

/// How the supervisor orders an envelope relative to the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Applied in delivery order with every other envelope sharing the key.
    Keyed(String),
    /// No ordering constraint; may run alongside anything.
    Unordered,
    /// May touch state any other envelope touches: applied only after all
    /// earlier envelopes finished, and before any later one starts.
    Exclusive,
}

/// Error raised while handling one envelope.
///
/// `stage` names where handling failed (e.g. `decode`, `store`) for log
/// context.
pub trait HandlerError: std::error::Error + Send + Sync + 'static {
    fn stage(&self) -> &'static str {
        "handle"
    }
}

/// Applies envelopes to a read model.
///
/// This is the seam the supervisor drives. Implementations are shared across
/// concurrently running lanes, so they take `&self` and must be `Sync`.
///
/// Handlers must tolerate redelivery (at-least-once). Errors are scoped to the
/// single envelope; the caller reports them and moves on.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    type Error: HandlerError;

    async fn handle(&self, envelope: &Envelope) -> Result<Applied, Self::Error>;

    /// Ordering constraint for `envelope`.
    ///
    /// The default keys by the transport's ordering key and leaves unkeyed
    /// envelopes unordered.
    fn route(&self, envelope: &Envelope) -> Route {
        match envelope.ordering_key() {
            Some(key) => Route::Keyed(key.to_string()),
            None => Route::Unordered,
        }
    }
}
