//! Event envelopes, the action vocabulary, and the transport/handler seams.
//!
//! The transport delivers decoded [`Envelope`]s; an [`EnvelopeHandler`]
//! applies them. Neither side makes storage assumptions.

pub mod action;
pub mod channel;
pub mod envelope;
pub mod handler;
pub mod transport;

pub use action::{Action, EmptyToken, EndOfStreamToken, USER_DELETED, USER_REGISTERED, USER_UPDATED};
pub use channel::{ChannelTransport, TransportSender, channel};
pub use envelope::{Envelope, EnvelopeMetadata};
pub use handler::{Applied, EnvelopeHandler, HandlerError, Route};
pub use transport::{Acknowledge, Transport, TransportClosed};
