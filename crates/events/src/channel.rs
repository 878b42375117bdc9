//! In-process transport over a bounded tokio channel.
//!
//! Used by tests and as the hand-off point for broker adapters that poll on
//! their own thread.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{Acknowledge, Transport, TransportClosed};
use crate::Envelope;

#[derive(Debug)]
enum Delivery {
    Envelope(Envelope),
    Absent,
    Closed(String),
}

/// Producer half. Cloneable; the transport closes once every sender is
/// dropped or [`TransportSender::close`] is called.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<Delivery>,
}

/// Consumer half, handed to the supervisor.
pub struct ChannelTransport {
    rx: mpsc::Receiver<Delivery>,
    closed: Option<TransportClosed>,
    acknowledger: Option<Arc<dyn Acknowledge>>,
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("closed", &self.closed)
            .field("acknowledged", &self.acknowledger.is_some())
            .finish()
    }
}

impl ChannelTransport {
    /// Report finished envelopes to `acknowledger` (e.g. a broker poller
    /// feeding this channel).
    pub fn with_acknowledger(mut self, acknowledger: Arc<dyn Acknowledge>) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }
}

/// Create a connected sender/transport pair holding up to `capacity`
/// undelivered items.
pub fn channel(capacity: usize) -> (TransportSender, ChannelTransport) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TransportSender { tx },
        ChannelTransport {
            rx,
            closed: None,
            acknowledger: None,
        },
    )
}

fn receiver_gone() -> TransportClosed {
    TransportClosed::new("receiver dropped")
}

impl TransportSender {
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportClosed> {
        self.tx
            .send(Delivery::Envelope(envelope))
            .await
            .map_err(|_| receiver_gone())
    }

    /// Deliver "nothing" (an absent envelope).
    pub async fn send_absent(&self) -> Result<(), TransportClosed> {
        self.tx.send(Delivery::Absent).await.map_err(|_| receiver_gone())
    }

    /// Close the transport permanently with a reason.
    pub async fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Delivery::Closed(reason.into())).await;
    }

    /// Blocking variant of [`send`](Self::send) for non-async poller threads.
    pub fn blocking_send(&self, envelope: Envelope) -> Result<(), TransportClosed> {
        self.tx
            .blocking_send(Delivery::Envelope(envelope))
            .map_err(|_| receiver_gone())
    }

    /// Blocking variant of [`close`](Self::close).
    pub fn blocking_close(&self, reason: impl Into<String>) {
        let _ = self.tx.blocking_send(Delivery::Closed(reason.into()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportClosed> {
        if let Some(closed) = &self.closed {
            return Err(closed.clone());
        }

        match self.rx.recv().await {
            Some(Delivery::Envelope(envelope)) => Ok(Some(envelope)),
            Some(Delivery::Absent) => Ok(None),
            Some(Delivery::Closed(reason)) => {
                let closed = TransportClosed::new(reason);
                self.closed = Some(closed.clone());
                self.rx.close();
                Err(closed)
            }
            None => {
                let closed = TransportClosed::new("all senders dropped");
                self.closed = Some(closed.clone());
                Err(closed)
            }
        }
    }

    fn acknowledger(&self) -> Option<Arc<dyn Acknowledge>> {
        self.acknowledger.clone()
    }
}
