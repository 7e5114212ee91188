//! Delivery of reply fragments to whoever issued the turn.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// More fragments follow.
    Partial,
    /// The reply is finished. The fragment is empty.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub fragment: String,
    pub status: DeliveryStatus,
}

impl TransportEvent {
    #[must_use]
    pub fn partial(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            status: DeliveryStatus::Partial,
        }
    }

    #[must_use]
    pub const fn complete() -> Self {
        Self {
            fragment: String::new(),
            status: DeliveryStatus::Complete,
        }
    }
}

/// Receives reply fragments as they are generated.
///
/// Delivery is best effort: a sink whose consumer went away drops events
/// rather than failing the turn.
pub trait TransportSink: Send {
    fn deliver(&mut self, event: TransportEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TransportSink for NullSink {
    fn deliver(&mut self, _event: TransportEvent) {}
}

/// Forwards events to a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TransportSink for ChannelSink {
    fn deliver(&mut self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Transport receiver dropped; discarding fragment");
        }
    }
}

impl TransportSink for Vec<TransportEvent> {
    fn deliver(&mut self, event: TransportEvent) {
        self.push(event);
    }
}
