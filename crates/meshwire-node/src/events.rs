//! Local reports from the responder side
//!
//! Responders log what they handled and also publish it on a broadcast
//! channel so callers (tests, the CLI) can observe inbound traffic.

use meshwire_core::{Error, PeerId, ProtocolId, TransactionRecord};
use tokio::sync::broadcast;

/// Events buffered per subscriber before the oldest are dropped
pub const EVENT_CAPACITY: usize = 64;

pub type EventSender = broadcast::Sender<NodeEvent>;

/// Something a responder did on behalf of a remote peer
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A heartbeat line was read and answered
    HeartbeatReceived { from: PeerId, line: String },
    /// A transaction record was decoded
    PaymentReceived { from: PeerId, record: TransactionRecord },
    /// The fixed acknowledgment text was sent
    AckServed { to: PeerId },
    /// A snapshot of the shared directory was sent
    SyncServed { to: PeerId, bytes: usize },
    /// An inbound stream was reset after a failure
    InboundFailed {
        from: PeerId,
        protocol: ProtocolId,
        reason: String,
    },
}

/// Create the sender a node's responders publish on
pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Publish an event; having no subscriber is fine
pub(crate) fn emit(events: &EventSender, event: NodeEvent) {
    let _ = events.send(event);
}

/// Log and publish a failed inbound stream
pub(crate) fn inbound_failed(events: &EventSender, from: PeerId, protocol: ProtocolId, error: &Error) {
    tracing::warn!("Inbound {} stream from {} failed: {}", protocol, from, error);
    emit(
        events,
        NodeEvent::InboundFailed {
            from,
            protocol,
            reason: error.to_string(),
        },
    );
}
