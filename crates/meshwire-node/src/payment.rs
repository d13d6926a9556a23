//! Payment protocol and its acknowledgment
//!
//! A payment is two independent exchanges: one transaction record written on
//! a `/payment/1.0.0` stream, then a fixed confirmation read from a separate
//! `/ping/1.0.0` stream. Nothing ties the two together. An ack only shows
//! that the remote answers on the ack protocol; it does not show that the
//! record arrived or decoded.

use crate::events::{self, EventSender, NodeEvent};
use async_trait::async_trait;
use meshwire_core::{
    codec, finish_stream, protocols, BoxStream, Error, PeerAddress, PeerId, Result,
    StreamHandler, TransactionRecord, Transport,
};

/// Confirmation text served on every ack stream
pub const ACK_MESSAGE: &str = "\nTransaction Successful \t Thank You!\n";

/// Outcome of a payment as seen by the payer
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    /// The paying peer (us)
    pub sender: PeerId,
    /// The peer the record and the ack request went to
    pub receiver: PeerId,
    /// The record that was written
    pub record: TransactionRecord,
    /// Whether the record was written and flushed without a local error
    pub record_delivered: bool,
    /// Text read from the ack stream
    pub ack: String,
}

/// Send `amount` to `destination` and collect an acknowledgment
pub async fn pay<T: Transport + ?Sized>(
    transport: &T,
    destination: &str,
    amount: f64,
) -> Result<PaymentReceipt> {
    if !amount.is_finite() {
        return Err(Error::Framing(format!("amount {} cannot be encoded", amount)));
    }
    let address: PeerAddress = destination.parse()?;
    let peer = transport.resolve(&address)?;
    let record = TransactionRecord::new(
        transport.local_address().to_string(),
        address.to_string(),
        amount,
    );

    let mut stream = transport.open_stream(&peer, &protocols::PAYMENT).await?;
    let sent = codec::write_record(&mut stream, &record).await;
    if let Err(e) = &sent {
        tracing::warn!("Writing payment record to {} failed: {}", peer, e);
    }

    // Requested whatever happened to the record.
    let ack = request_ack(transport, &peer).await;
    finish_stream(&mut stream, &sent).await;
    let ack = ack?;

    tracing::info!(
        "{} => {}: {} ({})",
        transport.local_peer(),
        peer,
        amount,
        ack.trim()
    );
    Ok(PaymentReceipt {
        sender: transport.local_peer().clone(),
        receiver: peer,
        record,
        record_delivered: sent.is_ok(),
        ack,
    })
}

/// Open an ack stream to `peer` and read the confirmation
pub async fn request_ack<T: Transport + ?Sized>(transport: &T, peer: &PeerId) -> Result<String> {
    let mut stream = transport.open_stream(peer, &protocols::PING).await?;
    let outcome = codec::read_text(&mut stream).await;
    finish_stream(&mut stream, &outcome).await;
    outcome
}

/// Responder for `/payment/1.0.0`
pub struct PaymentHandler {
    events: EventSender,
}

impl PaymentHandler {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

#[async_trait]
impl StreamHandler for PaymentHandler {
    async fn handle(&self, mut stream: BoxStream) {
        let from = stream.remote_peer().clone();
        let outcome = codec::read_record(&mut stream).await;
        finish_stream(&mut stream, &outcome).await;

        match outcome {
            Ok(record) => {
                tracing::info!("Received amount: {} from {}", record.amount, record.sender);
                events::emit(&self.events, NodeEvent::PaymentReceived { from, record });
            }
            Err(e) => events::inbound_failed(&self.events, from, protocols::PAYMENT, &e),
        }
    }
}

/// Responder for `/ping/1.0.0`
pub struct AckHandler {
    events: EventSender,
}

impl AckHandler {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

#[async_trait]
impl StreamHandler for AckHandler {
    async fn handle(&self, mut stream: BoxStream) {
        let to = stream.remote_peer().clone();
        let outcome = codec::write_text(&mut stream, ACK_MESSAGE).await;
        finish_stream(&mut stream, &outcome).await;

        match outcome {
            Ok(()) => {
                tracing::debug!("Acknowledged payment stream from {}", to);
                events::emit(&self.events, NodeEvent::AckServed { to });
            }
            Err(e) => events::inbound_failed(&self.events, to, protocols::PING, &e),
        }
    }
}
