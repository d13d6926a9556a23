//! Heartbeat protocol
//!
//! The initiator writes one line and reads the reply until the responder
//! closes the stream.

use crate::events::{self, EventSender, NodeEvent};
use async_trait::async_trait;
use meshwire_core::{
    codec, finish_stream, protocols, BoxStream, PeerAddress, PeerId, Result, StreamHandler,
    Transport,
};

/// Reply to a heartbeat
#[derive(Debug, Clone)]
pub struct HeartbeatReply {
    /// The peer that answered
    pub peer: PeerId,
    /// The text it sent back
    pub message: String,
}

/// Line an initiator sends
pub fn request_message(local: &PeerId) -> String {
    format!("{} is checking availability", local)
}

/// Text a responder sends back
pub fn reply_message(local: &PeerId) -> String {
    format!("{} received the message, node is still online", local)
}

/// Check that `destination` is online and return its reply
pub async fn heartbeat<T: Transport + ?Sized>(
    transport: &T,
    destination: &str,
) -> Result<HeartbeatReply> {
    let address: PeerAddress = destination.parse()?;
    let peer = transport.resolve(&address)?;

    let mut stream = transport.open_stream(&peer, &protocols::HEARTBEAT).await?;
    let outcome = exchange(&mut stream).await;
    finish_stream(&mut stream, &outcome).await;
    let message = outcome?;

    tracing::info!("{} reply: {}", peer, message);
    Ok(HeartbeatReply { peer, message })
}

async fn exchange(stream: &mut BoxStream) -> Result<String> {
    let request = request_message(stream.local_peer());
    codec::write_line(stream, &request).await?;
    codec::read_text(stream).await
}

/// Responder for `/heartbeat/1.0.0`
pub struct HeartbeatHandler {
    events: EventSender,
}

impl HeartbeatHandler {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

#[async_trait]
impl StreamHandler for HeartbeatHandler {
    async fn handle(&self, mut stream: BoxStream) {
        let from = stream.remote_peer().clone();
        let outcome = answer(&mut stream).await;
        finish_stream(&mut stream, &outcome).await;

        match outcome {
            Ok(line) => {
                tracing::info!("Received heartbeat from {}: {}", from, line);
                events::emit(&self.events, NodeEvent::HeartbeatReceived { from, line });
            }
            Err(e) => events::inbound_failed(&self.events, from, protocols::HEARTBEAT, &e),
        }
    }
}

async fn answer(stream: &mut BoxStream) -> Result<String> {
    let line = codec::read_line(stream).await?;
    let reply = reply_message(stream.local_peer());
    codec::write_text(stream, &reply).await?;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwire_core::transport::memory::MemoryNetwork;
    use meshwire_core::{handler_fn, ErrorKind};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    fn peer(name: &str) -> PeerId {
        name.parse().unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_roundtrip() {
        let network = MemoryNetwork::new();
        let alice = network.join(peer("alice"));
        let bob = network.join(peer("bob"));
        let events = events::channel();
        let mut observed = events.subscribe();
        bob.register_handler(protocols::HEARTBEAT, Arc::new(HeartbeatHandler::new(events)));

        let reply = heartbeat(&alice, "/p2p/bob").await.unwrap();
        assert_eq!(reply.peer, peer("bob"));
        assert_eq!(reply.message, "bob received the message, node is still online");

        match observed.recv().await.unwrap() {
            NodeEvent::HeartbeatReceived { from, line } => {
                assert_eq!(from, peer("alice"));
                assert_eq!(line, request_message(&peer("alice")));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_responder_resets_on_missing_newline() {
        let network = MemoryNetwork::new();
        let alice = network.join(peer("alice"));
        let bob = network.join(peer("bob"));
        let events = events::channel();
        let mut observed = events.subscribe();
        bob.register_handler(protocols::HEARTBEAT, Arc::new(HeartbeatHandler::new(events)));

        let mut stream = alice
            .open_stream(&peer("bob"), &protocols::HEARTBEAT)
            .await
            .unwrap();
        stream.write_all(b"alice forgot the terminator").await.unwrap();
        stream.shutdown().await.unwrap();

        assert!(codec::read_text(&mut stream).await.is_err());
        assert!(matches!(
            observed.recv().await.unwrap(),
            NodeEvent::InboundFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_errors_by_kind() {
        let network = MemoryNetwork::new();
        let alice = network.join(peer("alice"));
        let bob = network.join(peer("bob"));

        let err = heartbeat(&alice, "not an address").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);

        let err = heartbeat(&alice, "/p2p/bob").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        bob.register_handler(
            protocols::HEARTBEAT,
            handler_fn(|mut stream: BoxStream| async move { stream.reset() }),
        );
        let err = heartbeat(&alice, "/p2p/bob").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
