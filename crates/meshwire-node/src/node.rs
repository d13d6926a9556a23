//! A peer with its responders mounted
//!
//! `Node` wraps a transport, mounts the heartbeat, payment, ack and sync
//! responders on the transport's multiplexer, and exposes the initiator
//! side of each session.

use crate::events::{self, EventSender, NodeEvent};
use crate::heartbeat::{self, HeartbeatHandler, HeartbeatReply};
use crate::payment::{self, AckHandler, PaymentHandler, PaymentReceipt};
use crate::sync::{self, SyncHandler, SyncReport};
use meshwire_core::{protocols, Packager, PeerAddress, PeerId, ProtocolId, Result, Transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Node<T: Transport> {
    transport: T,
    packager: Arc<dyn Packager>,
    shared_dir: PathBuf,
    events: EventSender,
}

impl<T: Transport> Node<T> {
    /// Create a node; no protocol is served until mounted
    pub fn new(transport: T, packager: Arc<dyn Packager>, shared_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            packager,
            shared_dir: shared_dir.into(),
            events: events::channel(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.transport.local_peer()
    }

    pub fn address(&self) -> PeerAddress {
        self.transport.local_address()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Directory served to and overwritten by sync
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Receive reports from this node's responders
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn mount_heartbeat(&self) {
        self.transport.register_handler(
            protocols::HEARTBEAT,
            Arc::new(HeartbeatHandler::new(self.events.clone())),
        );
    }

    /// Mount the payment responder together with the ack responder
    pub fn mount_payment(&self) {
        self.transport.register_handler(
            protocols::PAYMENT,
            Arc::new(PaymentHandler::new(self.events.clone())),
        );
        self.transport.register_handler(
            protocols::PING,
            Arc::new(AckHandler::new(self.events.clone())),
        );
    }

    pub fn mount_sync(&self) {
        self.transport.register_handler(
            protocols::SYNC,
            Arc::new(SyncHandler::new(
                self.shared_dir.clone(),
                Arc::clone(&self.packager),
                self.events.clone(),
            )),
        );
    }

    pub fn mount_all(&self) {
        self.mount_heartbeat();
        self.mount_payment();
        self.mount_sync();
    }

    /// Protocols currently served, sorted
    pub fn protocols(&self) -> Vec<ProtocolId> {
        self.transport.multiplexer().protocols()
    }

    pub async fn heartbeat(&self, destination: &str) -> Result<HeartbeatReply> {
        heartbeat::heartbeat(&self.transport, destination).await
    }

    pub async fn pay(&self, destination: &str, amount: f64) -> Result<PaymentReceipt> {
        payment::pay(&self.transport, destination, amount).await
    }

    /// Merge a remote snapshot into this node's shared directory, keeping
    /// local files the snapshot does not name
    pub async fn request_sync(&self, destination: &str) -> Result<SyncReport> {
        sync::request_sync(
            &self.transport,
            Arc::clone(&self.packager),
            destination,
            &self.shared_dir,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwire_core::transport::memory::{MemoryNetwork, MemoryTransport};
    use meshwire_core::TarPackager;
    use tempfile::TempDir;

    fn node(network: &MemoryNetwork, name: &str, root: &Path) -> Node<MemoryTransport> {
        let packager = Arc::new(TarPackager::new(root.join(name).join("staging")));
        Node::new(
            network.join(name.parse().unwrap()),
            packager,
            root.join(name).join("data"),
        )
    }

    #[test]
    fn test_mounting() {
        let tmp = TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice", tmp.path());
        assert!(alice.protocols().is_empty());

        alice.mount_payment();
        assert_eq!(alice.protocols(), vec![protocols::PAYMENT, protocols::PING]);

        alice.mount_all();
        assert_eq!(alice.protocols().len(), 4);
        assert_eq!(alice.address().as_str(), "/p2p/alice");
    }

    #[tokio::test]
    async fn test_sessions_between_nodes() {
        let tmp = TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice", tmp.path());
        let bob = node(&network, "bob", tmp.path());
        bob.mount_all();
        std::fs::create_dir_all(bob.shared_dir()).unwrap();
        std::fs::write(bob.shared_dir().join("ledger.txt"), b"42").unwrap();

        let reply = alice.heartbeat("/p2p/bob").await.unwrap();
        assert!(reply.message.starts_with("bob "));

        let receipt = alice.pay("/p2p/bob", 0.1 + 0.2).await.unwrap();
        assert_eq!(receipt.record.amount, 0.1 + 0.2);

        alice.request_sync("/p2p/bob").await.unwrap();
        assert_eq!(
            std::fs::read(alice.shared_dir().join("ledger.txt")).unwrap(),
            b"42"
        );
    }
}
