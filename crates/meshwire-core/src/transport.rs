//! Transport abstraction for peer-to-peer streams
//!
//! This module provides a trait-based abstraction over the peer transport,
//! allowing the session layer to run unchanged over the in-memory network
//! (tests, several peers in one process) and over TCP.

use crate::mux::{Multiplexer, StreamHandler};
use crate::{PeerAddress, PeerId, ProtocolId, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// A bidirectional byte stream bound to one protocol between two peers
///
/// Closing is `AsyncWriteExt::shutdown`; `reset` is the abnormal termination
/// signal, which the remote side observes as a read error rather than EOF.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Protocol this stream was opened for
    fn protocol(&self) -> &ProtocolId;

    /// Our side of the stream
    fn local_peer(&self) -> &PeerId;

    /// The other side of the stream
    fn remote_peer(&self) -> &PeerId;

    /// Abort the stream; further reads and writes fail on both sides
    fn reset(&mut self);
}

/// An owned, type-erased stream
pub type BoxStream = Box<dyn Stream>;

/// Transport trait for opening and accepting protocol streams
///
/// Every transport owns the multiplexer its inbound streams are dispatched
/// through, so each peer carries its own handler registry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our own peer id
    fn local_peer(&self) -> &PeerId;

    /// Our own routable address
    fn local_address(&self) -> PeerAddress;

    /// Resolve an address into a peer id, remembering how to reach it
    fn resolve(&self, address: &PeerAddress) -> Result<PeerId>;

    /// Open a fresh stream to `peer` for `protocol`
    async fn open_stream(&self, peer: &PeerId, protocol: &ProtocolId) -> Result<BoxStream>;

    /// The registry inbound streams are dispatched through
    fn multiplexer(&self) -> &Arc<Multiplexer>;

    /// Bind responder logic to a protocol; the last registration wins
    fn register_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>) {
        self.multiplexer().register(protocol, handler);
    }
}

/// Close or reset a stream depending on how the exchange ended
///
/// Both the initiating and the responding side call this on every exit path.
pub async fn finish_stream<T>(stream: &mut BoxStream, outcome: &Result<T>) {
    match outcome {
        Ok(_) => {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(
                    "Closing {} stream with {} failed: {}",
                    stream.protocol(),
                    stream.remote_peer(),
                    e
                );
            }
        }
        Err(e) => {
            tracing::debug!(
                "Resetting {} stream with {}: {}",
                stream.protocol(),
                stream.remote_peer(),
                e
            );
            stream.reset();
        }
    }
}

pub mod memory {
    //! In-memory transport for tests and in-process peers

    use super::*;
    use crate::Error;
    use std::collections::HashMap;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::task::{ready, Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    /// Bytes buffered in each direction of an in-memory stream
    const PIPE_CAPACITY: usize = 64 * 1024;

    /// A shared in-memory network that peers join by id
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        peers: Arc<Mutex<HashMap<PeerId, Arc<Multiplexer>>>>,
    }

    impl MemoryNetwork {
        /// Create an empty network
        pub fn new() -> Self {
            Self::default()
        }

        /// Join the network as `peer`, replacing any previous peer with that id
        pub fn join(&self, peer: PeerId) -> MemoryTransport {
            let mux = Arc::new(Multiplexer::new());
            self.lock().insert(peer.clone(), mux.clone());
            MemoryTransport {
                network: self.clone(),
                local_peer: peer,
                mux,
            }
        }

        /// Remove a peer; subsequent streams to it fail to open
        pub fn leave(&self, peer: &PeerId) {
            self.lock().remove(peer);
        }

        fn lookup(&self, peer: &PeerId) -> Option<Arc<Multiplexer>> {
            self.lock().get(peer).cloned()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<Multiplexer>>> {
            self.peers.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// A peer's handle on a [`MemoryNetwork`]
    pub struct MemoryTransport {
        network: MemoryNetwork,
        local_peer: PeerId,
        mux: Arc<Multiplexer>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn local_peer(&self) -> &PeerId {
            &self.local_peer
        }

        fn local_address(&self) -> PeerAddress {
            PeerAddress::peer_only(&self.local_peer)
        }

        fn resolve(&self, address: &PeerAddress) -> Result<PeerId> {
            address.require_peer_id()
        }

        async fn open_stream(&self, peer: &PeerId, protocol: &ProtocolId) -> Result<BoxStream> {
            let remote = self
                .network
                .lookup(peer)
                .ok_or_else(|| Error::ConnectionFailed(format!("peer {} is not reachable", peer)))?;
            if !remote.supports(protocol) {
                return Err(Error::ProtocolNotSupported(protocol.clone()));
            }

            let (ours, theirs) = MemoryStream::pair(protocol, &self.local_peer, peer);
            remote.dispatch(Box::new(theirs))?;
            Ok(Box::new(ours))
        }

        fn multiplexer(&self) -> &Arc<Multiplexer> {
            &self.mux
        }
    }

    /// One end of an in-memory stream
    pub struct MemoryStream {
        inner: Option<DuplexStream>,
        protocol: ProtocolId,
        local_peer: PeerId,
        remote_peer: PeerId,
        local_reset: Arc<AtomicBool>,
        remote_reset: Arc<AtomicBool>,
    }

    impl MemoryStream {
        /// Create both ends of a stream opened by `initiator` towards `responder`
        pub fn pair(
            protocol: &ProtocolId,
            initiator: &PeerId,
            responder: &PeerId,
        ) -> (MemoryStream, MemoryStream) {
            let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
            let a_reset = Arc::new(AtomicBool::new(false));
            let b_reset = Arc::new(AtomicBool::new(false));
            let ours = MemoryStream {
                inner: Some(a),
                protocol: protocol.clone(),
                local_peer: initiator.clone(),
                remote_peer: responder.clone(),
                local_reset: a_reset.clone(),
                remote_reset: b_reset.clone(),
            };
            let theirs = MemoryStream {
                inner: Some(b),
                protocol: protocol.clone(),
                local_peer: responder.clone(),
                remote_peer: initiator.clone(),
                local_reset: b_reset,
                remote_reset: a_reset,
            };
            (ours, theirs)
        }

        fn reset_error() -> io::Error {
            io::Error::new(io::ErrorKind::ConnectionReset, "stream was reset")
        }
    }

    impl AsyncRead for MemoryStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(Err(Self::reset_error()));
            };
            let before = buf.filled().len();
            let wants_bytes = buf.remaining() > 0;
            ready!(Pin::new(inner).poll_read(cx, buf))?;
            // EOF after a remote reset is an abort, not a clean close
            if wants_bytes
                && buf.filled().len() == before
                && this.remote_reset.load(Ordering::SeqCst)
            {
                return Poll::Ready(Err(Self::reset_error()));
            }
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MemoryStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut().inner.as_mut() {
                Some(inner) => Pin::new(inner).poll_write(cx, buf),
                None => Poll::Ready(Err(Self::reset_error())),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut().inner.as_mut() {
                Some(inner) => Pin::new(inner).poll_flush(cx),
                None => Poll::Ready(Err(Self::reset_error())),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut().inner.as_mut() {
                Some(inner) => Pin::new(inner).poll_shutdown(cx),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    impl Stream for MemoryStream {
        fn protocol(&self) -> &ProtocolId {
            &self.protocol
        }

        fn local_peer(&self) -> &PeerId {
            &self.local_peer
        }

        fn remote_peer(&self) -> &PeerId {
            &self.remote_peer
        }

        fn reset(&mut self) {
            self.local_reset.store(true, Ordering::SeqCst);
            self.inner = None;
        }
    }

}
