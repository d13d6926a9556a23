//! TCP transport
//!
//! Every stream is its own TCP connection. Before any protocol bytes, the
//! initiator sends `<peer id>\n<protocol>\n`; the responder answers with
//! `<peer id>\n` followed by either the echoed protocol (accepted) or `na\n`.

use crate::mux::Multiplexer;
use crate::transport::{BoxStream, Stream, Transport};
use crate::{Error, PeerAddress, PeerId, ProtocolId, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Longest negotiation header line, terminator included
const MAX_HEADER_LINE: usize = 256;

/// Reply sent instead of the protocol when it is not supported
const NOT_SUPPORTED: &str = "na";

/// TCP peer transport
pub struct TcpTransport {
    local_peer: PeerId,
    listen_addr: SocketAddr,
    mux: Arc<Multiplexer>,
    address_book: Mutex<HashMap<PeerId, SocketAddr>>,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Listen on `addr` and start accepting inbound streams
    pub async fn bind(local_peer: PeerId, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::ConnectionFailed(format!("failed to listen on {}: {}", addr, e))
        })?;
        let listen_addr = listener.local_addr()?;
        let mux = Arc::new(Multiplexer::new());

        let accept_task = tokio::spawn(accept_loop(listener, local_peer.clone(), mux.clone()));
        tracing::info!("Listening on {} as {}", listen_addr, local_peer);

        Ok(Self {
            local_peer,
            listen_addr,
            mux,
            address_book: Mutex::new(HashMap::new()),
            accept_task,
        })
    }

    /// The socket address the listener is bound to
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Remember where `peer` can be reached
    pub fn add_address(&self, peer: PeerId, addr: SocketAddr) {
        self.address_book
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, addr);
    }

    fn lookup(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.address_book
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    fn local_address(&self) -> PeerAddress {
        PeerAddress::tcp(self.listen_addr, &self.local_peer)
    }

    fn resolve(&self, address: &PeerAddress) -> Result<PeerId> {
        let peer = address.require_peer_id()?;
        let socket = address.socket_addr().ok_or_else(|| {
            Error::InvalidAddress(format!("{} has no /ip4|ip6/.../tcp/ part", address))
        })?;
        self.add_address(peer.clone(), socket);
        Ok(peer)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &ProtocolId) -> Result<BoxStream> {
        let addr = self
            .lookup(peer)
            .ok_or_else(|| Error::ConnectionFailed(format!("no known address for {}", peer)))?;
        let mut socket = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("connect to {}: {}", addr, e)))?;
        socket.set_nodelay(true)?;

        let header = format!("{}\n{}\n", self.local_peer, protocol);
        socket.write_all(header.as_bytes()).await?;
        socket.flush().await?;

        let remote = read_header_line(&mut socket).await?;
        if remote != peer.as_str() {
            return Err(Error::ConnectionFailed(format!(
                "expected peer {} at {}, found {:?}",
                peer, addr, remote
            )));
        }
        let answer = read_header_line(&mut socket).await?;
        if answer == NOT_SUPPORTED {
            return Err(Error::ProtocolNotSupported(protocol.clone()));
        }
        if answer != protocol.as_str() {
            return Err(Error::ConnectionFailed(format!(
                "negotiation for {} answered with {:?}",
                protocol, answer
            )));
        }

        tracing::debug!("Opened {} stream to {} at {}", protocol, peer, addr);
        Ok(Box::new(TcpPeerStream {
            inner: socket,
            protocol: protocol.clone(),
            local_peer: self.local_peer.clone(),
            remote_peer: peer.clone(),
            reset: false,
        }))
    }

    fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }
}

async fn accept_loop(listener: TcpListener, local_peer: PeerId, mux: Arc<Multiplexer>) {
    loop {
        match listener.accept().await {
            Ok((socket, remote_addr)) => {
                let local_peer = local_peer.clone();
                let mux = mux.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_stream(socket, local_peer, &mux).await {
                        tracing::warn!("Inbound stream from {} failed: {}", remote_addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_stream(mut socket: TcpStream, local_peer: PeerId, mux: &Multiplexer) -> Result<()> {
    socket.set_nodelay(true)?;
    let remote_peer: PeerId = read_header_line(&mut socket)
        .await?
        .parse()
        .map_err(|e: Error| Error::ConnectionFailed(e.to_string()))?;
    let protocol = ProtocolId::new(read_header_line(&mut socket).await?);

    let supported = mux.supports(&protocol);
    let answer = if supported {
        protocol.as_str()
    } else {
        NOT_SUPPORTED
    };
    let reply = format!("{}\n{}\n", local_peer, answer);
    socket.write_all(reply.as_bytes()).await?;
    socket.flush().await?;

    if !supported {
        return Err(Error::ProtocolNotSupported(protocol));
    }

    mux.dispatch(Box::new(TcpPeerStream {
        inner: socket,
        protocol,
        local_peer,
        remote_peer,
        reset: false,
    }))?;
    Ok(())
}

/// Read one header line byte by byte so no protocol bytes are consumed
async fn read_header_line(socket: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = socket.read_u8().await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::ConnectionFailed("connection closed during negotiation".to_string())
            } else {
                Error::Io(e)
            }
        })?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() >= MAX_HEADER_LINE {
            return Err(Error::ConnectionFailed(format!(
                "negotiation line exceeds {} bytes",
                MAX_HEADER_LINE
            )));
        }
    }
    String::from_utf8(line)
        .map_err(|_| Error::ConnectionFailed("negotiation line is not UTF-8".to_string()))
}

/// A negotiated protocol stream over one TCP connection
struct TcpPeerStream {
    inner: TcpStream,
    protocol: ProtocolId,
    local_peer: PeerId,
    remote_peer: PeerId,
    reset: bool,
}

impl TcpPeerStream {
    fn reset_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "stream was reset")
    }
}

impl AsyncRead for TcpPeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.reset {
            return Poll::Ready(Err(Self::reset_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpPeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.reset {
            return Poll::Ready(Err(Self::reset_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.reset {
            return Poll::Ready(Err(Self::reset_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.reset {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl Stream for TcpPeerStream {
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
        self.reset = true;
        // A zero linger makes the close that follows the drop an RST, which
        // the remote reads as an error instead of a clean EOF.
        #[allow(deprecated)]
        let lingered = self.inner.set_linger(Some(Duration::ZERO));
        if let Err(e) = lingered {
            tracing::debug!("Failed to set linger on reset: {}", e);
        }
    }
}
