//! Directory sync protocol
//!
//! The responder packs its whole shared directory into one payload and
//! writes it as a single blob. The initiator decodes it and unpacks into
//! its own shared directory. No chunking, no resumption.

use crate::events::{self, EventSender, NodeEvent};
use async_trait::async_trait;
use meshwire_core::{
    codec, finish_stream, protocols, BoxStream, Error, Packager, PeerAddress, PeerId, Result,
    StreamHandler, SyncPayload, Transport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What an initiator received and where it went
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub peer: PeerId,
    /// Payload size on the wire, excluding the blob head
    pub bytes: usize,
    pub destination: PathBuf,
}

/// Fetch a snapshot from `destination` and unpack it into `shared_dir`
pub async fn request_sync<T: Transport + ?Sized>(
    transport: &T,
    packager: Arc<dyn Packager>,
    destination: &str,
    shared_dir: &Path,
) -> Result<SyncReport> {
    let address: PeerAddress = destination.parse()?;
    let peer = transport.resolve(&address)?;

    let mut stream = transport.open_stream(&peer, &protocols::SYNC).await?;
    let outcome = receive(&mut stream, packager, shared_dir).await;
    finish_stream(&mut stream, &outcome).await;
    let bytes = outcome?;

    tracing::info!(
        "Synced {} bytes from {} into {}",
        bytes,
        peer,
        shared_dir.display()
    );
    Ok(SyncReport {
        peer,
        bytes,
        destination: shared_dir.to_path_buf(),
    })
}

async fn receive(
    stream: &mut BoxStream,
    packager: Arc<dyn Packager>,
    shared_dir: &Path,
) -> Result<usize> {
    let payload = codec::read_blob(stream).await?;
    let bytes = payload.len();
    let destination = shared_dir.to_path_buf();
    run_blocking(move || packager.unpack(&payload, &destination)).await?;
    Ok(bytes)
}

/// Responder for `/sync/1.0.0`
pub struct SyncHandler {
    shared_dir: PathBuf,
    packager: Arc<dyn Packager>,
    events: EventSender,
}

impl SyncHandler {
    pub fn new(
        shared_dir: impl Into<PathBuf>,
        packager: Arc<dyn Packager>,
        events: EventSender,
    ) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            packager,
            events,
        }
    }

    async fn snapshot(&self) -> Result<SyncPayload> {
        let packager = Arc::clone(&self.packager);
        let dir = self.shared_dir.clone();
        run_blocking(move || packager.pack(&dir)).await
    }
}

#[async_trait]
impl StreamHandler for SyncHandler {
    async fn handle(&self, mut stream: BoxStream) {
        let to = stream.remote_peer().clone();

        // Nothing is written unless the snapshot is complete.
        let outcome = match self.snapshot().await {
            Ok(payload) => codec::write_blob(&mut stream, &payload)
                .await
                .map(|()| payload.len()),
            Err(e) => Err(e),
        };
        finish_stream(&mut stream, &outcome).await;

        match outcome {
            Ok(bytes) => {
                tracing::info!(
                    "Sent {} ({} bytes) to {}",
                    self.shared_dir.display(),
                    bytes,
                    to
                );
                events::emit(&self.events, NodeEvent::SyncServed { to, bytes });
            }
            Err(e) => events::inbound_failed(&self.events, to, protocols::SYNC, &e),
        }
    }
}

async fn run_blocking<F, R>(work: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Packaging(format!("packaging task failed: {}", e)))?
}
