//! Protocol multiplexer
//!
//! Maps protocol ids to responder logic for one peer. Transports hand every
//! accepted stream to [`Multiplexer::dispatch`], which runs the handler bound
//! at that moment on its own task.

use crate::transport::BoxStream;
use crate::{Error, ProtocolId, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;

/// Responder logic for one protocol
///
/// The handler owns the stream and is responsible for closing or resetting
/// it before returning.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: BoxStream);
}

/// Adapter that turns an async closure into a [`StreamHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StreamHandler for FnHandler<F>
where
    F: Fn(BoxStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, stream: BoxStream) {
        (self.0)(stream).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StreamHandler>
where
    F: Fn(BoxStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-peer registry of protocol handlers
#[derive(Default)]
pub struct Multiplexer {
    handlers: RwLock<HashMap<ProtocolId, Arc<dyn StreamHandler>>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `protocol`. Returns true if an earlier handler was replaced.
    pub fn register(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = handlers.insert(protocol.clone(), handler).is_some();
        if replaced {
            tracing::debug!("Replaced handler for {}", protocol);
        } else {
            tracing::info!("Protocol {} multiplexed", protocol);
        }
        replaced
    }

    /// Remove the handler for `protocol`, if any
    pub fn unregister(&self, protocol: &ProtocolId) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol)
            .is_some()
    }

    /// The handler currently bound to `protocol`
    pub fn handler(&self, protocol: &ProtocolId) -> Option<Arc<dyn StreamHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
    }

    pub fn supports(&self, protocol: &ProtocolId) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(protocol)
    }

    /// Registered protocols, sorted
    pub fn protocols(&self) -> Vec<ProtocolId> {
        let mut protocols: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        protocols.sort();
        protocols
    }

    /// Run the handler bound to the stream's protocol on a new task
    ///
    /// Streams for unregistered protocols are reset.
    pub fn dispatch(&self, mut stream: BoxStream) -> Result<JoinHandle<()>> {
        let protocol = stream.protocol().clone();
        let Some(handler) = self.handler(&protocol) else {
            tracing::warn!(
                "No handler for {} stream from {}",
                protocol,
                stream.remote_peer()
            );
            stream.reset();
            return Err(Error::ProtocolNotSupported(protocol));
        };

        tracing::debug!("Dispatching {} stream from {}", protocol, stream.remote_peer());
        Ok(tokio::spawn(async move { handler.handle(stream).await }))
    }
}
