//! meshwire core - shared types, stream codecs, transports, and multiplexing
//!
//! This crate provides the building blocks the meshwire session protocols
//! run on: the data model, the three wire framings, the transport and
//! stream abstractions, and the per-peer protocol multiplexer.

pub mod archive;
pub mod codec;
pub mod error;
pub mod mux;
pub mod tcp_transport;
pub mod transport;
pub mod types;

pub use archive::{Packager, TarPackager};
pub use error::{Error, ErrorKind, Result};
pub use mux::{handler_fn, Multiplexer, StreamHandler};
pub use tcp_transport::TcpTransport;
pub use transport::{finish_stream, BoxStream, Stream, Transport};
pub use types::*;
