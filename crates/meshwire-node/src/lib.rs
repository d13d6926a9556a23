//! meshwire node library
//!
//! Session handlers for the heartbeat, payment and sync protocols, and a
//! `Node` that mounts them on any transport.

pub mod config;
pub mod events;
pub mod heartbeat;
pub mod node;
pub mod payment;
pub mod sync;

pub use events::NodeEvent;
pub use heartbeat::{heartbeat, HeartbeatReply};
pub use node::Node;
pub use payment::{pay, request_ack, PaymentReceipt, ACK_MESSAGE};
pub use sync::{request_sync, SyncReport};
