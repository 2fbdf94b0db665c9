//! # doclink - realtime document subscriptions
//!
//! Client-side core for receiving live updates to server-side documents over
//! one shared websocket connection.
//!
//! doclink keeps a registry of which documents the UI cares about and how
//! urgently, admits and evicts subscriptions against a soft capacity,
//! coalesces bursts of updates per document, suppresses echoes of the
//! client's own writes and replays subscriptions after a reconnect.

pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use client::{Notification, RealtimeClient, SubscriptionHandle};
pub use config::{ClientConfig, TransportConfig};
pub use document::{DocumentKey, TransactionLedger};
pub use error::{DoclinkError, DoclinkResult};
pub use metrics::MetricsSnapshot;
pub use protocol::{ClientMessage, ServerMessage};
pub use subscription::{DocEvent, Priority, SubscriptionState};
pub use transport::{TransportCommand, TransportEvent, TransportHandle};

#[cfg(feature = "websocket")]
pub use transport::Transport;
