//! The single physical connection shared by every subscription.
//!
//! Other components never touch the socket. They hold a [`TransportHandle`]
//! and issue `subscribe_doc` / `unsubscribe_doc` requests through it; the
//! connection task owns the socket, reconnects with backoff and reports
//! [`TransportEvent`]s back.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::document::DocumentKey;
use crate::protocol::{ClientMessage, ServerMessage};

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::Transport;

/// Server verdict on a subscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl AckOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Requests accepted by the connection task
#[derive(Debug)]
pub enum TransportCommand {
    /// Send a message; `ack` resolves when the server acknowledges it.
    /// Dropping `ack` unresolved means the request was lost.
    Send {
        message: ClientMessage,
        ack: Option<oneshot::Sender<AckOutcome>>,
    },
    /// Close the connection and stop reconnecting
    Shutdown,
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Refused,
    Timeout,
    Unauthorized,
    Unreachable,
    Protocol,
    Other,
}

impl ErrorKind {
    /// Critical errors count towards the "connection issues" signal
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            ErrorKind::Refused | ErrorKind::Timeout | ErrorKind::Unauthorized | ErrorKind::Unreachable
        )
    }
}

/// A connection-level error, recorded and retried but never fatal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Why an established connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection
    ServerClosed,
    /// The underlying stream ended
    TransportClosed,
    /// A read or write failed
    TransportError(String),
    /// No pong arrived within the keepalive interval
    PingTimeout,
    /// Closed on request of this client
    ClientClosed,
}

impl DisconnectReason {
    /// Reasons worth surfacing to the user
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ServerClosed
                | DisconnectReason::TransportClosed
                | DisconnectReason::PingTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerClosed => f.write_str("io server disconnect"),
            DisconnectReason::TransportClosed => f.write_str("transport close"),
            DisconnectReason::TransportError(error) => write!(f, "transport error: {}", error),
            DisconnectReason::PingTimeout => f.write_str("ping timeout"),
            DisconnectReason::ClientClosed => f.write_str("io client disconnect"),
        }
    }
}

/// Events reported by the connection task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected(DisconnectReason),
    ReconnectAttempt { attempt: u32 },
    Reconnected { attempts: u32 },
    Error(ConnectionError),
    /// The wire transport changed; `upgrade` is false for a downgrade
    TransportChanged { transport: String, upgrade: bool },
    Message(ServerMessage),
}

/// Cheap, cloneable sender side of the transport
#[derive(Clone, Debug)]
pub struct TransportHandle {
    cmd_tx: mpsc::UnboundedSender<TransportCommand>,
    connected: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Create a handle whose commands are read from the returned receiver
    ///
    /// This is how a transport implementation (or a test) plugs in: it drains
    /// the receiver and reports back through the client's event path.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                cmd_tx,
                connected: Arc::new(AtomicBool::new(false)),
            },
            cmd_rx,
        )
    }

    #[cfg_attr(not(feature = "websocket"), allow(dead_code))]
    pub(crate) fn with_state(
        cmd_tx: mpsc::UnboundedSender<TransportCommand>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self { cmd_tx, connected }
    }

    /// Ask the server for updates on `key`
    ///
    /// Returns false if the transport has shut down.
    pub fn subscribe_doc(
        &self,
        key: &DocumentKey,
        ack: Option<oneshot::Sender<AckOutcome>>,
    ) -> bool {
        self.send(ClientMessage::subscribe(key), ack)
    }

    pub fn unsubscribe_doc(&self, key: &DocumentKey) -> bool {
        self.send(ClientMessage::unsubscribe(key), None)
    }

    fn send(&self, message: ClientMessage, ack: Option<oneshot::Sender<AckOutcome>>) -> bool {
        match self.cmd_tx.send(TransportCommand::Send { message, ack }) {
            Ok(()) => true,
            Err(_) => {
                debug!("Transport is gone, dropping outbound request");
                false
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Shutdown);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record connection state; used by transport implementations
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}
