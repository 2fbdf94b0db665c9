use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{
    reconnect_delay, AckOutcome, ConnectionError, DisconnectReason, ErrorKind, TransportCommand,
    TransportEvent, TransportHandle,
};
use crate::config::TransportConfig;
use crate::protocol::{decode_message, decode_text, encode_message, ClientMessage, ServerMessage};
use crate::DoclinkResult;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket transport: one connection per instance, reconnecting forever
///
/// Construct one per process and share it; [`Transport::connect`] is
/// idempotent and every caller gets the same [`TransportHandle`].
pub struct Transport {
    config: TransportConfig,
    handle: OnceLock<TransportHandle>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            handle: OnceLock::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Start the connection task on first call and return the shared handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> TransportHandle {
        self.handle
            .get_or_init(|| {
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let connected = Arc::new(AtomicBool::new(false));
                let task = ConnectionTask {
                    config: self.config.clone(),
                    events: self.events_tx.clone(),
                    connected: connected.clone(),
                    pending_acks: HashMap::new(),
                    next_request_id: 1,
                };

                info!("Starting transport for {}", self.config.url);
                tokio::spawn(task.run(cmd_rx));
                TransportHandle::with_state(cmd_tx, connected)
            })
            .clone()
    }

    /// Take the event stream; only the first caller gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().ok()?.take()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

enum Wake {
    Elapsed,
    Shutdown,
}

struct ConnectionTask {
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    pending_acks: HashMap<u64, oneshot::Sender<AckOutcome>>,
    next_request_id: u64,
}

impl ConnectionTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>) {
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                self.emit(TransportEvent::ReconnectAttempt { attempt });
                let delay = reconnect_delay(
                    attempt,
                    self.config.reconnect_delay(),
                    self.config.max_reconnect_delay(),
                );
                info!("Attempting reconnection in {:?} (attempt {})", delay, attempt);

                if let Wake::Shutdown = self.idle(&mut cmd_rx, delay).await {
                    info!("Transport shut down while disconnected");
                    return;
                }
            }

            match establish(&self.config).await {
                Ok(ws) => {
                    if attempt > 0 {
                        info!("Connection restored after {} attempts", attempt);
                        self.emit(TransportEvent::Reconnected { attempts: attempt });
                    }
                    self.connected.store(true, Ordering::Release);
                    self.emit(TransportEvent::TransportChanged {
                        transport: "websocket".to_string(),
                        upgrade: true,
                    });
                    self.emit(TransportEvent::Connected);

                    let reason = self.drive(ws, &mut cmd_rx).await;

                    self.connected.store(false, Ordering::Release);
                    if !self.pending_acks.is_empty() {
                        debug!(
                            "Dropping {} unacknowledged subscribe requests",
                            self.pending_acks.len()
                        );
                        self.pending_acks.clear();
                    }

                    info!("Disconnected: {}", reason);
                    let shutting_down = reason == DisconnectReason::ClientClosed;
                    self.emit(TransportEvent::Disconnected(reason));
                    if shutting_down {
                        return;
                    }
                    attempt = 1;
                }
                Err(err) => {
                    warn!("Connection attempt failed: {}", err);
                    self.emit(TransportEvent::Error(err));
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Wait out a reconnect delay, discarding requests made while offline
    ///
    /// Subscriptions are replayed from the registry on reconnect, so nothing
    /// sent here needs to be kept.
    async fn idle(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
        delay: std::time::Duration,
    ) -> Wake {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Wake::Elapsed,
                cmd = cmd_rx.recv() => match cmd {
                    Some(TransportCommand::Send { message, .. }) => {
                        debug!("Not connected, dropping {:?}", message);
                    }
                    Some(TransportCommand::Shutdown) | None => return Wake::Shutdown,
                },
            }
        }
    }

    async fn drive(
        &mut self,
        mut ws: WsStream,
        cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
    ) -> DisconnectReason {
        let mut keepalive = self.config.ping_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(TransportCommand::Send { message, ack }) => {
                        if let Err(reason) = self.send(&mut ws, message, ack).await {
                            return reason;
                        }
                    }
                    Some(TransportCommand::Shutdown) | None => {
                        if let Err(e) = ws.close(None).await {
                            debug!("Close handshake failed: {}", e);
                        }
                        return DisconnectReason::ClientClosed;
                    }
                },

                _ = tick(&mut keepalive) => {
                    if awaiting_pong {
                        warn!("No pong within keepalive interval, server unresponsive");
                        return DisconnectReason::PingTimeout;
                    }
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        warn!("Keepalive ping failed: {}", e);
                        return DisconnectReason::TransportError(e.to_string());
                    }
                    awaiting_pong = true;
                }

                frame = ws.next() => {
                    awaiting_pong = false;
                    match frame {
                        Some(Ok(Message::Binary(data))) => self.dispatch(decode_message(&data)),
                        Some(Ok(Message::Text(text))) => self.dispatch(decode_text(text.as_str())),
                        Some(Ok(Message::Close(_))) => {
                            info!("Server closed connection");
                            return DisconnectReason::ServerClosed;
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite queues the pong itself
                            debug!("Received ping");
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong");
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            return DisconnectReason::TransportError(e.to_string());
                        }
                        None => return DisconnectReason::TransportClosed,
                    }
                }
            }
        }
    }

    async fn send(
        &mut self,
        ws: &mut WsStream,
        message: ClientMessage,
        ack: Option<oneshot::Sender<AckOutcome>>,
    ) -> Result<(), DisconnectReason> {
        let message = match ack {
            Some(ack) if matches!(message, ClientMessage::SubscribeDoc { .. }) => {
                let request_id = self.track_ack(ack);
                message.with_request_id(request_id)
            }
            _ => message,
        };

        let encoded = match encode_message(&message) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode {:?}: {}", message, e);
                return Ok(());
            }
        };

        debug!("Sending {:?}", message);
        ws.send(Message::Binary(encoded)).await.map_err(|e| {
            error!("Failed to send WebSocket message: {}", e);
            DisconnectReason::TransportError(e.to_string())
        })
    }

    /// Record `ack` under a fresh request id, forgetting waiters that gave up
    fn track_ack(&mut self, ack: oneshot::Sender<AckOutcome>) -> u64 {
        self.pending_acks.retain(|_, waiter| !waiter.is_closed());
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending_acks.insert(request_id, ack);
        request_id
    }

    fn dispatch(&mut self, decoded: DoclinkResult<ServerMessage>) {
        match decoded {
            Ok(ServerMessage::Ack {
                request_id: Some(request_id),
                success,
                error,
            }) => match self.pending_acks.remove(&request_id) {
                Some(ack) => {
                    let _ = ack.send(AckOutcome { success, error });
                }
                None => debug!("Ack for unknown request {}", request_id),
            },
            Ok(message) => self.emit(TransportEvent::Message(message)),
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.emit(TransportEvent::Error(ConnectionError::new(
                    ErrorKind::Protocol,
                    e.to_string(),
                )));
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for transport events");
        }
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn establish(config: &TransportConfig) -> Result<WsStream, ConnectionError> {
    debug!("Establishing WebSocket connection to {}", config.url);

    match tokio::time::timeout(config.connect_timeout(), connect_async(config.url.as_str())).await {
        Ok(Ok((stream, _response))) => {
            info!("WebSocket connected to {}", config.url);
            Ok(stream)
        }
        Ok(Err(e)) => Err(classify(e)),
        Err(_) => Err(ConnectionError::new(
            ErrorKind::Timeout,
            format!("Timeout connecting after {:?}", config.connect_timeout()),
        )),
    }
}

fn classify(error: tungstenite::Error) -> ConnectionError {
    match &error {
        tungstenite::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                ConnectionError::new(ErrorKind::Refused, format!("Connection refused: {}", io))
            }
            std::io::ErrorKind::TimedOut => {
                ConnectionError::new(ErrorKind::Timeout, format!("Timeout: {}", io))
            }
            _ => ConnectionError::new(
                ErrorKind::Unreachable,
                format!("Cannot connect to host: {}", io),
            ),
        },
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            401 | 403 => ConnectionError::new(
                ErrorKind::Unauthorized,
                format!("Authentication failed: HTTP {}", response.status()),
            ),
            code => ConnectionError::new(ErrorKind::Other, format!("WebSocket HTTP error: {}", code)),
        },
        _ => ConnectionError::new(ErrorKind::Other, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_refused() {
        let error = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let classified = classify(error);
        assert_eq!(classified.kind, ErrorKind::Refused);
        assert!(classified.kind.is_critical());
    }

    #[test]
    fn test_classify_other_io_as_unreachable() {
        let error = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "dns failure",
        ));
        assert_eq!(classify(error).kind, ErrorKind::Unreachable);
    }

    fn task() -> (ConnectionTask, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            config: TransportConfig::default(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            pending_acks: HashMap::new(),
            next_request_id: 1,
        };
        (task, events_rx)
    }

    #[test]
    fn test_abandoned_acks_are_pruned() {
        let (mut task, _events) = task();

        let (timed_out, timed_out_rx) = oneshot::channel();
        let (waiting, mut waiting_rx) = oneshot::channel();
        assert_eq!(task.track_ack(timed_out), 1);
        assert_eq!(task.track_ack(waiting), 2);
        drop(timed_out_rx);

        let (next, _next_rx) = oneshot::channel();
        assert_eq!(task.track_ack(next), 3);
        let mut ids: Vec<u64> = task.pending_acks.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 3]);

        task.dispatch(Ok(ServerMessage::Ack {
            request_id: Some(2),
            success: true,
            error: None,
        }));
        assert_eq!(waiting_rx.try_recv().unwrap(), AckOutcome::ok());
        assert_eq!(task.pending_acks.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Transport::new(TransportConfig {
            url: "ws://127.0.0.1:9/unused".to_string(),
            reconnect_delay_ms: 60_000,
            ..TransportConfig::default()
        });

        let first = transport.connect();
        let second = transport.connect();
        assert!(!first.is_connected());

        // Both handles feed the one connection task
        first.shutdown();
        assert!(transport.take_events().is_some());
        assert!(transport.take_events().is_none());
        drop(second);
    }
}
