use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use doclink::metrics::DiagnosticKind;
use doclink::protocol::{decode_message, encode_message};
use doclink::{
    ClientConfig, ClientMessage, DocEvent, DocumentKey, Notification, Priority, RealtimeClient,
    ServerMessage, TransportConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct FakeServer {
    received: mpsc::UnboundedSender<ClientMessage>,
    drop_connection: Arc<Notify>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<FakeServer>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, server))
}

/// Acks subscribe requests in binary, answers each with a text-frame doc_update
async fn serve(mut socket: WebSocket, server: FakeServer) {
    loop {
        tokio::select! {
            _ = server.drop_connection.notified() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            frame = socket.recv() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Binary(data) = frame else { continue };
                let Ok(message) = decode_message::<ClientMessage>(&data) else { continue };
                let _ = server.received.send(message.clone());

                if let ClientMessage::SubscribeDoc { doctype, name, request_id } = message {
                    if let Some(request_id) = request_id {
                        let ack = ServerMessage::Ack { request_id: Some(request_id), success: true, error: None };
                        let encoded = encode_message(&ack).unwrap();
                        if socket.send(Message::Binary(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    let update = ServerMessage::DocUpdate { doctype, name, data: json!({ "status": "Open" }) };
                    let text = serde_json::to_string(&update).unwrap();
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn start_server() -> (String, mpsc::UnboundedReceiver<ClientMessage>, Arc<Notify>) {
    let (received, messages) = mpsc::unbounded_channel();
    let drop_connection = Arc::new(Notify::new());
    let app = Router::new()
        .route("/socket", get(ws_handler))
        .with_state(FakeServer {
            received,
            drop_connection: drop_connection.clone(),
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{}/socket", addr), messages, drop_connection)
}

fn config(url: String) -> ClientConfig {
    ClientConfig {
        throttle_window_ms: 50,
        transport: TransportConfig {
            url,
            reconnect_delay_ms: 20,
            max_reconnect_delay_ms: 200,
            connect_timeout_ms: 2000,
            ..TransportConfig::default()
        },
        ..ClientConfig::default()
    }
}

async fn wait_for<P>(notifications: &mut broadcast::Receiver<Notification>, predicate: P) -> Notification
where
    P: Fn(&Notification) -> bool,
{
    timeout(WAIT, async {
        loop {
            match notifications.recv().await {
                Ok(notification) if predicate(&notification) => return notification,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("notification channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

async fn next_message(messages: &mut mpsc::UnboundedReceiver<ClientMessage>) -> ClientMessage {
    timeout(WAIT, messages.recv())
        .await
        .expect("timed out waiting for client message")
        .expect("server stopped")
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_subscribe_deliver_and_replay_after_server_drop() {
    let (url, mut received, drop_connection) = start_server().await;
    let client = RealtimeClient::connect(config(url)).unwrap();
    let mut notifications = client.notifications();
    wait_for(&mut notifications, |n| matches!(n, Notification::Connected)).await;
    assert!(client.transport().is_connected());

    let key = DocumentKey::new("CRM Lead", "L-0001");
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let _handle = client.subscribe(key.clone(), Priority::Viewport, move |event| {
        let _ = events_tx.send(event.clone());
    });

    match next_message(&mut received).await {
        ClientMessage::SubscribeDoc {
            doctype,
            name,
            request_id,
        } => {
            assert_eq!(doctype, "CRM Lead");
            assert_eq!(name, "L-0001");
            assert!(request_id.is_some());
        }
        other => panic!("Expected subscribe_doc, got: {:?}", other),
    }

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, DocEvent::Updated(json!({ "status": "Open" })));
    eventually(|| client.metrics_snapshot().successful_subscriptions == 1).await;

    drop_connection.notify_one();
    let disconnected = wait_for(&mut notifications, |n| {
        matches!(n, Notification::Disconnected { .. })
    })
    .await;
    assert_eq!(
        disconnected,
        Notification::Disconnected {
            reason: "io server disconnect".to_string(),
            critical: true,
        }
    );

    wait_for(&mut notifications, |n| matches!(n, Notification::Connected)).await;
    // Replays go out without waiting for an ack
    assert_eq!(next_message(&mut received).await, ClientMessage::subscribe(&key));

    let upgrades = client
        .metrics_snapshot()
        .errors
        .iter()
        .filter(|record| record.kind == DiagnosticKind::TransportUpgrade)
        .count();
    assert_eq!(upgrades, 2);

    client.shutdown().await;
    eventually(|| !client.transport().is_connected()).await;
}

#[tokio::test]
async fn test_unsubscribe_reaches_server() {
    let (url, mut received, _drop_connection) = start_server().await;
    let client = RealtimeClient::connect(config(url)).unwrap();
    let mut notifications = client.notifications();
    wait_for(&mut notifications, |n| matches!(n, Notification::Connected)).await;

    let key = DocumentKey::new("Task", "T-7");
    let handle = client.subscribe(key.clone(), Priority::Viewport, |_| {});
    assert!(matches!(
        next_message(&mut received).await,
        ClientMessage::SubscribeDoc { .. }
    ));

    handle.unsubscribe();
    assert_eq!(
        next_message(&mut received).await,
        ClientMessage::unsubscribe(&key)
    );
    client.shutdown().await;
}

#[tokio::test]
async fn test_refused_connection_keeps_retrying() {
    // Reserve a port, then free it so nothing is listening
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RealtimeClient::connect(config(format!("ws://{}/socket", addr))).unwrap();
    let mut notifications = client.notifications();

    wait_for(&mut notifications, |n| {
        matches!(n, Notification::Reconnecting { attempt: 1 })
    })
    .await;
    let issues = wait_for(&mut notifications, |n| {
        matches!(n, Notification::ConnectionIssues { .. })
    })
    .await;
    assert!(matches!(issues, Notification::ConnectionIssues { .. }));

    let metrics = client.metrics_snapshot();
    assert!(!metrics.connected);
    assert!(metrics.connection_attempts >= 3);
    assert!(metrics
        .errors
        .iter()
        .all(|record| record.kind == DiagnosticKind::ConnectError));

    client.shutdown().await;
}
