use doclink::{ClientConfig, DocEvent, DocumentKey, Priority, RealtimeClient};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

// Usage: watch_docs [ws://host:port/socket] "CRM Lead:L-0001" "Task:T-42" ...
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let mut args = std::env::args().skip(1).peekable();
    let mut config = ClientConfig::default();
    if let Some(url) = args.next_if(|arg| arg.starts_with("ws://") || arg.starts_with("wss://")) {
        config = config.with_url(url);
    }

    let keys: Vec<DocumentKey> = args
        .filter_map(|arg| {
            let key = DocumentKey::parse(&arg);
            if key.is_none() {
                warn!("Skipping '{}', expected collection:id", arg);
            }
            key
        })
        .collect();
    if keys.is_empty() {
        return Err("pass at least one document as collection:id".into());
    }

    info!("Connecting to {}", config.transport.url);
    let client = RealtimeClient::connect(config)?;
    let mut notifications = client.notifications();

    let handles: Vec<_> = keys
        .iter()
        .map(|key| {
            let label = key.to_string();
            client.subscribe(key.clone(), Priority::Viewport, move |event| match event {
                DocEvent::Created(data) => info!("{} created: {}", label, data),
                DocEvent::Updated(data) => info!("{} updated: {}", label, data),
                DocEvent::Deleted => info!("{} deleted", label),
            })
        })
        .collect();
    info!("Watching {} documents, press Ctrl-C to stop", handles.len());

    let mut report = tokio::time::interval(Duration::from_secs(30));
    report.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                info!("Metrics: {}", serde_json::to_string(&client.metrics_snapshot())?);
            }
            notification = notifications.recv() => match notification {
                Ok(notification) => info!("Notification: {:?}", notification),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} notifications", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(handles);
    client.shutdown().await;
    Ok(())
}
