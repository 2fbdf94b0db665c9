//! Passive counters over the client. Nothing here feeds back into control flow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

/// Category of a diagnostic entry in the error history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    ConnectError,
    SocketError,
    TransportUpgrade,
    TransportDowngrade,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub kind: DiagnosticKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Rates computed at the end of a sampling window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSample {
    pub elapsed_secs: f64,
    pub subscription_rate: f64,
    pub message_rate: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connected: bool,
    pub connection_attempts: u32,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub disconnection_reason: Option<String>,
    /// Subscriptions requested from the server
    pub active_subscriptions: usize,
    /// Subscriptions known to the registry, pending ones included
    pub tracked_subscriptions: usize,
    pub pending_subscriptions: u64,
    pub successful_subscriptions: u64,
    pub failed_subscriptions: u64,
    pub dropped_subscriptions: u64,
    pub evicted_subscriptions: u64,
    pub suppressed_echoes: u64,
    pub malformed_messages: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub subscription_rate: f64,
    pub message_rate: f64,
    pub errors: Vec<DiagnosticRecord>,
}

#[derive(Debug, Default)]
struct ConnectionTimes {
    last_connected: Option<DateTime<Utc>>,
    last_disconnected: Option<DateTime<Utc>>,
    disconnection_reason: Option<String>,
}

#[derive(Debug)]
struct Sampling {
    window_started: Instant,
    subscription_rate: f64,
    message_rate: f64,
}

/// Counters for connection health and subscription throughput
///
/// Successful/failed subscription and message counters cover the current
/// sampling window and are reset by [`Metrics::sample`].
pub struct Metrics {
    connected: AtomicBool,
    connection_attempts: AtomicU32,
    pending_subscriptions: AtomicU64,
    successful_subscriptions: AtomicU64,
    failed_subscriptions: AtomicU64,
    dropped_subscriptions: AtomicU64,
    evicted_subscriptions: AtomicU64,
    suppressed_echoes: AtomicU64,
    malformed_messages: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connection: Mutex<ConnectionTimes>,
    sampling: Mutex<Sampling>,
    errors: Mutex<VecDeque<DiagnosticRecord>>,
    error_capacity: usize,
}

impl Metrics {
    pub fn new(error_capacity: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU32::new(0),
            pending_subscriptions: AtomicU64::new(0),
            successful_subscriptions: AtomicU64::new(0),
            failed_subscriptions: AtomicU64::new(0),
            dropped_subscriptions: AtomicU64::new(0),
            evicted_subscriptions: AtomicU64::new(0),
            suppressed_echoes: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection: Mutex::new(ConnectionTimes::default()),
            sampling: Mutex::new(Sampling {
                window_started: Instant::now(),
                subscription_rate: 0.0,
                message_rate: 0.0,
            }),
            errors: Mutex::new(VecDeque::with_capacity(error_capacity)),
            error_capacity,
        }
    }

    pub fn record_connected(&self) {
        self.connected.store(true, Ordering::Release);
        if let Ok(mut connection) = self.connection.lock() {
            connection.last_connected = Some(Utc::now());
        }
    }

    pub fn record_disconnected(&self, reason: &str) {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut connection) = self.connection.lock() {
            connection.last_disconnected = Some(Utc::now());
            connection.disconnection_reason = Some(reason.to_string());
        }
    }

    pub fn record_connection_attempt(&self, attempt: u32) {
        self.connection_attempts.store(attempt, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Append to the bounded diagnostic history, dropping the oldest entry when full
    pub fn record_diagnostic(&self, kind: DiagnosticKind, message: impl Into<String>) {
        if self.error_capacity == 0 {
            return;
        }
        if let Ok(mut errors) = self.errors.lock() {
            while errors.len() >= self.error_capacity {
                errors.pop_front();
            }
            errors.push_back(DiagnosticRecord {
                kind,
                message: message.into(),
                timestamp: Utc::now(),
            });
        }
    }

    /// A subscribe request is waiting for admission or acknowledgement
    pub fn subscription_pending(&self) {
        self.pending_subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    /// A pending request resolved without an outcome (dropped or superseded)
    pub fn subscription_settled(&self) {
        saturating_decrement(&self.pending_subscriptions);
    }

    pub fn subscription_succeeded(&self) {
        self.successful_subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn subscription_failed(&self) {
        self.failed_subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    /// Settle a pending request with the server's verdict
    pub fn subscription_resolved(&self, success: bool) {
        self.subscription_settled();
        if success {
            self.subscription_succeeded();
        } else {
            self.subscription_failed();
        }
    }

    pub fn subscription_dropped(&self) {
        self.dropped_subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn subscription_evicted(&self) {
        self.evicted_subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn echo_suppressed(&self) {
        self.suppressed_echoes.fetch_add(1, Ordering::AcqRel);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::AcqRel);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::AcqRel);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::AcqRel);
    }

    /// Close the current sampling window at `now`
    ///
    /// Computes rates over the window and resets the windowed counters.
    /// Returns `None` if no time has passed since the last sample.
    pub fn sample(&self, now: Instant) -> Option<WindowSample> {
        let mut sampling = self.sampling.lock().ok()?;
        let elapsed_secs = now.duration_since(sampling.window_started).as_secs_f64();
        if elapsed_secs <= 0.0 {
            return None;
        }

        let successful = self.successful_subscriptions.swap(0, Ordering::AcqRel);
        self.failed_subscriptions.store(0, Ordering::Release);
        let messages_sent = self.messages_sent.swap(0, Ordering::AcqRel);
        let messages_received = self.messages_received.swap(0, Ordering::AcqRel);

        sampling.subscription_rate = successful as f64 / elapsed_secs;
        sampling.message_rate = messages_received as f64 / elapsed_secs;
        sampling.window_started = now;

        Some(WindowSample {
            elapsed_secs,
            subscription_rate: sampling.subscription_rate,
            message_rate: sampling.message_rate,
            messages_sent,
            messages_received,
        })
    }

    /// Copy every counter; registry sizes are supplied by the caller
    pub fn snapshot(&self, active_subscriptions: usize, tracked_subscriptions: usize) -> MetricsSnapshot {
        let (last_connected, last_disconnected, disconnection_reason) = self
            .connection
            .lock()
            .map(|connection| {
                (
                    connection.last_connected,
                    connection.last_disconnected,
                    connection.disconnection_reason.clone(),
                )
            })
            .unwrap_or_default();
        let (subscription_rate, message_rate) = self
            .sampling
            .lock()
            .map(|sampling| (sampling.subscription_rate, sampling.message_rate))
            .unwrap_or_default();
        let errors = self
            .errors
            .lock()
            .map(|errors| errors.iter().cloned().collect())
            .unwrap_or_default();

        MetricsSnapshot {
            connected: self.connected.load(Ordering::Acquire),
            connection_attempts: self.connection_attempts.load(Ordering::Acquire),
            last_connected,
            last_disconnected,
            disconnection_reason,
            active_subscriptions,
            tracked_subscriptions,
            pending_subscriptions: self.pending_subscriptions.load(Ordering::Acquire),
            successful_subscriptions: self.successful_subscriptions.load(Ordering::Acquire),
            failed_subscriptions: self.failed_subscriptions.load(Ordering::Acquire),
            dropped_subscriptions: self.dropped_subscriptions.load(Ordering::Acquire),
            evicted_subscriptions: self.evicted_subscriptions.load(Ordering::Acquire),
            suppressed_echoes: self.suppressed_echoes.load(Ordering::Acquire),
            malformed_messages: self.malformed_messages.load(Ordering::Acquire),
            messages_sent: self.messages_sent.load(Ordering::Acquire),
            messages_received: self.messages_received.load(Ordering::Acquire),
            subscription_rate,
            message_rate,
            errors,
        }
    }
}

fn saturating_decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        Some(value.saturating_sub(1))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_history_is_bounded() {
        let metrics = Metrics::new(5);
        for attempt in 0..8 {
            metrics.record_diagnostic(DiagnosticKind::ConnectError, format!("refused #{}", attempt));
        }

        let errors = metrics.snapshot(0, 0).errors;
        assert_eq!(errors.len(), 5);
        assert_eq!(errors[0].message, "refused #3");
        assert_eq!(errors[4].message, "refused #7");
    }

    #[test]
    fn test_pending_never_underflows() {
        let metrics = Metrics::new(5);
        metrics.subscription_pending();
        metrics.subscription_resolved(false);
        metrics.subscription_settled();

        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.pending_subscriptions, 0);
        assert_eq!(snapshot.failed_subscriptions, 1);
    }

    #[test]
    fn test_connection_state_tracking() {
        let metrics = Metrics::new(5);
        metrics.record_connection_attempt(3);
        metrics.record_connected();
        assert!(metrics.is_connected());

        metrics.record_disconnected("ping timeout");
        let snapshot = metrics.snapshot(2, 4);
        assert!(!snapshot.connected);
        assert_eq!(snapshot.connection_attempts, 3);
        assert_eq!(snapshot.disconnection_reason.as_deref(), Some("ping timeout"));
        assert!(snapshot.last_connected.is_some());
        assert!(snapshot.last_disconnected.is_some());
        assert_eq!(snapshot.active_subscriptions, 2);
        assert_eq!(snapshot.tracked_subscriptions, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_computes_rates_and_resets_window() {
        let metrics = Metrics::new(5);
        for _ in 0..30 {
            metrics.subscription_succeeded();
        }
        for _ in 0..60 {
            metrics.message_received();
        }
        metrics.message_sent();
        metrics.subscription_failed();

        tokio::time::advance(Duration::from_secs(30)).await;
        let sample = metrics.sample(Instant::now()).unwrap();

        assert_eq!(sample.subscription_rate, 1.0);
        assert_eq!(sample.message_rate, 2.0);
        assert_eq!(sample.messages_sent, 1);

        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.successful_subscriptions, 0);
        assert_eq!(snapshot.failed_subscriptions, 0);
        assert_eq!(snapshot.messages_received, 0);
        assert_eq!(snapshot.subscription_rate, 1.0);

        assert!(metrics.sample(Instant::now()).is_none());
    }
}
