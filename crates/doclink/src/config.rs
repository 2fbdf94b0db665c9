use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{DoclinkError, DoclinkResult};

/// Connection settings for the websocket transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Websocket endpoint, e.g. `wss://crm.example.com/socket`
    pub url: String,
    /// First reconnect delay; doubled per attempt
    pub reconnect_delay_ms: u64,
    /// Upper bound for the reconnect delay
    pub max_reconnect_delay_ms: u64,
    /// Per-attempt connect timeout
    pub connect_timeout_ms: u64,
    /// Keepalive ping interval, 0 disables pings
    pub ping_interval_ms: u64,
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/socket".to_string(),
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 5000,
            connect_timeout_ms: 20_000,
            ping_interval_ms: 25_000,
        }
    }
}

/// Tunables for the realtime client
///
/// All durations are in milliseconds so the struct maps directly onto JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// Soft cap on active subscriptions
    pub max_subscriptions: usize,
    /// Coalescing window for updates to one document
    pub throttle_window_ms: u64,
    /// Idle time after which a non-viewport subscription is swept
    pub inactivity_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub sweep_initial_delay_ms: u64,
    /// Lifetime of an unfinished local transaction
    pub transaction_timeout_ms: u64,
    /// Minimum spacing between priority rebalances
    pub priority_update_interval_ms: u64,
    /// How long a viewport subscribe waits for the server's ack
    pub ack_timeout_ms: u64,
    /// Sampling window for rates
    pub metrics_window_ms: u64,
    /// Connection errors kept for diagnostics
    pub error_history: usize,
    /// Consecutive critical connection errors tolerated before signalling issues
    pub critical_error_threshold: u32,
    pub replay_batch_size: usize,
    pub replay_initial_delay_ms: u64,
    pub replay_batch_interval_ms: u64,
    pub notification_capacity: usize,
    /// Collections that stop receiving realtime updates while realtime is disabled
    pub gated_collections: Vec<String>,
}

impl ClientConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> DoclinkResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DoclinkResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> DoclinkResult<()> {
        if self.max_subscriptions == 0 {
            return Err(DoclinkError::Config(
                "max_subscriptions must be at least 1".to_string(),
            ));
        }
        if self.throttle_window_ms == 0 {
            return Err(DoclinkError::Config(
                "throttle_window_ms must be positive".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 || self.metrics_window_ms == 0 {
            return Err(DoclinkError::Config(
                "sweep_interval_ms and metrics_window_ms must be positive".to_string(),
            ));
        }
        if self.replay_batch_size == 0 {
            return Err(DoclinkError::Config(
                "replay_batch_size must be at least 1".to_string(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(DoclinkError::Config(
                "notification_capacity must be at least 1".to_string(),
            ));
        }
        if self.transport.url.trim().is_empty() {
            return Err(DoclinkError::Config("transport.url is empty".to_string()));
        }
        Ok(())
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.transport.url = url.into();
        self
    }

    pub fn with_max_subscriptions(mut self, max_subscriptions: usize) -> Self {
        self.max_subscriptions = max_subscriptions;
        self
    }

    pub fn is_gated(&self, collection: &str) -> bool {
        self.gated_collections.iter().any(|gated| gated == collection)
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn sweep_initial_delay(&self) -> Duration {
        Duration::from_millis(self.sweep_initial_delay_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn priority_update_interval(&self) -> Duration {
        Duration::from_millis(self.priority_update_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_millis(self.metrics_window_ms)
    }

    pub fn replay_initial_delay(&self) -> Duration {
        Duration::from_millis(self.replay_initial_delay_ms)
    }

    pub fn replay_batch_interval(&self) -> Duration {
        Duration::from_millis(self.replay_batch_interval_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_subscriptions: 100,
            throttle_window_ms: 1000,
            inactivity_timeout_ms: 10 * 60 * 1000,
            sweep_interval_ms: 5 * 60 * 1000,
            sweep_initial_delay_ms: 10 * 60 * 1000,
            transaction_timeout_ms: 10_000,
            priority_update_interval_ms: 500,
            ack_timeout_ms: 10_000,
            metrics_window_ms: 30_000,
            error_history: 5,
            critical_error_threshold: 3,
            replay_batch_size: 10,
            replay_initial_delay_ms: 500,
            replay_batch_interval_ms: 500,
            notification_capacity: 256,
            gated_collections: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_subscriptions, 100);
        assert_eq!(config.throttle_window(), Duration::from_secs(1));
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(600));
        assert_eq!(config.transport.max_reconnect_delay(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{
                "max_subscriptions": 50,
                "gated_collections": ["CRM Lead", "CRM Deal", "Task"],
                "transport": { "url": "wss://crm.example.com/socket" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_subscriptions, 50);
        assert!(config.is_gated("Task"));
        assert!(!config.is_gated("Contact"));
        assert_eq!(config.transport.url, "wss://crm.example.com/socket");
        assert_eq!(config.transport.reconnect_delay_ms, 1000);
        assert_eq!(config.throttle_window_ms, 1000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"max_subscriptions": 0}"#),
            Err(DoclinkError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"transport": {"url": "  "}}"#),
            Err(DoclinkError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str("not json"),
            Err(DoclinkError::Serialization(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"throttle_window_ms": 250, "replay_batch_size": 4}}"#).unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.throttle_window(), Duration::from_millis(250));
        assert_eq!(config.replay_batch_size, 4);

        assert!(matches!(
            ClientConfig::from_file(file.path().with_extension("missing")),
            Err(DoclinkError::Io(_))
        ));
    }

    #[test]
    fn test_ping_interval_can_be_disabled() {
        let transport = TransportConfig {
            ping_interval_ms: 0,
            ..TransportConfig::default()
        };
        assert_eq!(transport.ping_interval(), None);
        assert_eq!(
            TransportConfig::default().ping_interval(),
            Some(Duration::from_secs(25))
        );
    }
}
