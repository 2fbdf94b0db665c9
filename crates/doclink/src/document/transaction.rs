use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::DocumentKey;

#[derive(Debug, Clone)]
struct LedgerEntry {
    token: String,
    started_at: Instant,
}

/// Tracks the write this client currently has in flight for each document
///
/// A write is tagged with the token returned by [`TransactionLedger::begin`];
/// when the server echoes the change back with the same token the update is
/// recognised as our own. There is at most one token per key and a newer
/// `begin` replaces the older token. Entries expire after `timeout` so a
/// writer that never calls `end` cannot hide remote changes forever.
pub struct TransactionLedger {
    entries: DashMap<DocumentKey, LedgerEntry>,
    timeout: Duration,
}

impl TransactionLedger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    /// Start a write on `key` and return its token
    ///
    /// Expired entries for all keys are swept first.
    pub fn begin(&self, key: &DocumentKey) -> String {
        self.sweep_expired();

        let token = generate_token();
        debug!("Starting transaction {} for {}", token, key);
        self.entries.insert(
            key.clone(),
            LedgerEntry {
                token: token.clone(),
                started_at: Instant::now(),
            },
        );
        token
    }

    /// Finish the write tagged `token`
    ///
    /// Returns false and leaves the ledger untouched when `token` is not the
    /// current token for `key` (it was superseded or has expired).
    pub fn end(&self, key: &DocumentKey, token: &str) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.token == token)
            .is_some();

        if removed {
            debug!("Ended transaction {} for {}", token, key);
        } else {
            debug!("Ignoring stale transaction {} for {}", token, key);
        }
        removed
    }

    /// Whether `token` is the current local token for `key`
    pub fn is_local(&self, key: &DocumentKey, token: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.token == token)
            .unwrap_or(false)
    }

    /// Number of transactions currently tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|key, entry| {
            let expired = now.duration_since(entry.started_at) > self.timeout;
            if expired {
                debug!("Transaction {} for {} expired", entry.token, key);
            }
            !expired
        });
    }
}

/// Token made of the wall-clock millis and a random suffix
fn generate_token() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Token handed out while realtime delivery is switched off; never stored
pub(crate) fn disabled_token() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("disabled-{}", &suffix[..13])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> TransactionLedger {
        TransactionLedger::new(Duration::from_secs(10))
    }

    fn key() -> DocumentKey {
        DocumentKey::new("CRM Deal", "CRM-DEAL-0042")
    }

    #[tokio::test]
    async fn test_begin_and_end() {
        let ledger = ledger();
        let token = ledger.begin(&key());

        assert!(ledger.is_local(&key(), &token));
        assert!(ledger.end(&key(), &token));
        assert!(!ledger.is_local(&key(), &token));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let ledger = ledger();
        let first = ledger.begin(&key());
        let second = ledger.begin(&key());

        assert_ne!(first, second);
        assert!(!ledger.is_local(&key(), &first));
        assert!(ledger.is_local(&key(), &second));

        // A late end for the superseded write must not clear the newer one
        assert!(!ledger.end(&key(), &first));
        assert!(ledger.is_local(&key(), &second));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_tokens_are_per_key() {
        let ledger = ledger();
        let other = DocumentKey::new("CRM Deal", "CRM-DEAL-0043");
        let token = ledger.begin(&key());

        assert!(!ledger.is_local(&other, &token));
        assert!(!ledger.end(&other, &token));
        assert!(ledger.is_local(&key(), &token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_swept_on_begin() {
        let ledger = ledger();
        let other = DocumentKey::new("Task", "T-7");
        let stale = ledger.begin(&key());

        tokio::time::advance(Duration::from_secs(11)).await;

        // Sweeping is lazy: the entry survives until the next begin
        assert!(ledger.is_local(&key(), &stale));

        let fresh = ledger.begin(&other);
        assert!(!ledger.is_local(&key(), &stale));
        assert!(ledger.is_local(&other, &fresh));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        let (millis, suffix) = token.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert!(disabled_token().starts_with("disabled-"));
    }
}
