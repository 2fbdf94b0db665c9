use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::document::DocumentKey;

/// Identifies the timer that owns a pending slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

#[derive(Debug)]
struct PendingUpdate {
    data: JsonValue,
    timer: TimerId,
}

/// Coalesces bursts of updates for a document into one delivery per window
///
/// Every update overwrites the pending payload for its key. The first update
/// of a burst starts a timer; when the window elapses the latest payload is
/// taken and delivered. This is coalesce-to-latest, not sampling.
pub struct UpdateThrottler {
    pending: DashMap<DocumentKey, PendingUpdate>,
    window: Duration,
    next_timer: AtomicU64,
}

impl UpdateThrottler {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            window,
            next_timer: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record the latest payload for `key`
    ///
    /// Returns a timer id when the caller must start a timer for this key,
    /// `None` when a timer is already running and will pick the payload up.
    pub fn offer(&self, key: &DocumentKey, data: JsonValue) -> Option<TimerId> {
        match self.pending.entry(key.clone()) {
            Entry::Occupied(mut pending) => {
                debug!("Update for {} throttled, will use latest data", key);
                pending.get_mut().data = data;
                None
            }
            Entry::Vacant(slot) => {
                let timer = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed));
                debug!("Setting up throttle for {}", key);
                slot.insert(PendingUpdate { data, timer });
                Some(timer)
            }
        }
    }

    /// Take the payload owned by `timer`
    ///
    /// Returns `None` if the slot was cancelled, or replaced by a newer timer's slot.
    pub fn take(&self, key: &DocumentKey, timer: TimerId) -> Option<JsonValue> {
        self.pending
            .remove_if(key, |_, pending| pending.timer == timer)
            .map(|(_, pending)| pending.data)
    }

    /// Wait out the window for `timer`, then take its payload
    pub async fn wait_and_take(&self, key: &DocumentKey, timer: TimerId) -> Option<JsonValue> {
        tokio::time::sleep(self.window).await;
        self.take(key, timer)
    }

    /// Drop any pending payload for `key`
    pub fn cancel(&self, key: &DocumentKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &DocumentKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> DocumentKey {
        DocumentKey::new("CRM Lead", "L-1")
    }

    #[test]
    fn test_only_first_offer_starts_timer() {
        let throttler = UpdateThrottler::new(Duration::from_secs(1));

        let timer = throttler.offer(&key(), json!({"v": "A"}));
        assert!(timer.is_some());
        assert!(throttler.offer(&key(), json!({"v": "B"})).is_none());
        assert!(throttler.offer(&key(), json!({"v": "C"})).is_none());

        assert_eq!(throttler.take(&key(), timer.unwrap()), Some(json!({"v": "C"})));
        assert!(!throttler.is_pending(&key()));
    }

    #[test]
    fn test_cancelled_slot_is_not_taken_by_old_timer() {
        let throttler = UpdateThrottler::new(Duration::from_secs(1));

        let old = throttler.offer(&key(), json!(1)).unwrap();
        assert!(throttler.cancel(&key()));
        let new = throttler.offer(&key(), json!(2)).unwrap();

        assert_eq!(throttler.take(&key(), old), None);
        assert_eq!(throttler.take(&key(), new), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_payload_wins_within_window() {
        let throttler = std::sync::Arc::new(UpdateThrottler::new(Duration::from_millis(1000)));
        let timer = throttler.offer(&key(), json!("A")).unwrap();

        let waiting = {
            let throttler = throttler.clone();
            tokio::spawn(async move { throttler.wait_and_take(&key(), timer).await })
        };

        for payload in ["B", "C", "D"] {
            tokio::time::advance(Duration::from_millis(200)).await;
            assert!(throttler.offer(&key(), json!(payload)).is_none());
        }

        assert_eq!(waiting.await.unwrap(), Some(json!("D")));
        assert_eq!(throttler.pending_count(), 0);
    }
}
