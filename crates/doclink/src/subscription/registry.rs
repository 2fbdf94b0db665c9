use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::document::DocumentKey;

/// How urgently a subscription is wanted, from the UI's point of view
///
/// Ordered `Background < Adjacent < Viewport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Not currently visible
    #[default]
    Background = 1,
    /// In an adjacent column or page
    Adjacent = 2,
    /// Currently visible
    Viewport = 3,
}

impl Priority {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Background => "background",
            Priority::Adjacent => "adjacent",
            Priority::Viewport => "viewport",
        };
        f.write_str(name)
    }
}

/// What a subscriber is told about its document
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    Created(JsonValue),
    Updated(JsonValue),
    Deleted,
}

/// Callback invoked with document events
pub type DocCallback = Arc<dyn Fn(&DocEvent) + Send + Sync>;

/// Opaque handle naming one callback inside a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// Whether the server has been asked for updates yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Intent recorded, waiting for admission
    Pending,
    /// Admitted and requested from the server
    Active,
}

/// All interest in a single document
pub struct Subscription {
    key: DocumentKey,
    callbacks: Vec<(CallbackId, DocCallback)>,
    priority: Priority,
    last_accessed: Instant,
    seq: u64,
    state: SubscriptionState,
}

impl Subscription {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Registration order, used to break eviction ties
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("callbacks", &self.callbacks.len())
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("seq", &self.seq)
            .finish()
    }
}

/// How a callback joined the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    /// First interest in the key; a pending subscription was created
    Created,
    /// Joined an existing subscription in the given state
    Joined(SubscriptionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    pub callback_id: CallbackId,
    pub kind: AttachKind,
    /// Stored priority after the join
    pub priority: Priority,
}

/// Result of removing one callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Key or callback was already gone
    NotFound,
    /// Other callbacks still hold the subscription
    Remaining(usize),
    /// Last callback left; the subscription was removed
    Emptied(SubscriptionState),
}

/// Keys to resubscribe after a reconnect, most urgent first
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayPlan {
    pub viewport: Vec<DocumentKey>,
    pub rest: Vec<DocumentKey>,
}

/// Document key to subscription map; the core's mutable state
///
/// Methods never call out to callbacks or the transport, and never hold a
/// map guard when they return, so callers can act on the results freely.
pub struct Registry {
    subscriptions: DashMap<DocumentKey, Subscription>,
    next_seq: AtomicU64,
    next_callback: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            next_callback: AtomicU64::new(0),
        }
    }

    /// Add a callback for `key`
    ///
    /// Priority only ever rises here; the access time is refreshed.
    pub fn attach(
        &self,
        key: &DocumentKey,
        callback: DocCallback,
        priority: Priority,
        now: Instant,
    ) -> Attached {
        let callback_id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));

        match self.subscriptions.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let subscription = occupied.get_mut();
                subscription.callbacks.push((callback_id, callback));
                subscription.priority = subscription.priority.max(priority);
                subscription.last_accessed = now;
                debug!(
                    "Added callback to {} ({} callbacks, priority {})",
                    key,
                    subscription.callbacks.len(),
                    subscription.priority
                );
                Attached {
                    callback_id,
                    kind: AttachKind::Joined(subscription.state),
                    priority: subscription.priority,
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Subscription {
                    key: key.clone(),
                    callbacks: vec![(callback_id, callback)],
                    priority,
                    last_accessed: now,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    state: SubscriptionState::Pending,
                });
                debug!("Recorded subscription intent for {} at {}", key, priority);
                Attached {
                    callback_id,
                    kind: AttachKind::Created,
                    priority,
                }
            }
        }
    }

    /// Remove one callback, dropping the subscription when it was the last
    pub fn detach(&self, key: &DocumentKey, callback_id: CallbackId) -> Detached {
        let remaining = match self.subscriptions.get_mut(key) {
            Some(mut subscription) => {
                let before = subscription.callbacks.len();
                subscription.callbacks.retain(|(id, _)| *id != callback_id);
                if subscription.callbacks.len() == before {
                    return Detached::NotFound;
                }
                subscription.callbacks.len()
            }
            None => return Detached::NotFound,
        };

        if remaining > 0 {
            return Detached::Remaining(remaining);
        }

        match self
            .subscriptions
            .remove_if(key, |_, subscription| subscription.callbacks.is_empty())
        {
            Some((_, subscription)) => {
                debug!("No more callbacks for {}, removing subscription", key);
                Detached::Emptied(subscription.state)
            }
            // A callback joined between the two steps
            None => Detached::Remaining(
                self.subscriptions
                    .get(key)
                    .map_or(0, |subscription| subscription.callbacks.len()),
            ),
        }
    }

    /// Move a pending subscription to active
    ///
    /// Returns false if the key is gone or already active.
    pub fn activate(&self, key: &DocumentKey) -> bool {
        match self.subscriptions.get_mut(key) {
            Some(mut subscription) if subscription.state == SubscriptionState::Pending => {
                subscription.state = SubscriptionState::Active;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &DocumentKey) -> Option<Subscription> {
        self.subscriptions.remove(key).map(|(_, subscription)| subscription)
    }

    /// Refresh the access time without touching priority
    pub fn mark_accessed(&self, key: &DocumentKey, now: Instant) -> bool {
        match self.subscriptions.get_mut(key) {
            Some(mut subscription) => {
                subscription.last_accessed = now;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn is_active(&self, key: &DocumentKey) -> bool {
        self.state(key) == Some(SubscriptionState::Active)
    }

    pub fn state(&self, key: &DocumentKey) -> Option<SubscriptionState> {
        self.subscriptions.get(key).map(|subscription| subscription.state)
    }

    pub fn priority(&self, key: &DocumentKey) -> Option<Priority> {
        self.subscriptions
            .get(key)
            .map(|subscription| subscription.priority)
    }

    /// Priority and registration order of a subscription still awaiting admission
    pub fn pending_rank(&self, key: &DocumentKey) -> Option<(Priority, u64)> {
        self.subscriptions
            .get(key)
            .filter(|subscription| subscription.state == SubscriptionState::Pending)
            .map(|subscription| (subscription.priority, subscription.seq))
    }

    /// Snapshot of the callbacks for `key`, safe to invoke after return
    pub fn callbacks(&self, key: &DocumentKey) -> Vec<DocCallback> {
        self.subscriptions
            .get(key)
            .map(|subscription| {
                subscription
                    .callbacks
                    .iter()
                    .map(|(_, callback)| callback.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of subscriptions requested from the server
    pub fn active_count(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Number of subscriptions, pending ones included
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        self.subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The active, non-viewport subscription to evict first
    ///
    /// Lowest priority loses, then least recently accessed, then oldest.
    pub fn eviction_candidate(&self) -> Option<DocumentKey> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().is_active() && entry.value().priority != Priority::Viewport)
            .min_by_key(|entry| {
                let subscription = entry.value();
                (subscription.priority, subscription.last_accessed, subscription.seq)
            })
            .map(|entry| entry.key().clone())
    }

    /// Remove non-viewport subscriptions idle for longer than `timeout`
    ///
    /// Idle viewport subscriptions are kept and their access time is pulled
    /// forward by half the timeout so they are not rescanned every sweep.
    pub fn sweep_inactive(&self, now: Instant, timeout: Duration) -> Vec<Subscription> {
        let mut expired = Vec::new();

        for mut entry in self.subscriptions.iter_mut() {
            let subscription = entry.value_mut();
            if now.duration_since(subscription.last_accessed) <= timeout {
                continue;
            }
            if subscription.priority == Priority::Viewport {
                debug!("Skipping cleanup of viewport subscription {}", subscription.key);
                subscription.last_accessed = now.checked_sub(timeout / 2).unwrap_or(now);
                continue;
            }
            expired.push(subscription.key.clone());
        }

        expired
            .into_iter()
            .filter_map(|key| {
                self.subscriptions
                    .remove_if(&key, |_, subscription| {
                        subscription.priority != Priority::Viewport
                            && now.duration_since(subscription.last_accessed) > timeout
                    })
                    .map(|(_, subscription)| subscription)
            })
            .collect()
    }

    /// Active subscriptions split into viewport and the rest, each in registration order
    pub fn replay_plan(&self) -> ReplayPlan {
        let mut active: Vec<(u64, Priority, DocumentKey)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| {
                let subscription = entry.value();
                (subscription.seq, subscription.priority, entry.key().clone())
            })
            .collect();
        active.sort_by_key(|(seq, _, _)| *seq);

        let mut plan = ReplayPlan::default();
        for (_, priority, key) in active {
            if priority == Priority::Viewport {
                plan.viewport.push(key);
            } else {
                plan.rest.push(key);
            }
        }
        plan
    }

    /// Reset every priority to background, then raise the visible and adjacent keys
    ///
    /// Keys that are not registered are ignored.
    pub fn rebalance(&self, visible: &[DocumentKey], adjacent: &[DocumentKey]) {
        let visible: HashSet<&DocumentKey> = visible.iter().collect();
        let adjacent: HashSet<&DocumentKey> = adjacent.iter().collect();

        for mut entry in self.subscriptions.iter_mut() {
            let priority = if visible.contains(entry.key()) {
                Priority::Viewport
            } else if adjacent.contains(entry.key()) {
                Priority::Adjacent
            } else {
                Priority::Background
            };
            entry.value_mut().priority = priority;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
