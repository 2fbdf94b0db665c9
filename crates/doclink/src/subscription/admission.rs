use tracing::debug;

use super::registry::{Priority, Registry, Subscription};

/// Outcome of asking to admit a new subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admit; when `make_room` is set the registry is at capacity and
    /// eviction should run afterwards
    Admit { make_room: bool },
    /// Background request while full; dropped rather than queued
    Reject,
}

/// Keeps the number of active subscriptions near `capacity`
///
/// Capacity is soft: viewport subscriptions are never evicted, so a viewport
/// heavy screen may run over it.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn at_capacity(&self, registry: &Registry) -> bool {
        registry.active_count() >= self.capacity
    }

    /// Decide whether a new subscription at `priority` may become active
    pub fn decide(&self, registry: &Registry, priority: Priority) -> Admission {
        let full = self.at_capacity(registry);
        match priority {
            Priority::Viewport | Priority::Adjacent => Admission::Admit { make_room: full },
            Priority::Background if full => Admission::Reject,
            Priority::Background => Admission::Admit { make_room: false },
        }
    }

    /// Evict a single subscription if the registry is at or over capacity
    ///
    /// Returns `None` once below capacity or when only viewport subscriptions remain.
    pub fn evict_one(&self, registry: &Registry) -> Option<Subscription> {
        if !self.at_capacity(registry) {
            return None;
        }
        let key = registry.eviction_candidate()?;
        let evicted = registry.remove(&key)?;
        debug!(
            "Evicting {} ({} priority) to stay within {} subscriptions",
            key,
            evicted.priority(),
            self.capacity
        );
        Some(evicted)
    }

    /// Evict until within bounds, one subscription per scheduling turn
    pub async fn evict_incrementally<F>(&self, registry: &Registry, mut on_evicted: F) -> usize
    where
        F: FnMut(Subscription),
    {
        let mut evicted = 0;
        loop {
            tokio::task::yield_now().await;
            match self.evict_one(registry) {
                Some(subscription) => {
                    on_evicted(subscription);
                    evicted += 1;
                }
                None => break,
            }
        }

        if evicted > 0 {
            debug!(
                "Subscription management complete, evicted {}, {} active",
                evicted,
                registry.active_count()
            );
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentKey;
    use crate::subscription::registry::{DocCallback, DocEvent};
    use rstest::rstest;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn key(id: &str) -> DocumentKey {
        DocumentKey::new("CRM Deal", id)
    }

    fn admit(registry: &Registry, id: &str, priority: Priority) {
        let callback: DocCallback = Arc::new(|_: &DocEvent| {});
        registry.attach(&key(id), callback, priority, Instant::now());
        registry.activate(&key(id));
    }

    #[rstest]
    #[case(Priority::Viewport, Admission::Admit { make_room: true })]
    #[case(Priority::Adjacent, Admission::Admit { make_room: true })]
    #[case(Priority::Background, Admission::Reject)]
    #[tokio::test]
    async fn test_decide_when_full(#[case] priority: Priority, #[case] expected: Admission) {
        let controller = AdmissionController::new(2);
        let registry = Registry::new();
        admit(&registry, "a", Priority::Background);
        admit(&registry, "b", Priority::Background);

        assert_eq!(controller.decide(&registry, priority), expected);
    }

    #[tokio::test]
    async fn test_decide_with_room() {
        let controller = AdmissionController::new(2);
        let registry = Registry::new();
        admit(&registry, "a", Priority::Background);

        assert_eq!(
            controller.decide(&registry, Priority::Background),
            Admission::Admit { make_room: false }
        );
    }

    #[tokio::test]
    async fn test_viewport_is_never_evicted() {
        let controller = AdmissionController::new(2);
        let registry = Registry::new();
        admit(&registry, "background", Priority::Background);
        admit(&registry, "visible-1", Priority::Viewport);
        admit(&registry, "visible-2", Priority::Viewport);

        let mut evicted = Vec::new();
        let count = controller
            .evict_incrementally(&registry, |subscription| {
                evicted.push(subscription.key().clone())
            })
            .await;

        assert_eq!(count, 1);
        assert_eq!(evicted, vec![key("background")]);
        // Still at capacity, but only viewport demand is left
        assert_eq!(registry.active_count(), 2);
        assert!(controller.evict_one(&registry).is_none());
    }

    #[tokio::test]
    async fn test_evicts_until_below_capacity() {
        let controller = AdmissionController::new(3);
        let registry = Registry::new();
        admit(&registry, "adjacent", Priority::Adjacent);
        admit(&registry, "bg-1", Priority::Background);
        admit(&registry, "bg-2", Priority::Background);
        admit(&registry, "bg-3", Priority::Background);

        let mut evicted = Vec::new();
        controller
            .evict_incrementally(&registry, |subscription| {
                evicted.push(subscription.key().clone())
            })
            .await;

        assert_eq!(evicted, vec![key("bg-1"), key("bg-2")]);
        assert_eq!(registry.active_count(), 2);
    }

    #[tokio::test]
    async fn test_nothing_to_do_below_capacity() {
        let controller = AdmissionController::new(10);
        let registry = Registry::new();
        admit(&registry, "a", Priority::Background);

        assert!(controller.evict_one(&registry).is_none());
        assert_eq!(controller.evict_incrementally(&registry, |_| {}).await, 0);
    }
}
