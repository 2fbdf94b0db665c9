use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::ClientInner;
use crate::document::DocumentKey;
use crate::subscription::CallbackId;

/// Cleanup handle returned by [`RealtimeClient::subscribe`](super::RealtimeClient::subscribe)
///
/// Unsubscribes on drop. Calling [`SubscriptionHandle::unsubscribe`] more
/// than once, or after the subscription was evicted, swept or never
/// admitted, does nothing.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    key: DocumentKey,
    callback_id: Option<CallbackId>,
    released: AtomicBool,
    client: Weak<ClientInner>,
}

impl SubscriptionHandle {
    pub(crate) fn attached(key: DocumentKey, callback_id: CallbackId, client: &Arc<ClientInner>) -> Self {
        Self {
            key,
            callback_id: Some(callback_id),
            released: AtomicBool::new(false),
            client: Arc::downgrade(client),
        }
    }

    /// A handle for a subscription that was never registered
    pub(crate) fn inert(key: DocumentKey) -> Self {
        Self {
            key,
            callback_id: None,
            released: AtomicBool::new(true),
            client: Weak::new(),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// True when the subscribe call was refused outright (realtime gated
    /// or invalid key); no callback will ever fire
    pub fn is_inert(&self) -> bool {
        self.callback_id.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Remove this handle's callback
    ///
    /// When it was the last callback for the document the subscription is
    /// removed and the server is told to stop sending updates.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(callback_id), Some(client)) = (self.callback_id, self.client.upgrade()) {
            client.release(&self.key, callback_id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("callback_id", &self.callback_id)
            .field("released", &self.is_released())
            .finish()
    }
}
