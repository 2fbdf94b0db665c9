//! The realtime client: one explicitly constructed service wiring the
//! registry, ledger, throttler and admission controller to a transport.
//!
//! Callers never block. `subscribe` registers intent and returns a handle at
//! once; admission, eviction, replay and throttled delivery run on spawned
//! tasks that re-check registry state before acting.

mod handle;
mod notification;

pub use handle::SubscriptionHandle;
pub use notification::Notification;

use serde_json::Value as JsonValue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::document::transaction::disabled_token;
use crate::document::{DocumentKey, TransactionLedger};
use crate::metrics::{DiagnosticKind, Metrics, MetricsSnapshot};
use crate::protocol::{transaction_token, update_kind, ServerMessage, UpdateKind};
use crate::subscription::{
    Admission, AdmissionController, AttachKind, CallbackId, Detached, DocEvent, Priority, Registry,
    Subscription, SubscriptionState, UpdateThrottler,
};
use crate::transport::{AckOutcome, ConnectionError, ErrorKind, TransportEvent, TransportHandle};
use crate::{DoclinkError, DoclinkResult};

/// Shared handle to the realtime client; clones refer to the same client
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    transport: TransportHandle,
    registry: Registry,
    ledger: TransactionLedger,
    throttler: UpdateThrottler,
    admission: AdmissionController,
    metrics: Metrics,
    notifications: broadcast::Sender<Notification>,
    admission_queue: Mutex<Vec<DocumentKey>>,
    flush_scheduled: AtomicBool,
    eviction_running: AtomicBool,
    last_priority_update: Mutex<Option<Instant>>,
    realtime_disabled: AtomicBool,
    consecutive_critical: AtomicU32,
    connection_epoch: AtomicU64,
    started: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl RealtimeClient {
    /// Build a client on top of an existing transport handle
    ///
    /// Nothing runs until [`RealtimeClient::start`] is given the transport's
    /// event stream.
    pub fn new(config: ClientConfig, transport: TransportHandle) -> DoclinkResult<Self> {
        config.validate()?;
        let (notifications, _) = broadcast::channel(config.notification_capacity);

        let inner = ClientInner {
            registry: Registry::new(),
            ledger: TransactionLedger::new(config.transaction_timeout()),
            throttler: UpdateThrottler::new(config.throttle_window()),
            admission: AdmissionController::new(config.max_subscriptions),
            metrics: Metrics::new(config.error_history),
            notifications,
            admission_queue: Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
            eviction_running: AtomicBool::new(false),
            last_priority_update: Mutex::new(None),
            realtime_disabled: AtomicBool::new(false),
            consecutive_critical: AtomicU32::new(0),
            connection_epoch: AtomicU64::new(0),
            started: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
            transport,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Open the websocket transport and start the client on it
    ///
    /// Must be called from within a tokio runtime. Connecting happens in the
    /// background; watch [`RealtimeClient::notifications`] for progress.
    #[cfg(feature = "websocket")]
    pub fn connect(config: ClientConfig) -> DoclinkResult<Self> {
        config.validate()?;
        let transport = crate::transport::Transport::new(config.transport.clone());
        let handle = transport.connect();
        let events = transport
            .take_events()
            .ok_or_else(|| DoclinkError::Internal("transport events already taken".to_string()))?;

        let client = Self::new(config, handle)?;
        client.start(events)?;
        Ok(client)
    }

    /// Spawn the event loop, the inactivity sweep and the metrics sampler
    pub fn start(&self, events: mpsc::UnboundedReceiver<TransportEvent>) -> DoclinkResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(DoclinkError::Internal("client already started".to_string()));
        }
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .map_err(|_| DoclinkError::Internal("task set poisoned".to_string()))?;

        let config = &self.inner.config;
        let client = Arc::downgrade(&self.inner);
        tasks.spawn(run_event_loop(client.clone(), events));
        tasks.spawn(run_sweeper(
            client.clone(),
            config.sweep_initial_delay(),
            config.sweep_interval(),
        ));
        tasks.spawn(run_sampler(client, config.metrics_window()));

        info!(
            "Realtime client started (capacity {}, throttle {:?})",
            config.max_subscriptions,
            config.throttle_window()
        );
        Ok(())
    }

    /// Stop background tasks and close the transport
    pub async fn shutdown(&self) {
        info!("Shutting down realtime client");
        self.inner.transport.shutdown();

        let mut tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        tasks.shutdown().await;
    }

    /// Register `callback` for updates to `key`
    ///
    /// Viewport subscriptions are requested from the server before this
    /// returns; lower priorities are admitted on a later scheduling turn and
    /// may be dropped when the client is at capacity.
    pub fn subscribe<F>(&self, key: DocumentKey, priority: Priority, callback: F) -> SubscriptionHandle
    where
        F: Fn(&DocEvent) + Send + Sync + 'static,
    {
        self.inner.subscribe(key, priority, Arc::new(callback))
    }

    /// Protect `key` from the inactivity sweep without changing its priority
    pub fn mark_accessed(&self, key: &DocumentKey) -> bool {
        if self.inner.is_gated(key) {
            return false;
        }
        self.inner.registry.mark_accessed(key, Instant::now())
    }

    /// Recompute priorities from what is on screen
    ///
    /// Returns false when the call was throttled or skipped.
    pub fn update_priorities(&self, visible: &[DocumentKey], adjacent: &[DocumentKey]) -> bool {
        self.inner.update_priorities(visible, adjacent)
    }

    /// Start a local write on `key`; tag the outgoing change with the token
    pub fn begin_transaction(&self, key: &DocumentKey) -> String {
        if self.inner.is_gated(key) {
            return disabled_token();
        }
        self.inner.ledger.begin(key)
    }

    pub fn end_transaction(&self, key: &DocumentKey, token: &str) -> bool {
        if self.inner.is_gated(key) {
            return false;
        }
        self.inner.ledger.end(key, token)
    }

    pub fn is_local_transaction(&self, key: &DocumentKey, token: &str) -> bool {
        self.inner.is_local_transaction(key, token)
    }

    /// Feed one transport event through the client
    ///
    /// [`RealtimeClient::start`] does this for every event; custom
    /// transports may call it directly instead.
    pub fn handle_event(&self, event: TransportEvent) {
        self.inner.handle_event(event);
    }

    /// Run one inactivity sweep now; returns the number of subscriptions removed
    pub fn sweep_inactive(&self) -> usize {
        self.inner.sweep_inactive()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(self.inner.registry.active_count(), self.inner.registry.len())
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Switch realtime delivery for the configured gated collections
    pub fn set_realtime_disabled(&self, disabled: bool) {
        self.inner.realtime_disabled.store(disabled, Ordering::Release);
        info!(
            "Realtime updates {} for {:?}",
            if disabled { "disabled" } else { "enabled" },
            self.inner.config.gated_collections
        );
    }

    pub fn is_realtime_disabled(&self) -> bool {
        self.inner.realtime_disabled.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.metrics.is_connected()
    }

    pub fn priority(&self, key: &DocumentKey) -> Option<Priority> {
        self.inner.registry.priority(key)
    }

    pub fn subscription_state(&self, key: &DocumentKey) -> Option<SubscriptionState> {
        self.inner.registry.state(key)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.inner.transport
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.inner.config.transport.url)
            .field("subscriptions", &self.inner.registry.len())
            .field("connected", &self.inner.metrics.is_connected())
            .finish()
    }
}

impl ClientInner {
    fn is_gated(&self, key: &DocumentKey) -> bool {
        self.realtime_disabled.load(Ordering::Acquire) && self.config.is_gated(key.collection())
    }

    fn is_local_transaction(&self, key: &DocumentKey, token: &str) -> bool {
        if self.is_gated(key) {
            return true;
        }
        self.ledger.is_local(key, token)
    }

    fn notify(&self, notification: Notification) {
        // No receivers is fine
        let _ = self.notifications.send(notification);
    }

    fn subscribe(
        self: &Arc<Self>,
        key: DocumentKey,
        priority: Priority,
        callback: crate::subscription::DocCallback,
    ) -> SubscriptionHandle {
        if !key.is_valid() {
            warn!("Refusing subscription with empty collection or id: {:?}", key);
            return SubscriptionHandle::inert(key);
        }
        if self.is_gated(&key) {
            debug!("Realtime disabled, not subscribing to {}", key);
            return SubscriptionHandle::inert(key);
        }

        let attached = self.registry.attach(&key, callback, priority, Instant::now());
        match attached.kind {
            AttachKind::Created if priority == Priority::Viewport => {
                self.admit(&key, priority);
            }
            AttachKind::Created => {
                self.metrics.subscription_pending();
                self.enqueue_admission(key.clone());
            }
            // Visible content must not wait behind the admission queue
            AttachKind::Joined(SubscriptionState::Pending)
                if attached.priority == Priority::Viewport =>
            {
                self.admit(&key, Priority::Viewport);
            }
            AttachKind::Joined(_) => {}
        }

        SubscriptionHandle::attached(key, attached.callback_id, self)
    }

    pub(crate) fn release(&self, key: &DocumentKey, callback_id: CallbackId) {
        match self.registry.detach(key, callback_id) {
            Detached::NotFound => debug!("Subscription for {} already gone", key),
            Detached::Remaining(count) => {
                debug!("Removed callback for {}, {} remaining", key, count)
            }
            Detached::Emptied(state) => {
                self.throttler.cancel(key);
                if state == SubscriptionState::Active {
                    self.send_unsubscribe(key);
                }
            }
        }
    }

    /// Make a pending subscription active, subject to capacity
    fn admit(self: &Arc<Self>, key: &DocumentKey, priority: Priority) -> bool {
        match self.admission.decide(&self.registry, priority) {
            Admission::Reject => {
                debug!("At capacity, dropping background subscription to {}", key);
                self.registry.remove(key);
                self.metrics.subscription_dropped();
                false
            }
            Admission::Admit { make_room } => {
                if !self.registry.activate(key) {
                    return false;
                }
                self.emit_subscribe(key, priority);
                if make_room {
                    self.schedule_eviction();
                }
                true
            }
        }
    }

    fn emit_subscribe(self: &Arc<Self>, key: &DocumentKey, priority: Priority) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if !self.transport.subscribe_doc(key, Some(ack_tx)) {
            self.metrics.subscription_failed();
            return;
        }
        self.metrics.message_sent();
        self.metrics.subscription_pending();

        let deadline = (priority == Priority::Viewport).then(|| self.config.ack_timeout());
        tokio::spawn(await_ack(Arc::downgrade(self), key.clone(), ack_rx, deadline));
    }

    fn send_unsubscribe(&self, key: &DocumentKey) {
        if self.transport.unsubscribe_doc(key) {
            self.metrics.message_sent();
        }
    }

    fn enqueue_admission(self: &Arc<Self>, key: DocumentKey) {
        if let Ok(mut queue) = self.admission_queue.lock() {
            queue.push(key);
        }
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            inner.flush_admissions();
        });
    }

    /// Admit everything queued since the last flush, most urgent first
    fn flush_admissions(self: &Arc<Self>) {
        self.flush_scheduled.store(false, Ordering::Release);
        let queued = self
            .admission_queue
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default();

        let mut ranked: Vec<(Priority, u64, DocumentKey)> = queued
            .into_iter()
            .filter_map(|key| {
                self.metrics.subscription_settled();
                let (priority, seq) = self.registry.pending_rank(&key)?;
                Some((priority, seq, key))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        if !ranked.is_empty() {
            debug!("Admitting {} queued subscriptions", ranked.len());
        }
        for (priority, _, key) in ranked {
            self.admit(&key, priority);
        }
    }

    fn schedule_eviction(self: &Arc<Self>) {
        if self.eviction_running.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner
                .admission
                .evict_incrementally(&inner.registry, |evicted| inner.on_evicted(evicted))
                .await;
            inner.eviction_running.store(false, Ordering::Release);
        });
    }

    fn on_evicted(&self, subscription: Subscription) {
        self.throttler.cancel(subscription.key());
        if subscription.is_active() {
            self.send_unsubscribe(subscription.key());
        }
        self.metrics.subscription_evicted();
    }

    fn update_priorities(self: &Arc<Self>, visible: &[DocumentKey], adjacent: &[DocumentKey]) -> bool {
        if let Some(first) = visible.first() {
            if self.is_gated(first) {
                debug!("Realtime disabled, skipping priority update");
                return false;
            }
        }

        let now = Instant::now();
        match self.last_priority_update.lock() {
            Ok(mut last) => {
                if let Some(previous) = *last {
                    if now.duration_since(previous) < self.config.priority_update_interval() {
                        debug!("Priority update throttled");
                        return false;
                    }
                }
                *last = Some(now);
            }
            Err(_) => return false,
        }

        self.registry.rebalance(visible, adjacent);
        debug!(
            "Updated priorities: {} visible, {} adjacent",
            visible.len(),
            adjacent.len()
        );
        self.schedule_eviction();
        true
    }

    fn sweep_inactive(&self) -> usize {
        let removed = self
            .registry
            .sweep_inactive(Instant::now(), self.config.inactivity_timeout());

        for subscription in &removed {
            self.throttler.cancel(subscription.key());
            if subscription.is_active() {
                self.send_unsubscribe(subscription.key());
            }
        }
        if !removed.is_empty() {
            info!("Cleaned up {} inactive subscriptions", removed.len());
        }
        removed.len()
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Connected to realtime server");
                self.consecutive_critical.store(0, Ordering::Release);
                self.metrics.record_connected();
                self.metrics.record_connection_attempt(0);
                self.notify(Notification::Connected);
                self.replay();
            }
            TransportEvent::Reconnected { attempts } => {
                info!("Reconnected after {} attempts", attempts);
                self.notify(Notification::Reconnected { attempts });
            }
            TransportEvent::Disconnected(reason) => {
                let critical = reason.is_critical();
                if critical {
                    warn!("Disconnected from realtime server: {}", reason);
                } else {
                    info!("Disconnected from realtime server: {}", reason);
                }
                let reason = reason.to_string();
                self.metrics.record_disconnected(&reason);
                self.notify(Notification::Disconnected { reason, critical });
            }
            TransportEvent::ReconnectAttempt { attempt } => {
                debug!("Reconnection attempt {}", attempt);
                self.metrics.record_connection_attempt(attempt);
                self.notify(Notification::Reconnecting { attempt });
            }
            TransportEvent::Error(error) => self.on_connection_error(error),
            TransportEvent::TransportChanged { transport, upgrade } => {
                let (kind, verb) = if upgrade {
                    (DiagnosticKind::TransportUpgrade, "upgraded")
                } else {
                    (DiagnosticKind::TransportDowngrade, "downgraded")
                };
                debug!("Transport {} to {}", verb, transport);
                self.metrics
                    .record_diagnostic(kind, format!("Transport {} to {}", verb, transport));
            }
            TransportEvent::Message(message) => self.on_message(message),
        }
    }

    fn on_connection_error(&self, error: ConnectionError) {
        if error.kind == ErrorKind::Protocol {
            self.metrics.malformed_message();
            self.metrics
                .record_diagnostic(DiagnosticKind::SocketError, error.message);
            return;
        }

        warn!("Connection error: {}", error);
        self.metrics
            .record_diagnostic(DiagnosticKind::ConnectError, error.to_string());

        if !error.kind.is_critical() {
            return;
        }
        let consecutive = self.consecutive_critical.fetch_add(1, Ordering::AcqRel) + 1;
        if consecutive > self.config.critical_error_threshold {
            warn!(
                "{} consecutive critical connection errors, signalling connection issues",
                consecutive
            );
            self.notify(Notification::ConnectionIssues {
                message: "Having trouble connecting to the realtime server".to_string(),
                error: error.message,
            });
        }
    }

    fn on_message(self: &Arc<Self>, message: ServerMessage) {
        self.metrics.message_received();

        match message {
            ServerMessage::DocUpdate {
                doctype,
                name,
                data,
            } => {
                let key = DocumentKey::new(doctype, name);
                if !key.is_valid() {
                    warn!("Dropping doc_update without doctype or name");
                    self.metrics.malformed_message();
                    return;
                }
                self.on_doc_update(key, data);
            }
            ServerMessage::RefetchResource { cache_key } => {
                debug!("Refetch requested for {}", cache_key);
                self.notify(Notification::RefetchResource { cache_key });
            }
            ServerMessage::Ack { request_id, .. } => {
                debug!("Ignoring unmatched ack {:?}", request_id);
            }
            ServerMessage::Error { message } => {
                warn!("Server error: {}", message);
            }
        }
    }

    fn on_doc_update(self: &Arc<Self>, key: DocumentKey, data: JsonValue) {
        // The ledger, not the gated override: foreign writes must still arrive
        if let Some(token) = transaction_token(&data) {
            if self.ledger.is_local(&key, token) {
                debug!("Ignoring own update for {}", key);
                self.metrics.echo_suppressed();
                return;
            }
        }

        match update_kind(&data) {
            UpdateKind::Created => {
                debug!("Document created: {}", key);
                self.throttler.cancel(&key);
                self.deliver(&key, &DocEvent::Created(data));
                self.notify(Notification::DocCreated { key });
            }
            UpdateKind::Deleted => {
                debug!("Document deleted: {}", key);
                self.deliver(&key, &DocEvent::Deleted);
                self.throttler.cancel(&key);
                if let Some(subscription) = self.registry.remove(&key) {
                    if subscription.is_active() {
                        self.send_unsubscribe(&key);
                    }
                }
                self.notify(Notification::DocDeleted { key });
            }
            UpdateKind::Modified => {
                if !self.registry.contains(&key) {
                    debug!("No subscription for {}, ignoring update", key);
                    return;
                }
                let Some(timer) = self.throttler.offer(&key, data) else {
                    return;
                };

                let inner = self.clone();
                tokio::spawn(async move {
                    let Some(data) = inner.throttler.wait_and_take(&key, timer).await else {
                        return;
                    };
                    tokio::task::yield_now().await;
                    inner.deliver(&key, &DocEvent::Updated(data));
                });
            }
        }
    }

    /// Invoke every current callback for `key`; a panicking callback does not
    /// stop the others
    fn deliver(&self, key: &DocumentKey, event: &DocEvent) {
        for callback in self.registry.callbacks(key) {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Subscriber callback for {} panicked", key);
            }
        }
    }

    /// Resubscribe everything active after a (re)connect
    fn replay(self: &Arc<Self>) {
        let epoch = self.connection_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let plan = self.registry.replay_plan();
        if plan.viewport.is_empty() && plan.rest.is_empty() {
            return;
        }

        info!(
            "Resubscribing to {} viewport and {} other documents",
            plan.viewport.len(),
            plan.rest.len()
        );
        for key in &plan.viewport {
            self.resubscribe(key);
        }
        if plan.rest.is_empty() {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.replay_initial_delay()).await;
            for (index, batch) in plan.rest.chunks(inner.config.replay_batch_size).enumerate() {
                if index > 0 {
                    tokio::time::sleep(inner.config.replay_batch_interval()).await;
                }
                if inner.connection_epoch.load(Ordering::Acquire) != epoch {
                    debug!("Connection changed, abandoning resubscription");
                    return;
                }
                for key in batch {
                    if inner.registry.is_active(key) {
                        inner.resubscribe(key);
                    }
                }
            }
        });
    }

    fn resubscribe(&self, key: &DocumentKey) {
        if self.transport.subscribe_doc(key, None) {
            self.metrics.message_sent();
        }
    }
}

async fn await_ack(
    client: Weak<ClientInner>,
    key: DocumentKey,
    ack: oneshot::Receiver<AckOutcome>,
    deadline: Option<Duration>,
) {
    let outcome = match deadline {
        Some(limit) => match tokio::time::timeout(limit, ack).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => AckOutcome::failed("request dropped before acknowledgement"),
            Err(_) => AckOutcome::failed(format!("no acknowledgement within {:?}", limit)),
        },
        None => ack
            .await
            .unwrap_or_else(|_| AckOutcome::failed("request dropped before acknowledgement")),
    };

    let Some(client) = client.upgrade() else {
        return;
    };
    if outcome.success {
        debug!("Subscribed to {}", key);
    } else {
        warn!(
            "Subscription to {} failed: {}",
            key,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    client.metrics.subscription_resolved(outcome.success);
}

async fn run_event_loop(client: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = client.upgrade() else {
            break;
        };
        inner.handle_event(event);
    }
    debug!("Transport event stream ended");
}

async fn run_sweeper(client: Weak<ClientInner>, first: Duration, every: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + first, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = client.upgrade() else {
            break;
        };
        inner.sweep_inactive();
    }
}

async fn run_sampler(client: Weak<ClientInner>, window: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + window, window);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = client.upgrade() else {
            break;
        };
        if let Some(sample) = inner.metrics.sample(Instant::now()) {
            debug!(
                "Metrics window: {:.2} subscriptions/s, {:.2} messages/s, {} sent",
                sample.subscription_rate, sample.message_rate, sample.messages_sent
            );
        }
    }
}
