//! RTM Connection: the publish/subscribe state machine.
//!
//! Owns a [`Session`], the retry queue, and the subscription map.
//! Re-issues the handshake + authenticate sequence on every new `Open`,
//! drains the retry queue once authenticated, and correlates inbound action
//! responses to outbound requests via the shared id counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rtm_protocol::{InboundPdu, OutboundPdu, compute_authenticator, parse_inbound};
use rtm_session::{PerMessageDeflateConfig, ReadyState, Session, SessionConfig, SessionEvent, TlsConfig};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::retry_queue::{DEFAULT_CAPACITY, PendingPublish, RetryQueue};

pub type MsgId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Immediate,
    Batch,
}

/// Events surfaced to the application. Never retained past one delivery.
#[derive(Debug, Clone)]
pub enum RtmEvent {
    Open,
    Authenticated,
    Closed { code: u16, reason: String },
    Error { reason: String },
    Subscribed { subscription_id: String },
    Unsubscribed { subscription_id: String },
    Published { msg_id: MsgId },
    Pong { payload: Vec<u8> },
    HandshakeError { raw: Value },
    AuthenticationError { raw: Value },
    SubscriptionError { raw: Value },
}

pub type EventCallback = Arc<dyn Fn(RtmEvent) + Send + Sync>;
pub type SubscriptionCallback = Arc<dyn Fn(Value, String) + Send + Sync>;
/// Process-wide instrumentation hooks, gated behind an explicit setter rather
/// than a static global — see the design notes on avoiding last-writer-wins
/// process globals.
pub type TrafficTracker = fn(sent: bool, wire_bytes: usize);
pub type PublishTracker = fn(sent: bool, acked: bool);

#[derive(Debug, Clone)]
pub struct RtmConfig {
    pub appkey: String,
    pub endpoint: String,
    pub role: String,
    pub secret: String,
    pub deflate: PerMessageDeflateConfig,
    pub tls: TlsConfig,
    pub retry_queue_capacity: usize,
    pub auto_reconnect: bool,
    pub ping_interval_seconds: u64,
}

impl Default for RtmConfig {
    fn default() -> Self {
        RtmConfig {
            appkey: String::new(),
            endpoint: String::new(),
            role: String::new(),
            secret: String::new(),
            deflate: PerMessageDeflateConfig::default(),
            tls: TlsConfig::default(),
            retry_queue_capacity: DEFAULT_CAPACITY,
            auto_reconnect: true,
            ping_interval_seconds: 30,
        }
    }
}

struct Subscription {
    channel: String,
    filter: Option<String>,
    position: Option<String>,
    batch_size: u32,
    callback: SubscriptionCallback,
}

struct SharedState {
    id_counter: AtomicU64,
    authenticated: AtomicBool,
    retry_queue: RetryQueue,
    subscriptions_by_channel: StdMutex<HashMap<String, Arc<Subscription>>>,
    // Authoritative routing table for `rtm/subscription/data`: populated only
    // once the server's `subscribe/ok` echoes the subscription_id. See the
    // design notes on keying callbacks by subscription_id with a holding slot.
    subscription_id_to_channel: StdMutex<HashMap<String, String>>,
    pending_subscribe_by_id: StdMutex<HashMap<u64, String>>,
    pending_unsubscribe_by_id: StdMutex<HashMap<u64, String>>,
    event_cb: StdMutex<Option<EventCallback>>,
    traffic_tracker: StdMutex<Option<TrafficTracker>>,
    publish_tracker: StdMutex<Option<PublishTracker>>,
    publish_mode: StdMutex<PublishMode>,
    config: RtmConfig,
    session: Session,
}

/// The RTM publish/subscribe connection ("Cobra" in the original naming).
#[derive(Clone)]
pub struct RtmConnection {
    shared: Arc<SharedState>,
}

impl RtmConnection {
    pub fn configure(config: RtmConfig) -> Self {
        let url = format!("{}/v2?appkey={}", config.endpoint, config.appkey);
        let session = Session::configure(SessionConfig {
            url,
            ping_interval_seconds: config.ping_interval_seconds,
            per_message_deflate: config.deflate.clone(),
            tls: config.tls.clone(),
            auto_reconnect: config.auto_reconnect,
        });
        let retry_queue = RetryQueue::new(config.retry_queue_capacity);
        RtmConnection {
            shared: Arc::new(SharedState {
                id_counter: AtomicU64::new(1),
                authenticated: AtomicBool::new(false),
                retry_queue,
                subscriptions_by_channel: StdMutex::new(HashMap::new()),
                subscription_id_to_channel: StdMutex::new(HashMap::new()),
                pending_subscribe_by_id: StdMutex::new(HashMap::new()),
                pending_unsubscribe_by_id: StdMutex::new(HashMap::new()),
                event_cb: StdMutex::new(None),
                traffic_tracker: StdMutex::new(None),
                publish_tracker: StdMutex::new(None),
                publish_mode: StdMutex::new(PublishMode::Immediate),
                config,
                session,
            }),
        }
    }

    /// Start the session and the event-processing loop that drives the state
    /// machine. Idempotent at the `Session` level.
    pub async fn connect(&self) {
        let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
        self.shared
            .session
            .set_on_event(move |ev| {
                let _ = tx.send(ev);
            })
            .await;
        let shared = self.shared.clone();
        tokio::spawn(async move { event_loop(shared, rx).await });
        self.shared.session.start().await;
    }

    /// Force `authenticated = false` and stop the session.
    pub async fn disconnect(&self) {
        self.shared.authenticated.store(false, Ordering::SeqCst);
        self.shared.session.stop().await;
    }

    pub async fn suspend(&self) {
        self.disconnect().await;
    }

    pub async fn resume(&self) {
        self.connect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session.ready_state() == ReadyState::Open
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_event_callback(&self, cb: impl Fn(RtmEvent) + Send + Sync + 'static) {
        *self.shared.event_cb.lock().expect("event_cb mutex poisoned") = Some(Arc::new(cb));
    }

    pub fn set_publish_mode(&self, mode: PublishMode) {
        *self
            .shared
            .publish_mode
            .lock()
            .expect("publish_mode mutex poisoned") = mode;
    }

    pub fn set_traffic_tracker(&self, cb: TrafficTracker) {
        *self
            .shared
            .traffic_tracker
            .lock()
            .expect("traffic_tracker mutex poisoned") = Some(cb);
    }

    pub fn set_publish_tracker(&self, cb: PublishTracker) {
        *self
            .shared
            .publish_tracker
            .lock()
            .expect("publish_tracker mutex poisoned") = Some(cb);
    }

    /// Non-blocking publish. Always returns a valid (nonzero) id: the id is
    /// allocated before the send is even attempted. Enqueues instead of
    /// sending when unauthenticated, in Batch mode, or on backpressure.
    pub async fn publish(&self, channels: Vec<String>, message: Value) -> MsgId {
        let id = self.shared.id_counter.fetch_add(1, Ordering::SeqCst);
        let pdu = OutboundPdu::Publish { channels, message };
        let wire = pdu.to_wire(id).expect("publish PDU always serializes");
        self.send_or_enqueue(id, wire).await;
        id
    }

    /// Used by [`crate::metrics::MetricsPublisher`]: allocate id + enqueue
    /// only, never attempting an immediate send. The worker thread later
    /// calls [`RtmConnection::publish_next`] to drain one entry at a time,
    /// so the connection's serialization state is only ever touched from
    /// that one thread.
    pub fn pre_publish(&self, channels: Vec<String>, message: Value) -> MsgId {
        let id = self.shared.id_counter.fetch_add(1, Ordering::SeqCst);
        let pdu = OutboundPdu::Publish { channels, message };
        let wire = pdu.to_wire(id).expect("publish PDU always serializes");
        self.shared.retry_queue.enqueue(PendingPublish { id, wire });
        id
    }

    /// Pop and send the oldest queued publish, if authenticated. Returns
    /// `true` iff a send was attempted and accepted.
    pub async fn publish_next(&self) -> bool {
        if !self.shared.authenticated.load(Ordering::SeqCst) {
            return false;
        }
        let Some(item) = self.shared.retry_queue.peek_oldest() else {
            return false;
        };
        let info = self
            .shared
            .session
            .send(item.wire.clone().into_bytes(), false)
            .await;
        if info.accepted {
            self.shared.retry_queue.pop_oldest();
            track_publish(&self.shared, true, false);
            true
        } else {
            false
        }
    }

    async fn send_or_enqueue(&self, id: u64, wire: String) {
        let batch_mode = matches!(
            *self.shared.publish_mode.lock().expect("publish_mode mutex poisoned"),
            PublishMode::Batch
        );
        let authenticated = self.shared.authenticated.load(Ordering::SeqCst);
        if batch_mode || !authenticated {
            self.shared.retry_queue.enqueue(PendingPublish { id, wire });
            return;
        }
        let info = self
            .shared
            .session
            .send(wire.clone().into_bytes(), false)
            .await;
        if info.accepted {
            track_traffic(&self.shared, true, info.wire_size);
            track_publish(&self.shared, true, false);
        } else {
            self.shared.retry_queue.enqueue(PendingPublish { id, wire });
        }
    }

    /// Register `callback` before sending `rtm/subscribe` so a fast server
    /// reply can never race the registration.
    pub async fn subscribe(
        &self,
        channel: impl Into<String>,
        filter: Option<String>,
        position: Option<String>,
        batch_size: u32,
        callback: impl Fn(Value, String) + Send + Sync + 'static,
    ) {
        let channel = channel.into();
        let sub = Arc::new(Subscription {
            channel: channel.clone(),
            filter: filter.clone(),
            position: position.clone(),
            batch_size,
            callback: Arc::new(callback),
        });
        self.shared
            .subscriptions_by_channel
            .lock()
            .expect("subscriptions mutex poisoned")
            .insert(channel.clone(), sub);
        self.send_subscribe(&channel, filter, position, batch_size).await;
    }

    async fn send_subscribe(
        &self,
        channel: &str,
        filter: Option<String>,
        position: Option<String>,
        batch_size: u32,
    ) {
        let id = self.shared.id_counter.fetch_add(1, Ordering::SeqCst);
        self.shared
            .pending_subscribe_by_id
            .lock()
            .expect("pending_subscribe mutex poisoned")
            .insert(id, channel.to_owned());
        let pdu = OutboundPdu::Subscribe {
            channel: channel.to_owned(),
            batch_size,
            filter,
            position,
        };
        if let Ok(wire) = pdu.to_wire(id) {
            let _ = self.shared.session.send(wire.into_bytes(), false).await;
        }
    }

    /// Remove the local callback, then best-effort send `rtm/unsubscribe`.
    /// If no callback was registered for `channel`, no PDU is sent.
    pub async fn unsubscribe(&self, channel: &str) {
        let removed = self
            .shared
            .subscriptions_by_channel
            .lock()
            .expect("subscriptions mutex poisoned")
            .remove(channel);
        if removed.is_none() {
            return;
        }
        let subscription_id = {
            let map = self
                .shared
                .subscription_id_to_channel
                .lock()
                .expect("subscription_id map mutex poisoned");
            map.iter()
                .find(|(_, c)| c.as_str() == channel)
                .map(|(sub_id, _)| sub_id.clone())
        };
        let Some(subscription_id) = subscription_id else {
            // subscribe/ok never arrived; there is nothing to unsubscribe server-side.
            return;
        };
        self.shared
            .subscription_id_to_channel
            .lock()
            .expect("subscription_id map mutex poisoned")
            .remove(&subscription_id);

        let id = self.shared.id_counter.fetch_add(1, Ordering::SeqCst);
        self.shared
            .pending_unsubscribe_by_id
            .lock()
            .expect("pending_unsubscribe mutex poisoned")
            .insert(id, channel.to_owned());
        let pdu = OutboundPdu::Unsubscribe { subscription_id };
        if let Ok(wire) = pdu.to_wire(id) {
            let _ = self.shared.session.send(wire.into_bytes(), false).await;
        }
    }

    /// Synchronously attempt to drain the retry queue, oldest first. Returns
    /// `true` iff the queue is empty after the call. A second back-to-back
    /// call with no new publishes is a no-op (the queue is already empty).
    pub async fn flush_queue(&self) -> bool {
        loop {
            let Some(item) = self.shared.retry_queue.peek_oldest() else {
                return true;
            };
            if !self.shared.authenticated.load(Ordering::SeqCst) {
                return false;
            }
            let info = self
                .shared
                .session
                .send(item.wire.clone().into_bytes(), false)
                .await;
            if info.accepted {
                self.shared.retry_queue.pop_oldest();
                track_traffic(&self.shared, true, info.wire_size);
            } else {
                return false;
            }
        }
    }

    pub fn retry_queue_len(&self) -> usize {
        self.shared.retry_queue.len()
    }

    /// Oldest queued wire payload, without removing it. Test-only: lets
    /// sibling modules assert on what actually got serialized and enqueued.
    #[cfg(test)]
    pub(crate) fn peek_oldest_wire(&self) -> Option<String> {
        self.shared.retry_queue.peek_oldest().map(|p| p.wire)
    }
}

fn track_traffic(shared: &Arc<SharedState>, sent: bool, wire_bytes: usize) {
    if let Some(t) = *shared.traffic_tracker.lock().expect("traffic_tracker mutex poisoned") {
        t(sent, wire_bytes);
    }
}

fn track_publish(shared: &Arc<SharedState>, sent: bool, acked: bool) {
    if let Some(t) = *shared.publish_tracker.lock().expect("publish_tracker mutex poisoned") {
        t(sent, acked);
    }
}

fn emit(shared: &Arc<SharedState>, event: RtmEvent) {
    let cb = shared.event_cb.lock().expect("event_cb mutex poisoned").clone();
    if let Some(cb) = cb {
        cb(event);
    }
}

// ---------------------------------------------------------------------------
// Session event loop: the serialized consumer of SessionEvent
// ---------------------------------------------------------------------------

async fn event_loop(shared: Arc<SharedState>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        handle_session_event(&shared, event).await;
    }
}

async fn handle_session_event(shared: &Arc<SharedState>, event: SessionEvent) {
    match event {
        SessionEvent::Open { .. } => {
            emit(shared, RtmEvent::Open);
            let id = shared.id_counter.fetch_add(1, Ordering::SeqCst);
            let pdu = OutboundPdu::Handshake {
                role: shared.config.role.clone(),
            };
            if let Ok(wire) = pdu.to_wire(id) {
                let _ = shared.session.send(wire.into_bytes(), false).await;
            }
        }
        SessionEvent::Message { payload, .. } => {
            let text = match std::str::from_utf8(&payload) {
                Ok(t) => t,
                Err(_) => {
                    emit(
                        shared,
                        RtmEvent::Error {
                            reason: "received non-UTF-8 message payload".to_owned(),
                        },
                    );
                    return;
                }
            };
            match parse_inbound(text) {
                Ok(pdu) => handle_inbound_pdu(shared, pdu).await,
                Err(e) => {
                    warn!(error = %e, "protocol parse error");
                    emit(
                        shared,
                        RtmEvent::Error {
                            reason: format!("protocol parse error: {e}"),
                        },
                    );
                }
            }
        }
        SessionEvent::Close { code, reason } => {
            shared.authenticated.store(false, Ordering::SeqCst);
            emit(shared, RtmEvent::Closed { code, reason });
        }
        SessionEvent::Error { reason, .. } => {
            emit(shared, RtmEvent::Error { reason });
        }
        SessionEvent::Pong { payload } => {
            emit(shared, RtmEvent::Pong { payload });
        }
    }
}

async fn handle_inbound_pdu(shared: &Arc<SharedState>, pdu: InboundPdu) {
    match pdu {
        InboundPdu::HandshakeOk { nonce } => {
            let hash = compute_authenticator(&shared.config.secret, &nonce);
            let id = shared.id_counter.fetch_add(1, Ordering::SeqCst);
            let out = OutboundPdu::Authenticate {
                credentials_hash: hash,
            };
            if let Ok(wire) = out.to_wire(id) {
                let _ = shared.session.send(wire.into_bytes(), false).await;
            }
        }
        InboundPdu::HandshakeError { raw } => emit(shared, RtmEvent::HandshakeError { raw }),
        InboundPdu::AuthenticateOk => {
            shared.authenticated.store(true, Ordering::SeqCst);
            emit(shared, RtmEvent::Authenticated);
            resubscribe_all(shared).await;
            drain_retry_queue(shared).await;
        }
        InboundPdu::AuthenticateError { raw } => emit(shared, RtmEvent::AuthenticationError { raw }),
        InboundPdu::SubscribeOk {
            request_id,
            subscription_id,
        } => {
            let channel = request_id.and_then(|id| {
                shared
                    .pending_subscribe_by_id
                    .lock()
                    .expect("pending_subscribe mutex poisoned")
                    .remove(&id)
            });
            if let Some(channel) = channel {
                shared
                    .subscription_id_to_channel
                    .lock()
                    .expect("subscription_id map mutex poisoned")
                    .insert(subscription_id.clone(), channel);
            }
            emit(shared, RtmEvent::Subscribed { subscription_id });
        }
        InboundPdu::SubscribeError { raw } => emit(shared, RtmEvent::SubscriptionError { raw }),
        InboundPdu::UnsubscribeOk {
            request_id,
            subscription_id,
        } => {
            if let Some(id) = request_id {
                shared
                    .pending_unsubscribe_by_id
                    .lock()
                    .expect("pending_unsubscribe mutex poisoned")
                    .remove(&id);
            }
            emit(shared, RtmEvent::Unsubscribed { subscription_id });
        }
        InboundPdu::UnsubscribeError { raw } => emit(
            shared,
            RtmEvent::Error {
                reason: format!("unsubscribe rejected: {raw}"),
            },
        ),
        InboundPdu::PublishOk { id } => {
            emit(shared, RtmEvent::Published { msg_id: id });
            track_publish(shared, false, true);
        }
        InboundPdu::PublishError { raw } => emit(
            shared,
            RtmEvent::Error {
                reason: format!("publish rejected: {raw}"),
            },
        ),
        InboundPdu::SubscriptionData(data) => {
            let channel = shared
                .subscription_id_to_channel
                .lock()
                .expect("subscription_id map mutex poisoned")
                .get(&data.subscription_id)
                .cloned();
            let Some(channel) = channel else { return };
            let cb = shared
                .subscriptions_by_channel
                .lock()
                .expect("subscriptions mutex poisoned")
                .get(&channel)
                .map(|s| s.callback.clone());
            // `cb` is None here iff unsubscribe() already removed the entry —
            // the race in testable property #6 is resolved in favor of "no
            // callback invoked" because removal happens before the PDU send.
            if let Some(cb) = cb {
                for message in data.messages {
                    cb(message, data.position.clone());
                }
            }
        }
        InboundPdu::Unknown { action, raw } => {
            debug!(action = %action, "unknown action received");
            emit(
                shared,
                RtmEvent::Error {
                    reason: format!("unknown action '{action}': {raw}"),
                },
            );
        }
    }
}

/// Re-issue `rtm/subscribe` for every locally-registered channel after each
/// `Authenticated` transition. This is the rewrite's resolution of design
/// note #3: the original only re-subscribed on explicit application action,
/// silently dropping delivery across a reconnect.
async fn resubscribe_all(shared: &Arc<SharedState>) {
    let channels: Vec<(String, Option<String>, Option<String>, u32)> = {
        let map = shared
            .subscriptions_by_channel
            .lock()
            .expect("subscriptions mutex poisoned");
        map.values()
            .map(|s| (s.channel.clone(), s.filter.clone(), s.position.clone(), s.batch_size))
            .collect()
    };
    for (channel, filter, position, batch_size) in channels {
        let id = shared.id_counter.fetch_add(1, Ordering::SeqCst);
        shared
            .pending_subscribe_by_id
            .lock()
            .expect("pending_subscribe mutex poisoned")
            .insert(id, channel.clone());
        let pdu = OutboundPdu::Subscribe {
            channel,
            batch_size,
            filter,
            position,
        };
        if let Ok(wire) = pdu.to_wire(id) {
            let _ = shared.session.send(wire.into_bytes(), false).await;
        }
    }
}

/// Drain the retry queue oldest-first while authenticated. Stops at the
/// first failed send so ordering is preserved for the next drain attempt.
async fn drain_retry_queue(shared: &Arc<SharedState>) {
    loop {
        if !shared.authenticated.load(Ordering::SeqCst) {
            return;
        }
        let Some(item) = shared.retry_queue.peek_oldest() else {
            return;
        };
        let info = shared.session.send(item.wire.clone().into_bytes(), false).await;
        if info.accepted {
            shared.retry_queue.pop_oldest();
            track_traffic(shared, true, info.wire_size);
        } else {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_connection_is_unauthenticated_and_disconnected() {
        let conn = RtmConnection::configure(RtmConfig {
            appkey: "ak".into(),
            endpoint: "wss://example.invalid".into(),
            role: "publisher".into(),
            secret: "s3cret".into(),
            auto_reconnect: false,
            ..Default::default()
        });
        assert!(!conn.is_authenticated());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn publish_before_authentication_enqueues_and_allocates_ids() {
        let conn = RtmConnection::configure(RtmConfig {
            appkey: "ak".into(),
            endpoint: "wss://example.invalid".into(),
            role: "publisher".into(),
            secret: "s3cret".into(),
            auto_reconnect: false,
            ..Default::default()
        });
        let id1 = conn.publish(vec!["chan".into()], serde_json::json!({"a": 1})).await;
        let id2 = conn.publish(vec!["chan".into()], serde_json::json!({"a": 2})).await;
        assert!(id1 > 0);
        assert!(id2 > id1);
        assert_eq!(conn.retry_queue_len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_without_prior_subscribe_sends_nothing_and_does_not_panic() {
        let conn = RtmConnection::configure(RtmConfig {
            appkey: "ak".into(),
            endpoint: "wss://example.invalid".into(),
            role: "publisher".into(),
            secret: "s3cret".into(),
            auto_reconnect: false,
            ..Default::default()
        });
        conn.unsubscribe("never-subscribed").await;
    }
}
