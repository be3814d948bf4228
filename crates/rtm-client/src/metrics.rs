//! Metrics publisher: enrich + rate-limit + publish application metrics over
//! the same RTM connection used for data channels.
//!
//! Application threads never touch the connection's serialization state
//! directly. `push()` only allocates an id and enqueues; a single worker
//! task, signaled over a control channel, is the only caller of
//! [`RtmConnection::publish_next`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::connection::{MsgId, PublishMode, RtmConfig, RtmConnection};

enum WorkerMsg {
    Publish,
    Suspend,
    Resume,
}

/// Millisecond clock, injectable so rate-control tests don't depend on wall
/// clock sleeps.
type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    })
}

pub struct MetricsPublisher {
    rtm: RtmConnection,
    default_channel: String,
    enabled: AtomicBool,
    blacklist: StdMutex<HashSet<String>>,
    min_interval_ms: StdMutex<HashMap<String, u64>>,
    last_sent_ms: StdMutex<HashMap<String, u64>>,
    counters: StdMutex<HashMap<String, u64>>,
    session_uuid: StdMutex<String>,
    device: StdMutex<Map<String, Value>>,
    worker_tx: StdMutex<Option<mpsc::UnboundedSender<WorkerMsg>>>,
    clock: Clock,
}

impl MetricsPublisher {
    pub fn configure(rtm_config: RtmConfig, channel: impl Into<String>) -> Self {
        Self::configure_with_clock(rtm_config, channel, system_clock())
    }

    fn configure_with_clock(rtm_config: RtmConfig, channel: impl Into<String>, clock: Clock) -> Self {
        MetricsPublisher {
            rtm: RtmConnection::configure(rtm_config),
            default_channel: channel.into(),
            enabled: AtomicBool::new(true),
            blacklist: StdMutex::new(HashSet::new()),
            min_interval_ms: StdMutex::new(HashMap::new()),
            last_sent_ms: StdMutex::new(HashMap::new()),
            counters: StdMutex::new(HashMap::new()),
            session_uuid: StdMutex::new(String::new()),
            device: StdMutex::new(Map::new()),
            worker_tx: StdMutex::new(None),
            clock,
        }
    }

    /// Connect the underlying RTM connection and spawn the single-consumer
    /// worker that drains the pre-publish queue.
    pub async fn start(&self) {
        self.rtm.connect().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMsg>();
        *self.worker_tx.lock().expect("worker_tx mutex poisoned") = Some(tx);
        let rtm = self.rtm.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    WorkerMsg::Publish => {
                        rtm.publish_next().await;
                    }
                    WorkerMsg::Suspend => rtm.disconnect().await,
                    WorkerMsg::Resume => rtm.connect().await,
                }
            }
        });
    }

    pub fn enable(&self, on: bool) {
        self.enabled.store(on, Ordering::SeqCst);
    }

    pub fn set_blacklist(&self, ids: impl IntoIterator<Item = String>) {
        *self.blacklist.lock().expect("blacklist mutex poisoned") = ids.into_iter().collect();
    }

    /// `rates` maps a metric id to the minimum interval, in seconds, between
    /// two accepted pushes of that id.
    pub fn set_rate_control(&self, rates: impl IntoIterator<Item = (String, u64)>) {
        *self.min_interval_ms.lock().expect("min_interval mutex poisoned") =
            rates.into_iter().map(|(id, secs)| (id, secs * 1000)).collect();
    }

    pub fn set_session(&self, uuid: impl Into<String>) {
        *self.session_uuid.lock().expect("session_uuid mutex poisoned") = uuid.into();
    }

    pub fn set_generic_attribute(&self, name: impl Into<String>, value: Value) {
        self.device
            .lock()
            .expect("device mutex poisoned")
            .insert(name.into(), value);
    }

    /// Whether a push of `id` would currently be accepted: publishing is
    /// enabled, `id` is not blacklisted, and its rate-control window has
    /// elapsed. Does not itself consume the window — only [`push`] does.
    pub fn should_push(&self, id: &str) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        if self.blacklist.lock().expect("blacklist mutex poisoned").contains(id) {
            return false;
        }
        let min_ms = *self
            .min_interval_ms
            .lock()
            .expect("min_interval mutex poisoned")
            .get(id)
            .unwrap_or(&0);
        let now = (self.clock)();
        match self.last_sent_ms.lock().expect("last_sent mutex poisoned").get(id) {
            Some(&prev) => now.saturating_sub(prev) >= min_ms,
            None => true,
        }
    }

    /// Enrich `data` with session/version/device/timestamp/counter fields and
    /// enqueue it for publish on `default_channel` and on `id`. Returns `0`
    /// (never a valid allocated id) and enqueues nothing when disabled,
    /// blacklisted, or inside the rate-control window.
    pub fn push(&self, id: &str, data: Value) -> MsgId {
        if !self.should_push(id) {
            return 0;
        }
        self.last_sent_ms
            .lock()
            .expect("last_sent mutex poisoned")
            .insert(id.to_owned(), (self.clock)());

        let counter = {
            let mut counters = self.counters.lock().expect("counters mutex poisoned");
            let slot = counters.entry(id.to_owned()).or_insert(0);
            let value = *slot;
            *slot += 1;
            value
        };

        let mut enriched = match data {
            Value::Object(m) => m,
            other => {
                let mut m = Map::new();
                m.insert("value".to_owned(), other);
                m
            }
        };
        enriched.insert(
            "session".to_owned(),
            Value::String(self.session_uuid.lock().expect("session_uuid mutex poisoned").clone()),
        );
        enriched.insert(
            "device".to_owned(),
            Value::Object(self.device.lock().expect("device mutex poisoned").clone()),
        );
        enriched.insert("version".to_owned(), Value::from(1));
        enriched.insert("timestamp_ms".to_owned(), Value::from((self.clock)()));
        enriched.insert("per_id_counter".to_owned(), Value::from(counter));

        let channels = vec![self.default_channel.clone(), id.to_owned()];
        let msg_id = self.rtm.pre_publish(channels, Value::Object(enriched));
        if let Some(tx) = self.worker_tx.lock().expect("worker_tx mutex poisoned").as_ref() {
            let _ = tx.send(WorkerMsg::Publish);
        }
        msg_id
    }

    pub async fn flush_queue(&self) -> bool {
        self.rtm.flush_queue().await
    }

    pub fn suspend(&self) {
        if let Some(tx) = self.worker_tx.lock().expect("worker_tx mutex poisoned").as_ref() {
            let _ = tx.send(WorkerMsg::Suspend);
        }
    }

    pub fn resume(&self) {
        if let Some(tx) = self.worker_tx.lock().expect("worker_tx mutex poisoned").as_ref() {
            let _ = tx.send(WorkerMsg::Resume);
        }
    }

    pub fn set_publish_mode(&self, mode: PublishMode) {
        self.rtm.set_publish_mode(mode);
    }

    pub fn connection(&self) -> &RtmConnection {
        &self.rtm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn fake_clock() -> (Clock, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(0));
        let captured = now.clone();
        let clock: Clock = Arc::new(move || captured.load(Ordering::SeqCst));
        (clock, now)
    }

    fn publisher_with_clock(clock: Clock) -> MetricsPublisher {
        MetricsPublisher::configure_with_clock(
            RtmConfig {
                appkey: "ak".into(),
                endpoint: "wss://example.invalid".into(),
                role: "publisher".into(),
                secret: "s3cret".into(),
                auto_reconnect: false,
                ..Default::default()
            },
            "metrics",
            clock,
        )
    }

    #[test]
    fn disabled_publisher_rejects_every_push() {
        let (clock, _now) = fake_clock();
        let mp = publisher_with_clock(clock);
        mp.enable(false);
        assert_eq!(mp.push("cpu", Value::from(1)), 0);
    }

    #[test]
    fn blacklisted_id_is_silently_dropped() {
        let (clock, _now) = fake_clock();
        let mp = publisher_with_clock(clock);
        mp.set_blacklist(["noisy".to_owned()]);
        assert!(!mp.should_push("noisy"));
        assert_eq!(mp.push("noisy", Value::from(1)), 0);
    }

    #[test]
    fn rate_control_blocks_until_interval_elapses() {
        let (clock, now) = fake_clock();
        let mp = publisher_with_clock(clock);
        mp.set_rate_control([("cpu".to_owned(), 10u64)]); // 10s = 10_000ms
        let first = mp.push("cpu", Value::from(1));
        assert!(first > 0);
        assert!(!mp.should_push("cpu"));
        now.store(9_999, Ordering::SeqCst);
        assert!(!mp.should_push("cpu"));
        now.store(10_000, Ordering::SeqCst);
        assert!(mp.should_push("cpu"));
    }

    #[test]
    fn per_id_counter_increments_independently() {
        let (clock, _now) = fake_clock();
        let mp = publisher_with_clock(clock);
        mp.push("cpu", Value::from(1));
        mp.push("cpu", Value::from(2));
        mp.push("mem", Value::from(3));
        assert_eq!(mp.rtm.retry_queue_len(), 3);
    }

    #[test]
    fn push_enriches_message_with_version_session_device_and_counter() {
        let (clock, _now) = fake_clock();
        let mp = publisher_with_clock(clock);
        mp.set_session("sess-1");
        mp.set_generic_attribute("model", Value::from("timer-9000"));

        mp.push("cpu", Value::from(1));
        mp.push("cpu", Value::from(2));

        let wire = mp.rtm.peek_oldest_wire().expect("first push was enqueued");
        let envelope: Value = serde_json::from_str(&wire).expect("enqueued wire is valid JSON");
        let message = &envelope["body"]["message"];

        assert_eq!(message["version"], Value::from(1));
        assert_eq!(message["session"], Value::from("sess-1"));
        assert_eq!(message["device"]["model"], Value::from("timer-9000"));
        assert_eq!(message["per_id_counter"], Value::from(0));
        assert!(message.get("timestamp_ms").is_some());
    }
}
