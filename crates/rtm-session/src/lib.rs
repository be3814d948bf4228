//! Reconnecting WebSocket session.
//!
//! `Session` owns exactly one underlying transport at a time and presents a
//! single ordered event stream to its caller (see [`SessionEvent`]).  It
//! reconnects automatically with capped exponential backoff unless disabled,
//! so the layer above never has to reason about individual TCP/TLS
//! reconnects — only repeated `Open` / `Close` pairs.
//!
//! This crate treats WebSocket wire framing itself as a black box: RFC 6455
//! parsing, masking, and fragmentation reassembly are handled by
//! `tokio-tungstenite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Per-message-deflate options, passed through to the transport layer.
///
/// Compression itself is out of scope for this crate (see module docs); the
/// fields exist so configuration round-trips unchanged to whatever transport
/// backend is wired in.
#[derive(Debug, Clone, Default)]
pub struct PerMessageDeflateConfig {
    pub enabled: bool,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_window_bits: Option<u8>,
    pub server_window_bits: Option<u8>,
}

/// TLS options, passed through to the transport layer. Certificate loading
/// and hostname validation are out of scope here; `tokio-tungstenite`'s
/// default `rustls` backend is used as-is for `wss://` URLs.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub disable_hostname_validation: bool,
}

/// Value type bound into a `Session` at `configure`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub ping_interval_seconds: u64,
    pub per_message_deflate: PerMessageDeflateConfig,
    pub tls: TlsConfig,
    pub auto_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            url: String::new(),
            ping_interval_seconds: 30,
            per_message_deflate: PerMessageDeflateConfig::default(),
            tls: TlsConfig::default(),
            auto_reconnect: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Ready state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    fn to_u8(self) -> u8 {
        match self {
            ReadyState::Connecting => 0,
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Open {
        uri: String,
        headers: Vec<(String, String)>,
    },
    Close {
        code: u16,
        reason: String,
    },
    Error {
        reason: String,
        retries: u32,
        wait_ms: u64,
        http_status: Option<u16>,
    },
    Message {
        payload: Vec<u8>,
        wire_size: usize,
    },
    Pong {
        payload: Vec<u8>,
    },
}

/// Per-instance event sink. Installed with [`Session::set_on_event`]; swapped
/// under a lock so two threads can never race a replacement mid-delivery.
pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SendInfo {
    pub accepted: bool,
    pub wire_size: usize,
}

// ---------------------------------------------------------------------------
// Commands into the I/O task
// ---------------------------------------------------------------------------

enum Command {
    Send { payload: Vec<u8>, binary: bool },
    Ping { payload: Vec<u8> },
    Shutdown,
}

const SEND_BUFFER_CAPACITY: usize = 256;
const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_ATTEMPTS: u32 = 6; // 2^6 * base ≈ 16s ceiling before jitter

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One logical, reconnecting WebSocket connection.
pub struct Session {
    config: SessionConfig,
    ready_state: Arc<AtomicU8>,
    reconnect_attempt: Arc<AtomicU32>,
    event_sink: Arc<Mutex<Option<EventSink>>>,
    cmd_tx: Mutex<Option<mpsc::Sender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Build a session bound to `config`. Call [`Session::start`] to connect.
    pub fn configure(config: SessionConfig) -> Self {
        Session {
            config,
            ready_state: Arc::new(AtomicU8::new(ReadyState::Closed.to_u8())),
            reconnect_attempt: Arc::new(AtomicU32::new(0)),
            event_sink: Arc::new(Mutex::new(None)),
            cmd_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Replace the event sink. Thread-safe; takes effect for the next event
    /// delivered (events are never delivered concurrently for one session).
    pub async fn set_on_event<F>(&self, callback: F)
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        *self.event_sink.lock().await = Some(Arc::new(callback));
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready_state.load(Ordering::SeqCst))
    }

    /// Start the connect + reconnect loop. Idempotent: a second call while
    /// already started is a no-op.
    pub async fn start(&self) {
        let mut task_guard = self.task.lock().await;
        if task_guard.is_some() {
            return;
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
        *self.cmd_tx.lock().await = Some(cmd_tx);

        let config = self.config.clone();
        let ready_state = self.ready_state.clone();
        let reconnect_attempt = self.reconnect_attempt.clone();
        let event_sink = self.event_sink.clone();

        let handle = tokio::spawn(run_loop(config, ready_state, reconnect_attempt, event_sink, cmd_rx));
        *task_guard = Some(handle);
    }

    /// Stop the session. Closes the socket, unblocks any pending read, and
    /// joins the I/O task before returning. No callback fires afterward.
    pub async fn stop(&self) {
        if let Some(tx) = self.cmd_tx.lock().await.take() {
            let _ = tx.send(Command::Shutdown).await;
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.ready_state
            .store(ReadyState::Closed.to_u8(), Ordering::SeqCst);
    }

    /// Enqueue one application frame. `accepted = false` when not Open or the
    /// internal send buffer is saturated — a backpressure signal the caller
    /// should treat as "try again later" (the RTM layer enqueues instead).
    pub async fn send(&self, payload: Vec<u8>, binary: bool) -> SendInfo {
        if self.ready_state() != ReadyState::Open {
            return SendInfo {
                accepted: false,
                wire_size: 0,
            };
        }
        let wire_size = payload.len();
        let guard = self.cmd_tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return SendInfo {
                accepted: false,
                wire_size: 0,
            };
        };
        match tx.try_send(Command::Send { payload, binary }) {
            Ok(()) => SendInfo {
                accepted: true,
                wire_size,
            },
            Err(_) => SendInfo {
                accepted: false,
                wire_size: 0,
            },
        }
    }

    /// Send a control ping. Fails if the payload exceeds 125 bytes (the RFC
    /// 6455 control-frame limit) or the session isn't Open.
    pub async fn ping(&self, payload: Vec<u8>) -> SendInfo {
        if payload.len() > 125 || self.ready_state() != ReadyState::Open {
            return SendInfo {
                accepted: false,
                wire_size: 0,
            };
        }
        let wire_size = payload.len();
        let guard = self.cmd_tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return SendInfo {
                accepted: false,
                wire_size: 0,
            };
        };
        match tx.try_send(Command::Ping { payload }) {
            Ok(()) => SendInfo {
                accepted: true,
                wire_size,
            },
            Err(_) => SendInfo {
                accepted: false,
                wire_size: 0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// I/O task
// ---------------------------------------------------------------------------

async fn emit(sink: &Arc<Mutex<Option<EventSink>>>, event: SessionEvent) {
    let cb = sink.lock().await.clone();
    if let Some(cb) = cb {
        cb(event);
    }
}

async fn run_loop(
    config: SessionConfig,
    ready_state: Arc<AtomicU8>,
    reconnect_attempt: Arc<AtomicU32>,
    event_sink: Arc<Mutex<Option<EventSink>>>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    loop {
        ready_state.store(ReadyState::Connecting.to_u8(), Ordering::SeqCst);

        match tokio_tungstenite::connect_async(&config.url).await {
            Ok((ws, response)) => {
                reconnect_attempt.store(0, Ordering::SeqCst);
                ready_state.store(ReadyState::Open.to_u8(), Ordering::SeqCst);
                let headers = response
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_owned()))
                    .collect();
                emit(
                    &event_sink,
                    SessionEvent::Open {
                        uri: config.url.clone(),
                        headers,
                    },
                )
                .await;

                let shutdown_requested =
                    drive_connection(ws, config.ping_interval_seconds, &event_sink, &mut cmd_rx).await;

                ready_state.store(ReadyState::Closed.to_u8(), Ordering::SeqCst);
                if shutdown_requested {
                    return;
                }
            }
            Err(e) => {
                ready_state.store(ReadyState::Closed.to_u8(), Ordering::SeqCst);
                let attempt = reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                let wait_ms = backoff_wait_ms(attempt);
                emit(
                    &event_sink,
                    SessionEvent::Error {
                        reason: e.to_string(),
                        retries: attempt + 1,
                        wait_ms,
                        http_status: extract_http_status(&e),
                    },
                )
                .await;
            }
        }

        if !config.auto_reconnect {
            return;
        }

        let attempt = reconnect_attempt.load(Ordering::SeqCst);
        let wait_ms = backoff_wait_ms(attempt);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            cmd = cmd_rx.recv() => {
                if matches!(cmd, Some(Command::Shutdown) | None) {
                    return;
                }
                // Any other command arriving while disconnected is simply
                // dropped; there is no socket to act on it yet.
            }
        }
    }
}

/// Drain one connected transport until it closes, errors, or shutdown is
/// requested. Returns `true` iff the caller asked us to shut down.
async fn drive_connection(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    ping_interval_seconds: u64,
    event_sink: &Arc<Mutex<Option<EventSink>>>,
    cmd_rx: &mut mpsc::Receiver<Command>,
) -> bool {
    let (mut write, mut read) = ws.split();
    let mut ping_ticker = tokio::time::interval(Duration::from_secs(ping_interval_seconds.max(1)));
    ping_ticker.tick().await; // first tick fires immediately; discard

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(WireMessage::Text(t))) => {
                        let payload = t.as_bytes().to_vec();
                        let wire_size = payload.len();
                        emit(event_sink, SessionEvent::Message { payload, wire_size }).await;
                    }
                    Some(Ok(WireMessage::Binary(b))) => {
                        let payload = b.to_vec();
                        let wire_size = payload.len();
                        emit(event_sink, SessionEvent::Message { payload, wire_size }).await;
                    }
                    Some(Ok(WireMessage::Ping(data))) => {
                        // Auto-answer; not delivered upward.
                        let _ = write.send(WireMessage::Pong(data)).await;
                    }
                    Some(Ok(WireMessage::Pong(data))) => {
                        emit(event_sink, SessionEvent::Pong { payload: data.to_vec() }).await;
                    }
                    Some(Ok(WireMessage::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1000, String::new()));
                        emit(event_sink, SessionEvent::Close { code, reason }).await;
                        return false;
                    }
                    Some(Ok(WireMessage::Frame(_))) => { /* raw frames only surface mid-handshake */ }
                    Some(Err(e)) => {
                        emit(event_sink, SessionEvent::Error {
                            reason: e.to_string(),
                            retries: 0,
                            wait_ms: 0,
                            http_status: None,
                        }).await;
                        return false;
                    }
                    None => {
                        emit(event_sink, SessionEvent::Close { code: 1006, reason: "connection dropped".to_owned() }).await;
                        return false;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send { payload, binary }) => {
                        let msg = if binary { WireMessage::Binary(payload.into()) } else {
                            match String::from_utf8(payload) {
                                Ok(s) => WireMessage::Text(s.into()),
                                Err(_) => continue,
                            }
                        };
                        if write.send(msg).await.is_err() {
                            return false;
                        }
                    }
                    Some(Command::Ping { payload }) => {
                        if write.send(WireMessage::Ping(payload.into())).await.is_err() {
                            return false;
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = write.send(WireMessage::Close(None)).await;
                        let _ = write.close().await;
                        return true;
                    }
                }
            }
            _ = ping_ticker.tick() => {
                debug!("sending keepalive ping");
                let _ = write.send(WireMessage::Ping(Vec::new().into())).await;
            }
        }
    }
}

fn backoff_wait_ms(attempt: u32) -> u64 {
    let capped = attempt.min(BACKOFF_CAP_ATTEMPTS);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << capped);
    let jitter = rand::random::<u64>() % (base / 4 + 1);
    base + jitter
}

fn extract_http_status(e: &tokio_tungstenite::tungstenite::Error) -> Option<u16> {
    match e {
        tokio_tungstenite::tungstenite::Error::Http(resp) => Some(resp.status().as_u16()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let w0 = backoff_wait_ms(0);
        let w10 = backoff_wait_ms(10);
        assert!(w0 >= BACKOFF_BASE_MS);
        // Attempt 10 is clamped to the same ceiling as BACKOFF_CAP_ATTEMPTS.
        let ceiling_base = BACKOFF_BASE_MS * (1u64 << BACKOFF_CAP_ATTEMPTS);
        assert!(w10 >= ceiling_base);
        assert!(w10 < ceiling_base + ceiling_base / 4 + 1);
    }

    #[tokio::test]
    async fn fresh_session_is_closed_and_rejects_send() {
        let session = Session::configure(SessionConfig {
            url: "ws://127.0.0.1:1".to_owned(),
            auto_reconnect: false,
            ..Default::default()
        });
        assert_eq!(session.ready_state(), ReadyState::Closed);
        let info = session.send(b"hi".to_vec(), false).await;
        assert!(!info.accepted);
    }

    #[tokio::test]
    async fn oversized_ping_payload_is_rejected() {
        let session = Session::configure(SessionConfig::default());
        let info = session.ping(vec![0u8; 126]).await;
        assert!(!info.accepted);
    }
}
