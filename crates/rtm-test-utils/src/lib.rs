//! Mock RTM WebSocket server for integration tests.
//!
//! Binds to a random local port and drives the handshake/authenticate/
//! subscribe/publish exchange a real RTM backend would, with a few knobs
//! (`reject_auth`, `reject_subscribe`, a fixed nonce) tests can flip before
//! connecting a client. Test code also uses it to push out-of-band
//! `rtm/subscription/data` frames to every connected client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

struct ServerState {
    nonce: Mutex<String>,
    reject_auth: AtomicBool,
    reject_subscribe: AtomicBool,
    received_publish_ids: Mutex<Vec<u64>>,
}

/// A single-purpose mock RTM server: one process, any number of connections,
/// all sharing the same reject/nonce knobs.
pub struct MockRtmServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    push_tx: broadcast::Sender<String>,
    _task: JoinHandle<()>,
}

impl MockRtmServer {
    /// Bind to `127.0.0.1:0` and start accepting connections in the
    /// background. Returns once the listener is bound.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("binding a random local port never fails in tests");
        let addr = listener.local_addr().expect("bound listener has a local addr");

        let state = Arc::new(ServerState {
            nonce: Mutex::new("MTI0Njg4NTAyMjYxMzgxMzgzMg==".to_owned()),
            reject_auth: AtomicBool::new(false),
            reject_subscribe: AtomicBool::new(false),
            received_publish_ids: Mutex::new(Vec::new()),
        });
        let (push_tx, _) = broadcast::channel::<String>(256);

        let accept_state = state.clone();
        let accept_push_tx = push_tx.clone();
        let task = tokio::spawn(async move {
            accept_loop(listener, accept_state, accept_push_tx).await;
        });

        MockRtmServer {
            addr,
            state,
            push_tx,
            _task: task,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Override the nonce returned in `auth/handshake/ok`.
    pub async fn set_nonce(&self, nonce: impl Into<String>) {
        *self.state.nonce.lock().await = nonce.into();
    }

    /// Force every subsequent `auth/authenticate` to fail, regardless of the
    /// submitted hash.
    pub fn set_reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Force every subsequent `rtm/subscribe` to fail.
    pub fn set_reject_subscribe(&self, reject: bool) {
        self.state.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    /// Ids of every `rtm/publish` PDU received so far, in arrival order.
    /// Used by tests to assert drain ordering across a reconnect.
    pub async fn received_publish_ids(&self) -> Vec<u64> {
        self.state.received_publish_ids.lock().await.clone()
    }

    /// Push `rtm/subscription/data` to every connection currently subscribed.
    /// Connections filter locally by `subscription_id`, so this is safe to
    /// call even with zero listeners (it's simply dropped).
    /// Push an arbitrary raw text frame to every connected client, unfiltered.
    /// Used to inject malformed or unrecognized-action frames in tests.
    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.push_tx.send(text.into());
    }

    pub fn push_subscription_data(&self, subscription_id: &str, messages: Vec<Value>, position: &str) {
        let frame = json!({
            "action": "rtm/subscription/data",
            "body": {
                "subscription_id": subscription_id,
                "messages": messages,
                "position": position,
            }
        });
        let _ = self.push_tx.send(frame.to_string());
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, push_tx: broadcast::Sender<String>) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let conn_state = state.clone();
                let conn_push_rx = push_tx.subscribe();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, conn_state, conn_push_rx).await;
                });
            }
            Err(_) => return,
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<ServerState>,
    mut push_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    // Every channel this connection subscribed to, keyed by subscription_id,
    // so this connection only relays the subscription/data pushes it asked for.
    let mut known_subscription_ids: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(msg) = msg else { break };
                let msg = msg?;
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Close(_) => break,
                    Message::Ping(data) => {
                        write.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };
                let Ok(raw) : Result<Value, _> = serde_json::from_str(&text) else { continue };
                let Some(action) = raw.get("action").and_then(Value::as_str) else { continue };
                let id = raw.get("id").and_then(Value::as_u64);

                match action {
                    "auth/handshake" => {
                        let nonce = state.nonce.lock().await.clone();
                        let reply = json!({
                            "action": "auth/handshake/ok",
                            "id": id,
                            "body": {"data": {"nonce": nonce}}
                        });
                        write.send(Message::Text(reply.to_string().into())).await?;
                    }
                    "auth/authenticate" => {
                        let reply = if state.reject_auth.load(Ordering::SeqCst) {
                            json!({"action": "auth/authenticate/error", "id": id, "body": {"error": "authentication_failed"}})
                        } else {
                            json!({"action": "auth/authenticate/ok", "id": id})
                        };
                        write.send(Message::Text(reply.to_string().into())).await?;
                    }
                    "rtm/subscribe" => {
                        if state.reject_subscribe.load(Ordering::SeqCst) {
                            let reply = json!({"action": "rtm/subscribe/error", "id": id, "body": {"error": "subscribe_failed"}});
                            write.send(Message::Text(reply.to_string().into())).await?;
                        } else {
                            let channel = raw.pointer("/body/channel").and_then(Value::as_str).unwrap_or_default();
                            let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
                            known_subscription_ids.push(subscription_id.clone());
                            let reply = json!({
                                "action": "rtm/subscribe/ok",
                                "id": id,
                                "body": {"subscription_id": subscription_id, "channel": channel}
                            });
                            write.send(Message::Text(reply.to_string().into())).await?;
                        }
                    }
                    "rtm/unsubscribe" => {
                        let subscription_id = raw.pointer("/body/subscription_id").and_then(Value::as_str).unwrap_or_default();
                        known_subscription_ids.retain(|s| s != subscription_id);
                        let reply = json!({
                            "action": "rtm/unsubscribe/ok",
                            "id": id,
                            "body": {"subscription_id": subscription_id}
                        });
                        write.send(Message::Text(reply.to_string().into())).await?;
                    }
                    "rtm/publish" => {
                        if let Some(id) = id {
                            state.received_publish_ids.lock().await.push(id);
                        }
                        let reply = json!({"action": "rtm/publish/ok", "id": id});
                        write.send(Message::Text(reply.to_string().into())).await?;
                    }
                    _ => {}
                }
            }
            pushed = push_rx.recv() => {
                let Ok(text) = pushed else { continue };
                let Ok(raw): Result<Value, _> = serde_json::from_str(&text) else { continue };
                let should_send = match raw.get("action").and_then(Value::as_str) {
                    Some("rtm/subscription/data") => {
                        let target = raw.pointer("/body/subscription_id").and_then(Value::as_str).unwrap_or_default();
                        known_subscription_ids.iter().any(|s| s == target)
                    }
                    _ => true,
                };
                if should_send {
                    write.send(Message::Text(text.into())).await?;
                }
            }
        }
    }
    Ok(())
}
