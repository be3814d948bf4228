mod common;

use std::sync::{Arc, Mutex};

use common::{config_for, next_event};
use rtm_client::{RtmConnection, RtmEvent};
use rtm_test_utils::MockRtmServer;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[tokio::test]
async fn unsubscribe_immediately_followed_by_data_does_not_invoke_callback() {
    let server = MockRtmServer::start().await;
    let conn = RtmConnection::configure(config_for(&server));

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.set_event_callback(move |ev| {
        let _ = tx.send(ev);
    });
    conn.connect().await;
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Open));
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Authenticated));

    let invoked = Arc::new(Mutex::new(false));
    let invoked_cb = invoked.clone();
    conn.subscribe("chan", None, None, 10, move |_, _| {
        *invoked_cb.lock().unwrap() = true;
    })
    .await;

    let subscription_id = match next_event(&mut rx).await {
        RtmEvent::Subscribed { subscription_id } => subscription_id,
        other => panic!("expected Subscribed, got {other:?}"),
    };

    conn.unsubscribe("chan").await;
    // Let the unsubscribe PDU round-trip before injecting data for the same id.
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Unsubscribed { .. }));

    server.push_subscription_data(&subscription_id, vec![json!({"v": 1})], "p1");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!*invoked.lock().unwrap());
}
