mod common;

use std::sync::{Arc, Mutex};

use common::{config_for, next_event};
use rtm_client::{RtmConnection, RtmEvent};
use rtm_test_utils::MockRtmServer;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

#[tokio::test]
async fn subscribe_then_injected_data_invokes_callback_in_order() {
    let server = MockRtmServer::start().await;
    let conn = RtmConnection::configure(config_for(&server));

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.set_event_callback(move |ev| {
        let _ = tx.send(ev);
    });
    conn.connect().await;
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Open));
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Authenticated));

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_cb = received.clone();
    conn.subscribe("metrics", None, None, 10, move |message, position| {
        received_cb.lock().unwrap().push((message, position));
    })
    .await;

    let subscription_id = match next_event(&mut rx).await {
        RtmEvent::Subscribed { subscription_id } => subscription_id,
        other => panic!("expected Subscribed, got {other:?}"),
    };

    server.push_subscription_data(
        &subscription_id,
        vec![json!({"v": 1}), json!({"v": 2})],
        "p7",
    );

    timeout(Duration::from_secs(2), async {
        while received.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription callback not invoked in time");

    let got = received.lock().unwrap().clone();
    assert_eq!(got, vec![(json!({"v": 1}), "p7".to_owned()), (json!({"v": 2}), "p7".to_owned())]);
}
