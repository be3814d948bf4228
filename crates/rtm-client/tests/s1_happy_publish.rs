mod common;

use common::{config_for, next_event};
use rtm_client::{RtmConnection, RtmEvent};
use rtm_test_utils::MockRtmServer;
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn happy_publish_returns_id_three_and_acks() {
    let server = MockRtmServer::start().await;
    let conn = RtmConnection::configure(config_for(&server));

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.set_event_callback(move |ev| {
        let _ = tx.send(ev);
    });
    conn.connect().await;

    assert!(matches!(next_event(&mut rx).await, RtmEvent::Open));
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Authenticated));

    // Ids 1 and 2 were already consumed by the handshake and authenticate PDUs.
    let id = conn.publish(vec!["chan".into()], json!({"a": 1})).await;
    assert_eq!(id, 3);

    match next_event(&mut rx).await {
        RtmEvent::Published { msg_id } => assert_eq!(msg_id, 3),
        other => panic!("expected Published, got {other:?}"),
    }
}
