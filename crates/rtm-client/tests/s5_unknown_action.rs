mod common;

use common::{config_for, next_event};
use rtm_client::{RtmConnection, RtmEvent};
use rtm_test_utils::MockRtmServer;
use tokio::sync::mpsc;

#[tokio::test]
async fn unknown_action_surfaces_as_error_without_closing() {
    let server = MockRtmServer::start().await;
    let conn = RtmConnection::configure(config_for(&server));

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.set_event_callback(move |ev| {
        let _ = tx.send(ev);
    });
    conn.connect().await;
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Open));
    assert!(matches!(next_event(&mut rx).await, RtmEvent::Authenticated));

    server.push_raw(r#"{"action":"weird/thing","body":{"x":1}}"#);

    match next_event(&mut rx).await {
        RtmEvent::Error { reason } => assert!(reason.contains("weird/thing")),
        other => panic!("expected Error, got {other:?}"),
    }

    // The connection is still usable: a publish still gets acked.
    let id = conn
        .publish(vec!["chan".into()], serde_json::json!({"a": 1}))
        .await;
    assert!(id > 0);
}
