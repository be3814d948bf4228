use rtm_client::{RtmConfig, RtmConnection};
use serde_json::json;

#[tokio::test]
async fn two_hundred_sixty_publishes_while_disconnected_cap_at_256() {
    // No server involved: the connection never authenticates, so every
    // publish enqueues.
    let conn = RtmConnection::configure(RtmConfig {
        appkey: "ak".into(),
        endpoint: "ws://127.0.0.1:1".into(),
        role: "publisher".into(),
        secret: "supersecret".into(),
        auto_reconnect: false,
        ..Default::default()
    });

    let mut last_id = 0;
    for i in 0..260 {
        last_id = conn.publish(vec!["chan".into()], json!({"seq": i})).await;
    }

    assert_eq!(conn.retry_queue_len(), 256);
    assert_eq!(last_id, 260);
}
