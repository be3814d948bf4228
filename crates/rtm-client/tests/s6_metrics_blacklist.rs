use rtm_client::{MetricsPublisher, RtmConfig};
use serde_json::json;

#[tokio::test]
async fn blacklisted_metric_never_produces_a_pdu() {
    let mp = MetricsPublisher::configure(
        RtmConfig {
            appkey: "ak".into(),
            endpoint: "ws://127.0.0.1:1".into(),
            role: "publisher".into(),
            secret: "supersecret".into(),
            auto_reconnect: false,
            ..Default::default()
        },
        "metrics",
    );
    mp.set_blacklist(["noisy".to_owned()]);

    let id = mp.push("noisy", json!({}));
    assert_eq!(id, 0);
    assert_eq!(mp.connection().retry_queue_len(), 0);
}
