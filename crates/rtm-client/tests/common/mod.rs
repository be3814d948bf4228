use rtm_client::{RtmConfig, RtmEvent};
use rtm_test_utils::MockRtmServer;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

pub fn config_for(server: &MockRtmServer) -> RtmConfig {
    RtmConfig {
        appkey: "ak".into(),
        endpoint: server.ws_url(),
        role: "publisher".into(),
        secret: "supersecret".into(),
        auto_reconnect: false,
        ..Default::default()
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<RtmEvent>) -> RtmEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event delivered within timeout")
        .expect("event channel closed unexpectedly")
}
