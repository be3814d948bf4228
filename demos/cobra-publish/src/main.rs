//! Read one JSON document from `path` and publish it to `channel` once the
//! connection has authenticated.

use std::time::Duration;

use clap::Parser;
use rtm_client::{RtmConfig, RtmConnection, RtmEvent};
use tokio::sync::oneshot;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Publish a single JSON message to an RTM channel")]
struct Args {
    #[arg(long)]
    appkey: String,
    #[arg(long)]
    endpoint: String,
    #[arg(long)]
    role: String,
    #[arg(long)]
    secret: String,
    #[arg(long)]
    channel: String,
    #[arg(long)]
    path: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(channel = %args.channel, "cobra-publish starting");

    let data = match std::fs::read_to_string(&args.path) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %args.path, error = %e, "failed to read input file");
            std::process::exit(1);
        }
    };
    let message: serde_json::Value = match serde_json::from_str(&data) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "input file is not valid JSON");
            std::process::exit(1);
        }
    };

    let conn = RtmConnection::configure(RtmConfig {
        appkey: args.appkey,
        endpoint: args.endpoint,
        role: args.role,
        secret: args.secret,
        ..Default::default()
    });

    let (authenticated_tx, authenticated_rx) = oneshot::channel();
    let mut authenticated_tx = Some(authenticated_tx);
    conn.set_event_callback(move |event| match event {
        RtmEvent::Authenticated => {
            if let Some(tx) = authenticated_tx.take() {
                let _ = tx.send(());
            }
        }
        RtmEvent::HandshakeError { raw } => error!(?raw, "handshake rejected"),
        RtmEvent::AuthenticationError { raw } => error!(?raw, "authentication rejected"),
        RtmEvent::Error { reason } => error!(reason, "session error"),
        _ => {}
    });
    conn.connect().await;

    if authenticated_rx.await.is_err() {
        error!("connection closed before authentication completed");
        std::process::exit(1);
    }
    info!("authenticated");

    let id = conn.publish(vec![args.channel], message).await;
    info!(msg_id = id, "publish submitted");

    // There is no publish acknowledgment wait built into this demo; give the
    // background worker a moment to flush before the process exits.
    tokio::time::sleep(Duration::from_millis(200)).await;
}
