//! Subscribe to one RTM channel and print every message received as JSON,
//! one line per message, until the process is killed.

use clap::Parser;
use rtm_client::{RtmConfig, RtmConnection, RtmEvent};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Subscribe to an RTM channel and print incoming messages")]
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
    let channel = args.channel.clone();

    let conn = RtmConnection::configure(RtmConfig {
        appkey: args.appkey,
        endpoint: args.endpoint,
        role: args.role,
        secret: args.secret,
        ..Default::default()
    });

    let subscribe_conn = conn.clone();
    let subscribe_channel = channel.clone();
    conn.set_event_callback(move |event| match event {
        RtmEvent::Open => info!("connected"),
        RtmEvent::Authenticated => {
            info!("authenticated");
            let conn = subscribe_conn.clone();
            let channel = subscribe_channel.clone();
            tokio::spawn(async move {
                conn.subscribe(channel, None, None, 50, |message, position| {
                    println!("{} {message}", position);
                })
                .await;
            });
        }
        RtmEvent::Subscribed { subscription_id } => {
            info!(subscription_id, "subscribed");
        }
        RtmEvent::Unsubscribed { subscription_id } => {
            info!(subscription_id, "unsubscribed");
        }
        RtmEvent::Error { reason } => error!(reason, "error"),
        RtmEvent::HandshakeError { raw } => error!(?raw, "handshake rejected"),
        RtmEvent::AuthenticationError { raw } => error!(?raw, "authentication rejected"),
        RtmEvent::SubscriptionError { raw } => error!(?raw, "subscribe rejected"),
        _ => {}
    });

    conn.connect().await;

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
