//! High-level RTM ("Cobra") publish/subscribe client built on [`rtm_session`]
//! and [`rtm_protocol`].
//!
//! [`RtmConnection`] drives the handshake/authenticate/subscribe state
//! machine over one reconnecting [`rtm_session::Session`]; [`MetricsPublisher`]
//! layers enrichment, rate control, and a single-consumer publish worker on
//! top of a connection of its own.

mod connection;
mod metrics;
mod retry_queue;

pub use connection::{
    EventCallback, MsgId, PublishMode, PublishTracker, RtmConfig, RtmConnection, RtmEvent,
    SubscriptionCallback, TrafficTracker,
};
pub use metrics::MetricsPublisher;
pub use retry_queue::{DEFAULT_CAPACITY, PendingPublish, RetryQueue};

pub use rtm_protocol::ProtocolError;
pub use rtm_session::{PerMessageDeflateConfig, ReadyState, TlsConfig};
