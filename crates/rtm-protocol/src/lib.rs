// rtm-protocol: RTM wire PDU types and serialization.
//
// Every PDU is a JSON object with a top-level string `action`, an optional
// `body` object, and an optional numeric `id`.  Outbound PDUs are built by
// pure functions; inbound PDUs are parsed into a typed enum keyed on the
// `action` string.  Nothing here talks to a socket.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as base64_std;
use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};
use serde_json::Value;

type HmacMd5 = Hmac<Md5>;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The `{action, body, id}` envelope shared by every PDU on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

// ---------------------------------------------------------------------------
// Outbound PDUs
// ---------------------------------------------------------------------------

/// One of the five PDU shapes the client ever sends.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPdu {
    Handshake {
        role: String,
    },
    Authenticate {
        credentials_hash: String,
    },
    Subscribe {
        channel: String,
        batch_size: u32,
        filter: Option<String>,
        position: Option<String>,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Publish {
        channels: Vec<String>,
        message: Value,
    },
}

#[derive(Debug, Clone, Serialize)]
struct HandshakeBody {
    method: &'static str,
    data: HandshakeData,
}

#[derive(Debug, Clone, Serialize)]
struct HandshakeData {
    role: String,
}

#[derive(Debug, Clone, Serialize)]
struct AuthenticateBody {
    method: &'static str,
    credentials: AuthenticateCredentials,
}

#[derive(Debug, Clone, Serialize)]
struct AuthenticateCredentials {
    hash: String,
}

#[derive(Debug, Clone, Serialize)]
struct SubscribeBody {
    channel: String,
    batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct UnsubscribeBody {
    subscription_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct PublishBody {
    channels: Vec<String>,
    message: Value,
}

impl OutboundPdu {
    /// Render this PDU to its wire text form, stamping `id` into the envelope.
    ///
    /// `id` is always allocated by the caller (the RTM connection's atomic
    /// counter) before this function runs; the codec itself is stateless.
    pub fn to_wire(&self, id: u64) -> Result<String, ProtocolError> {
        let envelope = match self {
            OutboundPdu::Handshake { role } => Envelope {
                action: "auth/handshake".to_owned(),
                body: Some(serde_json::to_value(HandshakeBody {
                    method: "role_secret",
                    data: HandshakeData { role: role.clone() },
                })?),
                id: Some(id),
            },
            OutboundPdu::Authenticate { credentials_hash } => Envelope {
                action: "auth/authenticate".to_owned(),
                body: Some(serde_json::to_value(AuthenticateBody {
                    method: "role_secret",
                    credentials: AuthenticateCredentials {
                        hash: credentials_hash.clone(),
                    },
                })?),
                id: Some(id),
            },
            OutboundPdu::Subscribe {
                channel,
                batch_size,
                filter,
                position,
            } => Envelope {
                action: "rtm/subscribe".to_owned(),
                body: Some(serde_json::to_value(SubscribeBody {
                    channel: channel.clone(),
                    batch_size: *batch_size,
                    filter: filter.clone(),
                    position: position.clone(),
                })?),
                id: Some(id),
            },
            OutboundPdu::Unsubscribe { subscription_id } => Envelope {
                action: "rtm/unsubscribe".to_owned(),
                body: Some(serde_json::to_value(UnsubscribeBody {
                    subscription_id: subscription_id.clone(),
                })?),
                id: Some(id),
            },
            OutboundPdu::Publish { channels, message } => Envelope {
                action: "rtm/publish".to_owned(),
                body: Some(serde_json::to_value(PublishBody {
                    channels: channels.clone(),
                    message: message.clone(),
                })?),
                id: Some(id),
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

// ---------------------------------------------------------------------------
// Inbound PDUs
// ---------------------------------------------------------------------------

/// One subscription-data message entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub subscription_id: String,
    pub messages: Vec<Value>,
    pub position: String,
}

/// Every `action` value the server may send, parsed from the wire.
///
/// Unknown `action` values parse to `Unknown` rather than failing — the RTM
/// connection surfaces those as an `Error` event without tearing down the
/// session.
#[derive(Debug, Clone)]
pub enum InboundPdu {
    HandshakeOk { nonce: String },
    HandshakeError { raw: Value },
    AuthenticateOk,
    AuthenticateError { raw: Value },
    SubscribeOk { request_id: Option<u64>, subscription_id: String },
    SubscribeError { raw: Value },
    UnsubscribeOk { request_id: Option<u64>, subscription_id: String },
    UnsubscribeError { raw: Value },
    PublishOk { id: u64 },
    PublishError { raw: Value },
    SubscriptionData(SubscriptionData),
    Unknown { action: String, raw: Value },
}

/// Parse one inbound wire text frame into a typed PDU.
///
/// # Errors
/// Returns [`ProtocolError::Malformed`] when the payload is not a JSON
/// object, is not valid JSON at all, or lacks the required fields for its
/// `action`. An unrecognized `action` string is NOT an error — see
/// [`InboundPdu::Unknown`].
pub fn parse_inbound(text: &str) -> Result<InboundPdu, ProtocolError> {
    let raw: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let action = raw
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing `action` field".to_owned()))?
        .to_owned();
    let body = raw.get("body").cloned().unwrap_or(Value::Null);

    let pdu = match action.as_str() {
        "auth/handshake/ok" => {
            let nonce = body
                .get("data")
                .and_then(|d| d.get("nonce"))
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::Malformed("handshake/ok missing body.data.nonce".to_owned()))?
                .to_owned();
            InboundPdu::HandshakeOk { nonce }
        }
        "auth/handshake/error" => InboundPdu::HandshakeError { raw: body },
        "auth/authenticate/ok" => InboundPdu::AuthenticateOk,
        "auth/authenticate/error" => InboundPdu::AuthenticateError { raw: body },
        "rtm/subscribe/ok" => {
            let subscription_id = body
                .get("subscription_id")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::Malformed("subscribe/ok missing subscription_id".to_owned()))?
                .to_owned();
            InboundPdu::SubscribeOk {
                request_id: raw.get("id").and_then(Value::as_u64),
                subscription_id,
            }
        }
        "rtm/subscribe/error" => InboundPdu::SubscribeError { raw: body },
        "rtm/unsubscribe/ok" => {
            let subscription_id = body
                .get("subscription_id")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::Malformed("unsubscribe/ok missing subscription_id".to_owned()))?
                .to_owned();
            InboundPdu::UnsubscribeOk {
                request_id: raw.get("id").and_then(Value::as_u64),
                subscription_id,
            }
        }
        "rtm/unsubscribe/error" => InboundPdu::UnsubscribeError { raw: body },
        "rtm/publish/ok" => {
            let id = raw
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| ProtocolError::Malformed("publish/ok missing top-level id".to_owned()))?;
            InboundPdu::PublishOk { id }
        }
        "rtm/publish/error" => InboundPdu::PublishError { raw: body },
        "rtm/subscription/data" => {
            let data: SubscriptionData = serde_json::from_value(body)
                .map_err(|e| ProtocolError::Malformed(format!("subscription/data: {e}")))?;
            InboundPdu::SubscriptionData(data)
        }
        other => InboundPdu::Unknown {
            action: other.to_owned(),
            raw,
        },
    };
    Ok(pdu)
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Compute the authenticator for the `auth/authenticate` PDU:
/// `Base64(HMAC-MD5(key = role_secret, data = nonce))`.
///
/// `nonce` is hashed as its literal UTF-8 bytes — NOT its Base64 decoding,
/// even though the nonce value itself happens to look like Base64.
pub fn compute_authenticator(role_secret: &str, nonce: &str) -> String {
    let mut mac =
        HmacMd5::new_from_slice(role_secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(nonce.as_bytes());
    let digest = mac.finalize().into_bytes();
    base64_std.encode(digest)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed PDU: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_round_trip_matches_known_vector() {
        // Testable property #7: fixed nonce/secret produce a fixed authenticator.
        let nonce = "MTI0Njg4NTAyMjYxMzgxMzgzMg==";
        let secret = "supersecret";
        let expected = {
            let mut mac = HmacMd5::new_from_slice(secret.as_bytes()).unwrap();
            mac.update(nonce.as_bytes());
            base64_std.encode(mac.finalize().into_bytes())
        };
        assert_eq!(compute_authenticator(secret, nonce), expected);
    }

    #[test]
    fn handshake_pdu_has_expected_shape() {
        let pdu = OutboundPdu::Handshake {
            role: "publisher".to_owned(),
        };
        let wire = pdu.to_wire(1).unwrap();
        let v: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(v["action"], "auth/handshake");
        assert_eq!(v["id"], 1);
        assert_eq!(v["body"]["method"], "role_secret");
        assert_eq!(v["body"]["data"]["role"], "publisher");
    }

    #[test]
    fn publish_pdu_carries_arbitrary_json_message() {
        let pdu = OutboundPdu::Publish {
            channels: vec!["chan".to_owned()],
            message: serde_json::json!({"a": 1}),
        };
        let wire = pdu.to_wire(3).unwrap();
        let v: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(v["action"], "rtm/publish");
        assert_eq!(v["body"]["channels"], serde_json::json!(["chan"]));
        assert_eq!(v["body"]["message"]["a"], 1);
    }

    #[test]
    fn parse_handshake_ok_extracts_nonce() {
        let text = r#"{"action":"auth/handshake/ok","body":{"data":{"nonce":"N"}}}"#;
        match parse_inbound(text).unwrap() {
            InboundPdu::HandshakeOk { nonce } => assert_eq!(nonce, "N"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_publish_ok_extracts_top_level_id() {
        let text = r#"{"action":"rtm/publish/ok","id":42}"#;
        match parse_inbound(text).unwrap() {
            InboundPdu::PublishOk { id } => assert_eq!(id, 42),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_subscription_data_preserves_message_order() {
        let text = r#"{"action":"rtm/subscription/data","body":{"subscription_id":"C","messages":[{"v":1},{"v":2}],"position":"p7"}}"#;
        match parse_inbound(text).unwrap() {
            InboundPdu::SubscriptionData(data) => {
                assert_eq!(data.subscription_id, "C");
                assert_eq!(data.position, "p7");
                assert_eq!(data.messages, vec![serde_json::json!({"v":1}), serde_json::json!({"v":2})]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_parses_without_error() {
        let text = r#"{"action":"weird/thing","body":{"x":1}}"#;
        match parse_inbound(text).unwrap() {
            InboundPdu::Unknown { action, .. } => assert_eq!(action, "weird/thing"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"no_action": true}"#).is_err());
    }
}
