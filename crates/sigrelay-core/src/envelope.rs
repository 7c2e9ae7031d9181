//! Signaling envelopes: the JSON messages carried inside text frames.
//!
//! Inbound JSON is decoded once at the boundary into [`Inbound`]; client
//! values for `room_id`, `sender_id` and `timestamp` are ignored and the
//! server stamps its own with [`Inbound::stamp`].

use crate::error::{RelayError, RelayResult};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `sender_id` used on envelopes the server originates.
pub const SERVER_SENDER_ID: &str = "server";

/// Closed set of envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    ChatMessage,
    ConnectionEstablished,
    CallEnded,
    CallAnswered,
    CallRejected,
    CallTimeout,
    TypingIndicator,
    MessageRead,
    ResendOfferRequest,
}

impl MessageKind {
    /// Types only the server may emit.
    pub fn is_server_only(self) -> bool {
        matches!(self, MessageKind::ConnectionEstablished)
    }

    /// Types relayed to every member of the room, the sender included.
    pub fn includes_sender(self) -> bool {
        matches!(self, MessageKind::ResendOfferRequest)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::ChatMessage => "chat-message",
            MessageKind::ConnectionEstablished => "connection-established",
            MessageKind::CallEnded => "call-ended",
            MessageKind::CallAnswered => "call-answered",
            MessageKind::CallRejected => "call-rejected",
            MessageKind::CallTimeout => "call-timeout",
            MessageKind::TypingIndicator => "typing-indicator",
            MessageKind::MessageRead => "message-read",
            MessageKind::ResendOfferRequest => "resend-offer-request",
        }
    }
}

/// An envelope as relayed to recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    pub timestamp: String,
}

impl Envelope {
    /// The unsolicited greeting sent right after a successful join.
    pub fn connection_established(room_id: &str, participant_id: &str, channel: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("participant_id".into(), Value::String(participant_id.to_string()));
        payload.insert("channel".into(), Value::String(channel.to_string()));
        Self {
            kind: MessageKind::ConnectionEstablished,
            room_id: room_id.to_string(),
            sender_id: SERVER_SENDER_ID.to_string(),
            payload: Value::Object(payload),
            timestamp: now_iso8601(),
        }
    }

    pub fn to_json(&self) -> RelayResult<String> {
        serde_json::to_string(self).map_err(|e| RelayError::Other(format!("envelope encode: {e}")))
    }
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    payload: Value,
}

/// A decoded client message, not yet stamped with server identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub kind: MessageKind,
    pub payload: Value,
}

impl Inbound {
    /// Decode a client text payload.
    ///
    /// Unknown or server-only types and non-object payloads are
    /// [`RelayError::EnvelopeDecode`]. A missing or null payload becomes `{}`.
    pub fn decode(text: &str) -> RelayResult<Self> {
        let raw: RawInbound = serde_json::from_str(text)?;
        if raw.kind.is_server_only() {
            return Err(RelayError::EnvelopeDecode(format!(
                "{} may only be sent by the server",
                raw.kind.as_str()
            )));
        }
        let payload = match raw.payload {
            Value::Null => empty_object(),
            obj @ Value::Object(_) => obj,
            other => {
                return Err(RelayError::EnvelopeDecode(format!(
                    "payload must be an object, got {}",
                    json_type_name(&other)
                )));
            }
        };
        Ok(Self {
            kind: raw.kind,
            payload,
        })
    }

    /// Attach the owning connection's room and participant identity.
    pub fn stamp(self, room_id: &str, sender_id: &str) -> Envelope {
        Envelope {
            kind: self.kind,
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            payload: self.payload,
            timestamp: now_iso8601(),
        }
    }

    /// SDP text of an offer/answer payload, if present.
    pub fn sdp(&self) -> Option<&str> {
        self.payload.get("sdp").and_then(Value::as_str)
    }
}

/// Current UTC time as an RFC 3339 / ISO 8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_offer_and_discards_client_identity() {
        let text = r#"{"type":"offer","room_id":"other-room","sender_id":"mallory","payload":{"sdp":"v=0"}}"#;
        let inbound = Inbound::decode(text).unwrap();
        assert_eq!(inbound.kind, MessageKind::Offer);
        assert_eq!(inbound.sdp(), Some("v=0"));

        let env = inbound.stamp("appt-42", "u1");
        assert_eq!(env.room_id, "appt-42");
        assert_eq!(env.sender_id, "u1");
        assert_eq!(env.payload, json!({"sdp": "v=0"}));
    }

    #[test]
    fn kebab_case_type_names() {
        let inbound = Inbound::decode(r#"{"type":"ice-candidate","payload":{"candidate":"a"}}"#).unwrap();
        assert_eq!(inbound.kind, MessageKind::IceCandidate);

        let env = inbound.stamp("r", "s");
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(MessageKind::ChatMessage.as_str(), "chat-message");

        let resend = Inbound::decode(r#"{"type":"resend-offer-request"}"#).unwrap();
        assert_eq!(resend.kind, MessageKind::ResendOfferRequest);
        assert!(resend.kind.includes_sender());
        assert!(!MessageKind::Offer.includes_sender());
    }

    #[test]
    fn missing_or_null_payload_becomes_empty_object() {
        let a = Inbound::decode(r#"{"type":"call-ended"}"#).unwrap();
        let b = Inbound::decode(r#"{"type":"call-ended","payload":null}"#).unwrap();
        assert_eq!(a.payload, json!({}));
        assert_eq!(b.payload, json!({}));
    }

    #[test]
    fn rejects_unknown_types_and_bad_payloads() {
        assert!(matches!(
            Inbound::decode(r#"{"type":"launch-missiles"}"#),
            Err(RelayError::EnvelopeDecode(_))
        ));
        assert!(matches!(
            Inbound::decode(r#"{"type":"offer","payload":"v=0"}"#),
            Err(RelayError::EnvelopeDecode(_))
        ));
        assert!(matches!(Inbound::decode("not json"), Err(RelayError::EnvelopeDecode(_))));
        assert!(matches!(Inbound::decode(r#"{"payload":{}}"#), Err(RelayError::EnvelopeDecode(_))));
    }

    #[test]
    fn clients_cannot_send_connection_established() {
        let err = Inbound::decode(r#"{"type":"connection-established"}"#).unwrap_err();
        assert!(err.to_string().contains("connection-established"));
    }

    #[test]
    fn greeting_carries_room_and_server_sender() {
        let env = Envelope::connection_established("appt-42", "u2", "call");
        assert_eq!(env.kind, MessageKind::ConnectionEstablished);
        assert_eq!(env.room_id, "appt-42");
        assert_eq!(env.sender_id, SERVER_SENDER_ID);
        assert_eq!(env.payload["participant_id"], "u2");
        assert!(chrono::DateTime::parse_from_rfc3339(&env.timestamp).is_ok());
    }
}
