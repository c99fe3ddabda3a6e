//! Wire envelopes exchanged over the push connection.
//!
//! Every frame is a JSON object discriminated by its `type` field. Decoding
//! fails closed: anything that is not a recognised, well-formed envelope is
//! reported as a [`CodecError`] so the caller can drop the single frame and
//! keep the connection open.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no type discriminator")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
    #[error("{kind} frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("{kind} frame has an invalid `{field}`: {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Payload of a `message` envelope as pushed by the server.
///
/// The server sends empty strings for fields it has no value for; those are
/// read as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "non_empty", skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, deserialize_with = "lenient_int", skip_serializing_if = "Option::is_none")]
    pub badge: Option<i64>,
    #[serde(
        default,
        alias = "encryptedContent",
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Server push carrying one notification.
    Message {
        id: String,
        data: MessageData,
        timestamp: Option<i64>,
    },
    /// Application-level heartbeat from the server.
    Ping { timestamp: Option<i64> },
    /// Heartbeat reply (client only).
    Pong { timestamp: i64 },
    /// Delivery acknowledgement (client only).
    Ack { id: String },
}

impl Envelope {
    pub fn pong_now() -> Self {
        Envelope::Pong {
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn ack(id: impl Into<String>) -> Self {
        Envelope::Ack { id: id.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Message { .. } => "message",
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::Ack { .. } => "ack",
        }
    }

    /// Serialize to the wire JSON text.
    pub fn encode(&self) -> String {
        let value = match self {
            Envelope::Message {
                id,
                data,
                timestamp,
            } => {
                let mut obj = json!({"type": "message", "id": id, "data": data});
                if let Some(ts) = timestamp {
                    obj["timestamp"] = json!(ts);
                }
                obj
            }
            Envelope::Ping { timestamp } => match timestamp {
                Some(ts) => json!({"type": "ping", "timestamp": ts}),
                None => json!({"type": "ping"}),
            },
            Envelope::Pong { timestamp } => json!({"type": "pong", "timestamp": timestamp}),
            Envelope::Ack { id } => json!({"type": "ack", "id": id}),
        };
        value.to_string()
    }

    /// Parse one wire frame.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(CodecError::NotAnObject);
        };
        let kind = match obj.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(Value::Null) | None => return Err(CodecError::MissingType),
            Some(other) => return Err(CodecError::UnknownType(other.to_string())),
        };

        match kind.as_str() {
            "message" => {
                let id = required_id(&obj, "message")?;
                let data = match obj.remove("data") {
                    Some(Value::Null) | None => {
                        return Err(CodecError::MissingField {
                            kind: "message",
                            field: "data",
                        })
                    }
                    Some(data @ Value::Object(_)) => serde_json::from_value::<MessageData>(data)
                        .map_err(|e| CodecError::InvalidField {
                            kind: "message",
                            field: "data",
                            reason: e.to_string(),
                        })?,
                    Some(_) => {
                        return Err(CodecError::InvalidField {
                            kind: "message",
                            field: "data",
                            reason: "expected an object".into(),
                        })
                    }
                };
                Ok(Envelope::Message {
                    id,
                    data,
                    timestamp: timestamp(&obj),
                })
            }
            "ping" => Ok(Envelope::Ping {
                timestamp: timestamp(&obj),
            }),
            "pong" => Ok(Envelope::Pong {
                timestamp: timestamp(&obj).unwrap_or_default(),
            }),
            "ack" => Ok(Envelope::Ack {
                id: required_id(&obj, "ack")?,
            }),
            _ => Err(CodecError::UnknownType(kind)),
        }
    }
}

fn required_id(obj: &Map<String, Value>, kind: &'static str) -> Result<String, CodecError> {
    match obj.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(CodecError::MissingField { kind, field: "id" }),
    }
}

fn timestamp(obj: &Map<String, Value>) -> Option<i64> {
    obj.get("timestamp").and_then(as_int)
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(as_int(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_with_server_shaped_data() {
        let frame = r#"{"type":"message","id":"m1","timestamp":1700000000,
            "data":{"title":"Hi","body":"hello","group":"","icon":"","url":"https://x",
                    "sound":"","badge":3,"encrypted_content":""}}"#;
        let env = Envelope::decode(frame).unwrap();
        let Envelope::Message {
            id,
            data,
            timestamp,
        } = env
        else {
            panic!("expected message");
        };
        assert_eq!(id, "m1");
        assert_eq!(timestamp, Some(1_700_000_000));
        assert_eq!(data.title.as_deref(), Some("Hi"));
        assert_eq!(data.body.as_deref(), Some("hello"));
        assert_eq!(data.url.as_deref(), Some("https://x"));
        assert_eq!(data.group, None);
        assert_eq!(data.encrypted_content, None);
        assert_eq!(data.badge, Some(3));
    }

    #[test]
    fn accepts_camel_case_encrypted_content() {
        let frame = r#"{"type":"message","id":"m2","data":{"encryptedContent":"abc"}}"#;
        match Envelope::decode(frame).unwrap() {
            Envelope::Message { data, .. } => {
                assert_eq!(data.encrypted_content.as_deref(), Some("abc"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ping_without_payload() {
        assert_eq!(
            Envelope::decode(r#"{"type":"ping"}"#).unwrap(),
            Envelope::Ping { timestamp: None }
        );
    }

    #[test]
    fn message_requires_id_and_data() {
        assert_eq!(
            Envelope::decode(r#"{"type":"message","data":{}}"#),
            Err(CodecError::MissingField {
                kind: "message",
                field: "id"
            })
        );
        assert_eq!(
            Envelope::decode(r#"{"type":"message","id":"","data":{}}"#),
            Err(CodecError::MissingField {
                kind: "message",
                field: "id"
            })
        );
        assert_eq!(
            Envelope::decode(r#"{"type":"message","id":"x"}"#),
            Err(CodecError::MissingField {
                kind: "message",
                field: "data"
            })
        );
        assert!(matches!(
            Envelope::decode(r#"{"type":"message","id":"x","data":"nope"}"#),
            Err(CodecError::InvalidField { .. })
        ));
    }

    #[test]
    fn ack_requires_id() {
        assert!(Envelope::decode(r#"{"type":"ack"}"#).is_err());
        assert_eq!(
            Envelope::decode(r#"{"type":"ack","id":"m9"}"#).unwrap(),
            Envelope::ack("m9")
        );
    }

    #[test]
    fn malformed_frames_fail_closed() {
        let inputs = [
            "",
            "   ",
            "{",
            "null",
            "[]",
            "42",
            "\"message\"",
            r#"{"id":"m1"}"#,
            r#"{"type":null}"#,
            r#"{"type":7}"#,
            r#"{"type":"subscribe"}"#,
            r#"{"type":"MESSAGE","id":"m1","data":{}}"#,
            "{\"type\":\"message\",\"id\":\"m1\",\"data\":{\"title\":\"\u{0}",
        ];
        for input in inputs {
            assert!(Envelope::decode(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        assert_eq!(
            Envelope::decode(r#"{"type":"subscribe"}"#),
            Err(CodecError::UnknownType("subscribe".into()))
        );
    }

    #[test]
    fn encodes_client_frames() {
        let ack: Value = serde_json::from_str(&Envelope::ack("m1").encode()).unwrap();
        assert_eq!(ack, json!({"type": "ack", "id": "m1"}));

        let pong: Value =
            serde_json::from_str(&Envelope::Pong { timestamp: 1234 }.encode()).unwrap();
        assert_eq!(pong, json!({"type": "pong", "timestamp": 1234}));
    }

    #[test]
    fn pong_now_uses_unix_seconds() {
        let before = Utc::now().timestamp();
        let Envelope::Pong { timestamp } = Envelope::pong_now() else {
            panic!("expected pong");
        };
        assert!(timestamp >= before && timestamp <= before + 5);
    }

    #[test]
    fn encoded_message_decodes_to_same_envelope() {
        let env = Envelope::Message {
            id: "m3".into(),
            data: MessageData {
                title: Some("t".into()),
                badge: Some(2),
                ..Default::default()
            },
            timestamp: Some(10),
        };
        assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
    }
}
