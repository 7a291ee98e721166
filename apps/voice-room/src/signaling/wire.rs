//! Engine.IO v4 / Socket.IO v4 text framing used by the room server.
//!
//! Only the default namespace and text frames are supported. Binary
//! attachments never appear in the negotiation protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine.io packet type {0:?}")]
    UnknownEnginePacket(char),
    #[error("unknown socket.io packet type {0:?}")]
    UnknownSocketPacket(char),
    #[error("binary socket.io packets are not supported")]
    UnsupportedBinary,
    #[error("event packet carries no event name")]
    MissingEventName,
    #[error("invalid ack id {0:?}")]
    InvalidAckId(String),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload of the engine.io `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        payload: Value,
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl SocketPacket {
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        SocketPacket::Event {
            name: name.into(),
            payload,
            ack: None,
        }
    }

    /// Human readable reason carried by a `CONNECT_ERROR`.
    pub fn connect_error_reason(data: &Value) -> String {
        match data {
            Value::String(reason) => reason.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

pub fn encode(packet: &EnginePacket) -> Result<String, WireError> {
    let frame = match packet {
        EnginePacket::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
        EnginePacket::Close => "1".to_string(),
        EnginePacket::Ping(data) => format!("2{data}"),
        EnginePacket::Pong(data) => format!("3{data}"),
        EnginePacket::Message(socket) => format!("4{}", encode_socket(socket)?),
        EnginePacket::Upgrade => "5".to_string(),
        EnginePacket::Noop => "6".to_string(),
    };
    Ok(frame)
}

fn encode_socket(packet: &SocketPacket) -> Result<String, WireError> {
    let frame = match packet {
        SocketPacket::Connect(None) => "0".to_string(),
        SocketPacket::Connect(Some(auth)) => format!("0{}", serde_json::to_string(auth)?),
        SocketPacket::Disconnect => "1".to_string(),
        SocketPacket::Event { name, payload, ack } => {
            let body = serde_json::to_string(&Value::Array(vec![
                Value::String(name.clone()),
                payload.clone(),
            ]))?;
            match ack {
                Some(id) => format!("2{id}{body}"),
                None => format!("2{body}"),
            }
        }
        SocketPacket::Ack { id, args } => format!("3{id}{}", serde_json::to_string(args)?),
        SocketPacket::ConnectError(data) => format!("4{}", serde_json::to_string(data)?),
    };
    Ok(frame)
}

pub fn decode(frame: &str) -> Result<EnginePacket, WireError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(WireError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(rest.to_string())),
        '3' => Ok(EnginePacket::Pong(rest.to_string())),
        '4' => decode_socket(rest).map(EnginePacket::Message),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(WireError::UnknownEnginePacket(other)),
    }
}

fn decode_socket(frame: &str) -> Result<SocketPacket, WireError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(WireError::Empty)?;
    let body = strip_namespace(chars.as_str());
    match kind {
        '0' => {
            if body.trim().is_empty() {
                Ok(SocketPacket::Connect(None))
            } else {
                Ok(SocketPacket::Connect(Some(serde_json::from_str(body)?)))
            }
        }
        '1' => Ok(SocketPacket::Disconnect),
        '2' => {
            let (ack, json) = split_ack_id(body)?;
            let mut args: Vec<Value> = serde_json::from_str(json)?;
            if args.is_empty() {
                return Err(WireError::MissingEventName);
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                _ => return Err(WireError::MissingEventName),
            };
            let payload = args.into_iter().next().unwrap_or(Value::Null);
            Ok(SocketPacket::Event { name, payload, ack })
        }
        '3' => {
            let (ack, json) = split_ack_id(body)?;
            let id = ack.ok_or_else(|| WireError::InvalidAckId(String::new()))?;
            Ok(SocketPacket::Ack {
                id,
                args: serde_json::from_str(json)?,
            })
        }
        '4' => {
            let data = if body.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(body)?
            };
            Ok(SocketPacket::ConnectError(data))
        }
        '5' | '6' => Err(WireError::UnsupportedBinary),
        other => Err(WireError::UnknownSocketPacket(other)),
    }
}

fn strip_namespace(body: &str) -> &str {
    if !body.starts_with('/') {
        return body;
    }
    match body.find(',') {
        Some(idx) => &body[idx + 1..],
        None => "",
    }
}

fn split_ack_id(body: &str) -> Result<(Option<u64>, &str), WireError> {
    let digits = body.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return Ok((None, body));
    }
    let (id, rest) = body.split_at(digits);
    let id = id
        .parse()
        .map_err(|_| WireError::InvalidAckId(id.to_string()))?;
    Ok((Some(id), rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_event_with_payload() {
        let packet = decode(r#"42["transport-created",{"id":"X"}]"#).expect("decode");
        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::event("transport-created", json!({"id": "X"})))
        );
    }

    #[test]
    fn decodes_namespaced_event_with_ack() {
        let packet = decode(r#"42/rooms,17["produced",{"producer_id":"p1"}]"#).expect("decode");
        let EnginePacket::Message(SocketPacket::Event { name, payload, ack }) = packet else {
            panic!("expected event");
        };
        assert_eq!(name, "produced");
        assert_eq!(payload, json!({"producer_id": "p1"}));
        assert_eq!(ack, Some(17));
    }

    #[test]
    fn event_without_arguments_has_null_payload() {
        let packet = decode(r#"42["speak-request-approved"]"#).expect("decode");
        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::event("speak-request-approved", Value::Null))
        );
    }

    #[test]
    fn encodes_outbound_event() {
        let frame = encode(&EnginePacket::Message(SocketPacket::event(
            "get-router-rtp-capabilities",
            json!({"roomId": "r1"}),
        )))
        .expect("encode");
        assert_eq!(frame, r#"42["get-router-rtp-capabilities",{"roomId":"r1"}]"#);
    }

    #[test]
    fn encodes_connect_with_auth() {
        let frame = encode(&EnginePacket::Message(SocketPacket::Connect(Some(
            json!({"token": "abc"}),
        ))))
        .expect("encode");
        assert_eq!(frame, r#"40{"token":"abc"}"#);
    }

    #[test]
    fn decodes_open_handshake() {
        let packet = decode(
            r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .expect("decode");
        let EnginePacket::Open(handshake) = packet else {
            panic!("expected open");
        };
        assert_eq!(handshake.sid, "s1");
        assert_eq!(handshake.ping_interval, 25_000);
    }

    #[test]
    fn connect_error_reason_reads_message_field() {
        let packet = decode(r#"44{"message":"AUTH_REQUIRED"}"#).expect("decode");
        let EnginePacket::Message(SocketPacket::ConnectError(data)) = packet else {
            panic!("expected connect error");
        };
        assert_eq!(SocketPacket::connect_error_reason(&data), "AUTH_REQUIRED");
        assert_eq!(SocketPacket::connect_error_reason(&Value::Null), "");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode(""), Err(WireError::Empty)));
        assert!(matches!(decode("9"), Err(WireError::UnknownEnginePacket('9'))));
        assert!(matches!(decode("42[1,2]"), Err(WireError::MissingEventName)));
        assert!(matches!(decode("45"), Err(WireError::UnsupportedBinary)));
    }

    #[test]
    fn ping_round_trips_probe_data() {
        assert_eq!(decode("2probe").expect("decode"), EnginePacket::Ping("probe".into()));
        assert_eq!(encode(&EnginePacket::Pong("probe".into())).expect("encode"), "3probe");
    }
}
