//! Event names and reply normalization for the room server protocol.
//!
//! Replies arrive with loosely shaped payloads (the same id under several
//! names). Everything past this module sees one typed value per reply kind.

use serde_json::Value;
use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

use super::NegotiationError;
use crate::media::{
    ConsumerOptions, Direction, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
    default_ice_servers,
};
use crate::signaling::SignalingError;
use crate::signaling::correlator::first_present;

pub const GET_ROUTER_RTP_CAPABILITIES: &str = "get-router-rtp-capabilities";
pub const ROUTER_RTP_CAPABILITIES: &str = "router-rtp-capabilities";
pub const CREATE_TRANSPORT: &str = "create-transport";
pub const TRANSPORT_CREATED: &str = "transport-created";
pub const CONNECT_TRANSPORT: &str = "connect-transport";
pub const TRANSPORT_CONNECTED: &str = "transport-connected";
pub const PRODUCE: &str = "produce";
pub const PRODUCED: &str = "produced";
pub const CONSUME: &str = "consume";
pub const CONSUMED: &str = "consumed";
pub const CONSUMER_ZERO_BYTES: &str = "consumer-zero-bytes";
pub const PRODUCER_CHECK_ROUTE: &str = "producer-check-route";
pub const NEW_PRODUCER: &str = "new-producer";

pub const JOIN_ROOM: &str = "join-room";
pub const LEAVE_ROOM: &str = "leave-room";
pub const USER_JOINED: &str = "user-joined";
pub const USER_LEFT: &str = "user-left";
pub const REQUEST_SPEAK: &str = "request-speak";
pub const SPEAK_REQUEST_APPROVED: &str = "speak-request-approved";
pub const SPEAK_REQUEST_REJECTED: &str = "speak-request-rejected";
pub const SPEAK_REQUEST: &str = "speak-request";
pub const SPEAK_REQUEST_CANCELLED: &str = "speak-request-cancelled";
pub const APPROVE_SPEAK: &str = "approve-speak";
pub const REJECT_SPEAK: &str = "reject-speak";

/// Inbound events whose listeners belong to a room and go away with it.
pub const ROOM_EVENTS: &[&str] = &[
    ROUTER_RTP_CAPABILITIES,
    TRANSPORT_CREATED,
    TRANSPORT_CONNECTED,
    PRODUCED,
    CONSUMED,
    CONSUMER_ZERO_BYTES,
    NEW_PRODUCER,
    USER_JOINED,
    USER_LEFT,
    SPEAK_REQUEST_APPROVED,
    SPEAK_REQUEST_REJECTED,
    SPEAK_REQUEST,
    SPEAK_REQUEST_CANCELLED,
];

pub const TRANSPORT_ID_KEYS: &[&str] = &["transportId", "id", "transport_id"];
pub const PRODUCER_ID_KEYS: &[&str] = &["producerId", "id", "producer_id"];
/// Transport echo on replies whose `id` means something else.
pub const TRANSPORT_ECHO_KEYS: &[&str] = &["transportId", "transport_id"];
/// On `consumed`, `id` is the consumer id.
pub const CONSUMED_PRODUCER_KEYS: &[&str] = &["producerId", "producer_id"];
pub const CONSUMER_ID_KEYS: &[&str] = &["consumerId", "id", "consumer_id"];

const ICE_SERVER_KEYS: &[&str] = &["iceServers", "ice_servers", "relayServers"];

/// A negative acknowledgement: an `error` field, or `success`/`ok` set to false.
pub fn negative_ack(payload: &Value) -> Option<String> {
    match payload.get("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(reason)) => return Some(reason.clone()),
        Some(other) => {
            return Some(
                other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            );
        }
    }
    let refused = ["success", "ok"]
        .iter()
        .any(|key| payload.get(*key) == Some(&Value::Bool(false)));
    refused.then(|| {
        payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request refused")
            .to_string()
    })
}

pub fn reject_negative(event: &str, payload: &Value) -> Result<(), SignalingError> {
    match negative_ack(payload) {
        Some(reason) => Err(SignalingError::Rejected {
            event: event.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

pub fn parse_capabilities(payload: &Value) -> Result<RtpCapabilities, NegotiationError> {
    reject_negative(ROUTER_RTP_CAPABILITIES, payload)?;
    match payload.get("capabilities") {
        Some(caps @ Value::Object(_)) => Ok(RtpCapabilities(caps.clone())),
        _ => Err(NegotiationError::InvalidReply {
            event: ROUTER_RTP_CAPABILITIES,
            reason: "missing capabilities".into(),
        }),
    }
}

/// Normalized `transport-created` reply.
#[derive(Debug, Clone)]
pub struct TransportCreated {
    pub transport_id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub ice_servers: Vec<RTCIceServer>,
}

impl TransportCreated {
    pub fn parse(payload: &Value) -> Result<Self, NegotiationError> {
        reject_negative(TRANSPORT_CREATED, payload)?;
        let transport_id = first_present(payload, TRANSPORT_ID_KEYS).ok_or_else(|| {
            NegotiationError::InvalidReply {
                event: TRANSPORT_CREATED,
                reason: "no transport id under transportId, id or transport_id".into(),
            }
        })?;
        let field = |camel: &str, snake: &str| {
            payload
                .get(camel)
                .or_else(|| payload.get(snake))
                .cloned()
                .unwrap_or(Value::Null)
        };
        let ice_servers = ICE_SERVER_KEYS
            .iter()
            .find_map(|key| payload.get(*key))
            .map(parse_ice_servers)
            .unwrap_or_default();
        Ok(Self {
            ice_parameters: field("iceParameters", "ice_parameters"),
            ice_candidates: field("iceCandidates", "ice_candidates"),
            dtls_parameters: field("dtlsParameters", "dtls_parameters"),
            transport_id,
            ice_servers,
        })
    }

    /// Library options; an absent or empty relay list becomes a single
    /// STUN entry.
    pub fn into_options(self, direction: Direction, fallback_stun: &str) -> TransportOptions {
        let ice_servers = if self.ice_servers.is_empty() {
            default_ice_servers(fallback_stun)
        } else {
            self.ice_servers
        };
        TransportOptions {
            id: self.transport_id,
            direction,
            ice_parameters: self.ice_parameters,
            ice_candidates: self.ice_candidates,
            dtls_parameters: self.dtls_parameters,
            ice_servers,
        }
    }
}

fn parse_ice_servers(raw: &Value) -> Vec<RTCIceServer> {
    let Some(entries) = raw.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let urls: Vec<String> = match entry.get("urls").or_else(|| entry.get("url"))? {
                Value::String(url) => vec![url.clone()],
                Value::Array(urls) => urls
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => return None,
            };
            if urls.is_empty() {
                return None;
            }
            let text = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            Some(RTCIceServer {
                urls,
                username: text("username"),
                credential: text("credential"),
                ..Default::default()
            })
        })
        .collect()
}

/// Server-assigned producer id from a `produced` reply.
pub fn parse_produced(payload: &Value) -> Result<String, NegotiationError> {
    reject_negative(PRODUCED, payload)?;
    first_present(payload, PRODUCER_ID_KEYS).ok_or_else(|| NegotiationError::InvalidReply {
        event: PRODUCED,
        reason: "no producer id under producerId, id or producer_id".into(),
    })
}

/// Validates a `consumed` reply.
///
/// Empty or missing `rtpParameters` is the server saying "nothing to consume
/// yet" and yields `Ok(None)`. Missing identity fields are an error.
pub fn parse_consumed(
    payload: &Value,
    requested_producer: &str,
) -> Result<Option<ConsumerOptions>, NegotiationError> {
    reject_negative(CONSUMED, payload)?;
    let rtp_parameters = RtpParameters(payload.get("rtpParameters").cloned().unwrap_or(Value::Null));
    if rtp_parameters.is_empty() {
        warn!(
            producer_id = requested_producer,
            "Missing rtpParameters; skipping consumer"
        );
        return Ok(None);
    }
    let consumer_id = first_present(payload, CONSUMER_ID_KEYS)
        .ok_or_else(|| NegotiationError::InvalidConsumerPayload("missing consumerId".into()))?;
    let producer_id = first_present(payload, CONSUMED_PRODUCER_KEYS)
        .ok_or_else(|| NegotiationError::InvalidConsumerPayload("missing producerId".into()))?;
    warn_divergent(payload, CONSUMER_ID_KEYS, &consumer_id);
    warn_divergent(payload, CONSUMED_PRODUCER_KEYS, &producer_id);
    let kind = match payload.get("kind").and_then(Value::as_str) {
        Some(raw) => MediaKind::parse(raw).ok_or_else(|| {
            NegotiationError::InvalidConsumerPayload(format!("unknown media kind {raw:?}"))
        })?,
        None => MediaKind::Audio,
    };
    Ok(Some(ConsumerOptions {
        id: consumer_id,
        producer_id,
        kind,
        rtp_parameters,
    }))
}

fn warn_divergent(payload: &Value, keys: &[&str], chosen: &str) {
    for key in keys {
        if let Some(Value::String(alternate)) = payload.get(*key) {
            if alternate != chosen {
                warn!(
                    field = *key,
                    alternate = %alternate,
                    chosen,
                    "consumed reply carries divergent ids; using the first present"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transport_id_alternates_normalize() {
        for payload in [
            json!({"transportId": "X"}),
            json!({"id": "X"}),
            json!({"transport_id": "X"}),
        ] {
            let created = TransportCreated::parse(&payload).expect("parse");
            assert_eq!(created.transport_id, "X");
        }
        assert!(TransportCreated::parse(&json!({"iceParameters": {}})).is_err());
    }

    #[test]
    fn missing_relays_fall_back_to_stun() {
        let options = TransportCreated::parse(&json!({"id": "X", "iceServers": []}))
            .expect("parse")
            .into_options(Direction::Send, "stun:fallback:3478");
        assert_eq!(options.ice_servers.len(), 1);
        assert_eq!(options.ice_servers[0].urls, vec!["stun:fallback:3478".to_string()]);
    }

    #[test]
    fn server_relays_are_kept() {
        let created = TransportCreated::parse(&json!({
            "id": "X",
            "iceServers": [
                {"urls": "turn:relay.example.com:3478", "username": "u", "credential": "c"},
                {"urls": []},
            ],
        }))
        .expect("parse");
        assert_eq!(created.ice_servers.len(), 1);
        assert_eq!(created.ice_servers[0].username, "u");
        let options = created.into_options(Direction::Recv, "stun:unused");
        assert_eq!(options.ice_servers[0].urls, vec!["turn:relay.example.com:3478".to_string()]);
    }

    #[test]
    fn produced_alternates_normalize() {
        assert_eq!(parse_produced(&json!({"producer_id": "p1"})).expect("id"), "p1");
        assert_eq!(parse_produced(&json!({"id": "p2"})).expect("id"), "p2");
        assert!(parse_produced(&json!({})).is_err());
    }

    #[test]
    fn negative_acks_reject() {
        assert_eq!(negative_ack(&json!({"error": "INSUFFICIENT_FUNDS"})).as_deref(), Some("INSUFFICIENT_FUNDS"));
        assert_eq!(
            negative_ack(&json!({"success": false, "message": "no"})).as_deref(),
            Some("no")
        );
        assert_eq!(negative_ack(&json!({"error": null, "id": "p"})), None);
        assert!(matches!(
            parse_produced(&json!({"error": {"message": "denied"}})),
            Err(NegotiationError::Signaling(SignalingError::Rejected { .. }))
        ));
    }

    #[test]
    fn empty_rtp_parameters_mean_nothing_to_consume() {
        for payload in [
            json!({"consumerId": "c1", "producerId": "p1", "rtpParameters": {}}),
            json!({"consumerId": "c1", "producerId": "p1"}),
            json!({"consumerId": "c1", "producerId": "p1", "rtpParameters": null}),
        ] {
            assert_eq!(parse_consumed(&payload, "p1").expect("valid"), None);
        }
    }

    #[test]
    fn consumed_requires_identity() {
        let err = parse_consumed(&json!({"producerId": "p1", "rtpParameters": {"codecs": []}}), "p1")
            .expect_err("no consumer id");
        assert!(matches!(err, NegotiationError::InvalidConsumerPayload(_)));
    }

    #[test]
    fn consumed_id_names_the_consumer() {
        let options = parse_consumed(
            &json!({
                "id": "c1",
                "producerId": "p1",
                "kind": "audio",
                "rtpParameters": {"codecs": [{"mimeType": "audio/opus"}]},
            }),
            "p1",
        )
        .expect("valid")
        .expect("consumer");
        assert_eq!(options.id, "c1");
        assert_eq!(options.producer_id, "p1");

        let err = parse_consumed(
            &json!({"id": "c1", "consumerId": "c1", "rtpParameters": {"codecs": []}}),
            "p1",
        )
        .expect_err("no producer id");
        assert!(matches!(err, NegotiationError::InvalidConsumerPayload(_)));
    }

    #[test]
    fn consumed_prefers_first_present_ids() {
        let options = parse_consumed(
            &json!({
                "id": "c-legacy",
                "consumerId": "c1",
                "producerId": "p1",
                "kind": "audio",
                "rtpParameters": {"codecs": [{"mimeType": "audio/opus"}]},
            }),
            "p1",
        )
        .expect("valid")
        .expect("consumer");
        assert_eq!(options.id, "c1");
        assert_eq!(options.producer_id, "p1");
        assert_eq!(options.kind, MediaKind::Audio);
    }
}
