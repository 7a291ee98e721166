//! Turns "emit, then wait for a named reply" into one awaitable step.
//!
//! Waits are registered *before* the request is emitted so a fast reply can
//! never slip past. Each wait owns its listener; resolving, timing out or
//! dropping the wait deregisters it.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use super::{Listener, SignalingClient, SignalingError};

pub const DEFAULT_MATCH_TIMEOUT: Duration = Duration::from_secs(10);

const REQUEST_ID_KEYS: &[&str] = &["requestId", "request_id"];
const ROOM_ID_KEYS: &[&str] = &["roomId", "room_id"];
const DIRECTION_KEYS: &[&str] = &["direction"];

pub type PredicateResult = Result<bool, Box<dyn std::error::Error + Send + Sync>>;
type Predicate = Box<dyn Fn(&Value) -> PredicateResult + Send + Sync>;

/// First non-empty string (or number, rendered) under any of `keys`.
pub fn first_present(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// How a reply is recognised among same-named events.
pub enum ReplyFilter {
    /// The very next occurrence, whatever it carries.
    First,
    Matcher(ReplyMatcher),
    Predicate(Predicate),
}

impl ReplyFilter {
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> PredicateResult + Send + Sync + 'static,
    {
        ReplyFilter::Predicate(Box::new(predicate))
    }

    fn accepts(&self, payload: &Value) -> bool {
        match self {
            ReplyFilter::First => true,
            ReplyFilter::Matcher(matcher) => matcher.matches(payload),
            ReplyFilter::Predicate(predicate) => match predicate(payload) {
                Ok(matched) => matched,
                Err(err) => {
                    debug!(target = "signaling", error = %err, "predicate failed; treating as no match");
                    false
                }
            },
        }
    }
}

impl fmt::Debug for ReplyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyFilter::First => f.write_str("First"),
            ReplyFilter::Matcher(matcher) => f.debug_tuple("Matcher").field(matcher).finish(),
            ReplyFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<ReplyMatcher> for ReplyFilter {
    fn from(matcher: ReplyMatcher) -> Self {
        ReplyFilter::Matcher(matcher)
    }
}

/// Fallback chain over whatever the server echoes back.
///
/// 1. an echoed request id decides alone;
/// 2. an echoed room id that differs from ours rejects;
/// 3. an echoed identity (transport id, producer id, ...) decides;
/// 4. an echoed direction tag decides;
/// 5. otherwise the first occurrence is accepted.
#[derive(Debug, Clone, Default)]
pub struct ReplyMatcher {
    request_id: Option<String>,
    room_id: Option<String>,
    direction: Option<String>,
    identity: Option<(&'static [&'static str], String)>,
}

impl ReplyMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    pub fn identity(mut self, keys: &'static [&'static str], value: impl Into<String>) -> Self {
        self.identity = Some((keys, value.into()));
        self
    }

    pub fn matches(&self, payload: &Value) -> bool {
        if let (Some(ours), Some(echoed)) =
            (&self.request_id, first_present(payload, REQUEST_ID_KEYS))
        {
            return *ours == echoed;
        }
        if let (Some(ours), Some(echoed)) = (&self.room_id, first_present(payload, ROOM_ID_KEYS)) {
            if *ours != echoed {
                return false;
            }
        }
        if let Some((keys, ours)) = &self.identity {
            if let Some(echoed) = first_present(payload, keys) {
                return *ours == echoed;
            }
        }
        if let (Some(ours), Some(echoed)) =
            (&self.direction, first_present(payload, DIRECTION_KEYS))
        {
            return *ours == echoed;
        }
        true
    }
}

/// A registered wait for one reply.
#[derive(Debug)]
pub struct PendingReply {
    listener: Listener,
    filter: ReplyFilter,
    timeout: Option<Duration>,
}

impl PendingReply {
    pub fn event(&self) -> &str {
        self.listener.event()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn wait(self) -> Result<Value, SignalingError> {
        let event = self.event().to_string();
        let PendingReply {
            mut listener,
            filter,
            timeout,
        } = self;
        let next = async move {
            loop {
                let Some(payload) = listener.recv().await else {
                    return Err(SignalingError::Abandoned {
                        event: listener.event().to_string(),
                    });
                };
                if filter.accepts(&payload) {
                    return Ok(payload);
                }
                trace!(target = "signaling", event = listener.event(), "ignored non-matching reply");
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| SignalingError::Timeout {
                    event,
                    timeout: limit,
                })?,
            None => next.await,
        }
    }
}

impl SignalingClient {
    /// Single-shot wait: resolves with the next `event`, whatever it carries.
    pub fn once(&self, event: &str) -> PendingReply {
        PendingReply {
            listener: self.on(event),
            filter: ReplyFilter::First,
            timeout: None,
        }
    }

    /// Waits for the first `event` accepted by `filter`, or times out.
    pub fn once_match(
        &self,
        event: &str,
        filter: impl Into<ReplyFilter>,
        timeout: Duration,
    ) -> PendingReply {
        PendingReply {
            listener: self.on(event),
            filter: filter.into(),
            timeout: Some(timeout),
        }
    }

    /// Emits `event` and resolves with the reply `pending` was registered for.
    pub async fn request(
        &self,
        event: &str,
        payload: Value,
        pending: PendingReply,
    ) -> Result<Value, SignalingError> {
        let reply_event = pending.event().to_string();
        self.emit(event, payload)?;
        let reply = pending.wait().await;
        if let Err(err) = &reply {
            debug!(target = "signaling", event, reply_event, error = %err, "request failed");
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::AppEvents;
    use serde_json::json;

    const TRANSPORT_KEYS: &[&str] = &["transportId", "id", "transport_id"];

    #[test]
    fn request_id_echo_is_decisive() {
        let matcher = ReplyMatcher::new().request_id("a").direction("send");
        assert!(matcher.matches(&json!({"requestId": "a", "direction": "recv"})));
        assert!(!matcher.matches(&json!({"requestId": "b", "direction": "send"})));
    }

    #[test]
    fn falls_back_to_direction_then_first() {
        let matcher = ReplyMatcher::new().request_id("a").room_id("r1").direction("recv");
        assert!(matcher.matches(&json!({"direction": "recv"})));
        assert!(!matcher.matches(&json!({"direction": "send"})));
        assert!(!matcher.matches(&json!({"roomId": "r2", "direction": "recv"})));
        assert!(matcher.matches(&json!({"id": "X"})));
    }

    #[test]
    fn identity_echo_beats_direction() {
        let matcher = ReplyMatcher::new()
            .identity(TRANSPORT_KEYS, "t1")
            .direction("send");
        assert!(matcher.matches(&json!({"transport_id": "t1"})));
        assert!(!matcher.matches(&json!({"id": "t2", "direction": "send"})));
    }

    #[tokio::test(start_paused = true)]
    async fn once_match_times_out_and_deregisters() {
        let (client, _queue) = SignalingClient::detached(AppEvents::new());
        let pending = client.once_match(
            "transport-connected",
            ReplyMatcher::new().identity(TRANSPORT_KEYS, "t1"),
            Duration::from_millis(50),
        );
        assert_eq!(client.listener_count("transport-connected"), 1);
        let err = pending.wait().await.expect_err("no reply");
        assert!(matches!(err, SignalingError::Timeout { .. }));
        assert_eq!(client.listener_count("transport-connected"), 0);
    }

    #[tokio::test]
    async fn predicate_errors_are_non_matches() {
        let (client, _queue) = SignalingClient::detached(AppEvents::new());
        let pending = client.once_match(
            "produced",
            ReplyFilter::predicate(|payload| {
                let id = payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or("missing id")?;
                Ok(id == "p2")
            }),
            DEFAULT_MATCH_TIMEOUT,
        );
        let waiter = tokio::spawn(pending.wait());
        tokio::task::yield_now().await;
        client.dispatch("produced", json!({"other": 1}));
        client.dispatch("produced", json!({"id": "p1"}));
        client.dispatch("produced", json!({"id": "p2"}));
        let reply = waiter.await.expect("join").expect("matched");
        assert_eq!(reply, json!({"id": "p2"}));
        assert_eq!(client.listener_count("produced"), 0);
    }

    #[tokio::test]
    async fn once_takes_the_next_occurrence() {
        let (client, mut queue) = SignalingClient::detached(AppEvents::new());
        let pending = client.once("router-rtp-capabilities");
        client.dispatch("router-rtp-capabilities", json!({"capabilities": {"codecs": []}}));
        let reply = client
            .request("get-router-rtp-capabilities", json!({"roomId": "r1"}), pending)
            .await
            .expect("reply");
        assert_eq!(reply["capabilities"], json!({"codecs": []}));
        assert_eq!(queue.recv().await.expect("emitted").event, "get-router-rtp-capabilities");
    }
}
