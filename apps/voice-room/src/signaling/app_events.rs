use std::sync::Arc;

use serde_json::{Value, json};
use signal_bus::{EventBus, SignalBus, Subscription};
use tracing::debug;

pub const SOCKET_AUTH_ERROR: &str = "socket:auth_error";
pub const SOCKET_INSUFFICIENT_FUNDS: &str = "socket:insufficient_funds";
pub const SOCKET_CONNECT_ERROR: &str = "socket:connect_error";
pub const AUDIO_DELIVERY_STALLED: &str = "audio:delivery_stalled";
pub const AUDIO_MUTED_PENDING_INTERACTION: &str = "audio:muted_pending_interaction";
pub const AUDIO_RECOVERY_EXHAUSTED: &str = "audio:recovery_exhausted";
pub const AUDIO_PRODUCER_UNHEARD: &str = "audio:producer_unheard";

/// Best-effort classification of a handshake rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    AuthRequired,
    InsufficientFunds,
    Generic,
}

impl ConnectFailure {
    pub fn classify(reason: &str) -> Self {
        let upper = reason.to_ascii_uppercase();
        if mentions_insufficient_funds(&upper) {
            ConnectFailure::InsufficientFunds
        } else if upper.contains("AUTH_REQUIRED")
            || upper.contains("INVALID_TOKEN")
            || upper.contains("AUTH")
        {
            ConnectFailure::AuthRequired
        } else {
            ConnectFailure::Generic
        }
    }

    pub fn app_event(self) -> &'static str {
        match self {
            ConnectFailure::AuthRequired => SOCKET_AUTH_ERROR,
            ConnectFailure::InsufficientFunds => SOCKET_INSUFFICIENT_FUNDS,
            ConnectFailure::Generic => SOCKET_CONNECT_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectFailure::AuthRequired => "auth_required",
            ConnectFailure::InsufficientFunds => "insufficient_funds",
            ConnectFailure::Generic => "generic",
        }
    }
}

pub fn mentions_insufficient_funds(message: &str) -> bool {
    message.to_ascii_uppercase().contains("INSUFFICIENT_FUNDS")
}

/// Local application event bus for subsystems that must not depend on the
/// negotiation engine (auth prompts, wallet prompts, audio indicators).
#[derive(Clone, Default)]
pub struct AppEvents {
    bus: Arc<SignalBus>,
}

impl AppEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str) -> Subscription {
        self.bus.subscribe(event)
    }

    pub fn publish(&self, event: &str, payload: Value) -> usize {
        debug!(target = "app_events", event, "publish");
        self.bus.publish(event, payload)
    }

    pub fn report_connect_failure(&self, reason: &str) -> ConnectFailure {
        let failure = ConnectFailure::classify(reason);
        self.publish(failure.app_event(), json!({ "reason": reason }));
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reasons() {
        assert_eq!(ConnectFailure::classify("AUTH_REQUIRED"), ConnectFailure::AuthRequired);
        assert_eq!(ConnectFailure::classify("invalid_token"), ConnectFailure::AuthRequired);
        assert_eq!(
            ConnectFailure::classify("Error: INSUFFICIENT_FUNDS for room"),
            ConnectFailure::InsufficientFunds
        );
        assert_eq!(ConnectFailure::classify(""), ConnectFailure::Generic);
        assert_eq!(ConnectFailure::classify("xhr poll error"), ConnectFailure::Generic);
    }

    #[tokio::test]
    async fn report_publishes_the_classified_event() {
        let events = AppEvents::new();
        let mut auth = events.subscribe(SOCKET_AUTH_ERROR);
        let mut generic = events.subscribe(SOCKET_CONNECT_ERROR);

        assert_eq!(
            events.report_connect_failure("AUTH_REQUIRED"),
            ConnectFailure::AuthRequired
        );
        let event = auth.recv().await.expect("auth event");
        assert_eq!(event.payload, json!({"reason": "AUTH_REQUIRED"}));
        assert!(generic.try_recv().is_none());
    }
}
