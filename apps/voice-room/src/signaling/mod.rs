//! Signaling channel adapter.
//!
//! A [`SignalingClient`] is the single shared event channel of a client
//! session. Outbound events go through an unbounded queue drained either by
//! the websocket task ([`websocket`]) or, when detached, by whoever holds the
//! [`OutboundQueue`]. Inbound events are fanned out through a
//! [`signal_bus::SignalBus`] so that every waiter owns its own registration.

pub mod app_events;
pub mod correlator;
pub mod websocket;
pub mod wire;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use signal_bus::{BusError, EventBus, SignalBus, Subscription};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub use app_events::{AppEvents, ConnectFailure};
pub use correlator::{PendingReply, ReplyFilter, ReplyMatcher};
pub use websocket::SignalingConfig;

/// Local pseudo-events raised by the adapter itself.
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_CONNECT_ERROR: &str = "connect_error";

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("no {event} reply within {timeout:?}")]
    Timeout { event: String, timeout: Duration },
    #[error("wait for {event} abandoned")]
    Abandoned { event: String },
    #[error("{event} rejected: {reason}")]
    Rejected { event: String, reason: String },
    #[error("signaling transport failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Wire(#[from] wire::WireError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub event: String,
    pub payload: Value,
}

pub type OutboundQueue = mpsc::UnboundedReceiver<OutboundSignal>;

pub struct SignalingClient {
    inbound: SignalBus,
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    connected: AtomicBool,
    app_events: AppEvents,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    fn with_queue(app_events: AppEvents, connected: bool) -> (Arc<Self>, OutboundQueue) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            inbound: SignalBus::new(),
            outbound,
            connected: AtomicBool::new(connected),
            app_events,
            tasks: Mutex::new(Vec::new()),
        });
        (client, queue)
    }

    /// Client whose outbound side is drained by the caller. Used for
    /// in-process servers and tests; reports itself connected until
    /// [`SignalingClient::disconnect`] is called.
    pub fn detached(app_events: AppEvents) -> (Arc<Self>, OutboundQueue) {
        Self::with_queue(app_events, true)
    }

    /// Connects to a Socket.IO server. Returns immediately; `connect` /
    /// `connect_error` are dispatched once the handshake settles.
    pub fn connect(config: SignalingConfig, app_events: AppEvents) -> Arc<Self> {
        let (client, queue) = Self::with_queue(app_events, false);
        let handle = websocket::spawn(Arc::downgrade(&client), config, queue);
        client.tasks.lock().push(handle);
        client
    }

    pub fn app_events(&self) -> &AppEvents {
        &self.app_events
    }

    /// Fire-and-forget emit; there is no delivery guarantee beyond queueing.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), SignalingError> {
        debug!(target = "signaling", event, "emit");
        trace!(target = "signaling", event, %payload, "emit payload");
        self.outbound
            .send(OutboundSignal {
                event: event.to_string(),
                payload,
            })
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Registers a persistent listener. Dropping the returned [`Listener`]
    /// deregisters it.
    pub fn on(&self, event: &str) -> Listener {
        debug!(target = "signaling", event, "add listener");
        Listener {
            subscription: self.inbound.subscribe(event),
        }
    }

    /// Removes every listener for `event`; their pending waits resolve as
    /// abandoned.
    pub fn off(&self, event: &str) {
        if self.inbound.close_topic(event) {
            debug!(target = "signaling", event, "removed listeners");
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inbound.listener_count(event)
    }

    /// Event names with at least one live listener.
    pub fn active_listeners(&self) -> Vec<String> {
        self.inbound.active_topics()
    }

    /// Delivers an inbound event to its listeners.
    pub fn dispatch(&self, event: &str, payload: Value) -> usize {
        let delivered = self.inbound.publish(event, payload);
        debug!(target = "signaling", event, delivered, "receive");
        delivered
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::SeqCst)
    }

    /// Classifies a handshake rejection and raises the matching app event.
    pub fn handle_connect_error(&self, reason: &str) -> ConnectFailure {
        warn!(target = "signaling", reason, "connect_error");
        let failure = self.app_events.report_connect_failure(reason);
        self.dispatch(
            EVENT_CONNECT_ERROR,
            serde_json::json!({ "message": reason, "class": failure.as_str() }),
        );
        failure
    }

    pub fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if self.set_connected(false) {
            self.dispatch(EVENT_DISCONNECT, Value::String("io client disconnect".into()));
        }
        self.inbound.close_all();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// One registered handler for an inbound event name.
#[derive(Debug)]
pub struct Listener {
    subscription: Subscription,
}

impl Listener {
    pub fn event(&self) -> &str {
        self.subscription.name()
    }

    /// Next payload, or `None` once the listener has been removed.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.subscription.recv().await {
                Ok(event) => return Some(event.payload),
                Err(BusError::Lagged(skipped)) => {
                    warn!(
                        target = "signaling",
                        event = self.subscription.name(),
                        skipped,
                        "listener lagged"
                    );
                }
                Err(BusError::Closed(_)) => return None,
            }
        }
    }
}
