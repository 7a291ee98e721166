#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use voice_room_core::media::mock::{MockAudioOutput, MockDevice, MockMicrophone, MockTransport};
use voice_room_core::media::Direction;
use voice_room_core::room::{MediaStack, RoomSession, SessionConfig};
use voice_room_core::signaling::{AppEvents, OutboundQueue, OutboundSignal, SignalingClient};

pub const ROOM: &str = "room-1";

pub type Reply = (String, Value);
type Responder = Box<dyn FnMut(&Value) -> Vec<Reply> + Send>;

/// What a `transport-created` reply echoes back from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Nothing,
    RequestId,
    Direction,
}

struct ServerState {
    echo: Echo,
    reverse_transport_replies: bool,
    held: Vec<Reply>,
    consumers_created: usize,
    responders: HashMap<String, Responder>,
}

/// Scripted room server on the far side of a detached signaling client.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    log: Arc<Mutex<Vec<OutboundSignal>>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                echo: Echo::Nothing,
                reverse_transport_replies: false,
                held: Vec::new(),
                consumers_created: 0,
                responders: HashMap::new(),
            })),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn echo(self, echo: Echo) -> Self {
        self.state.lock().echo = echo;
        self
    }

    /// Holds the first `transport-created` reply until the second request
    /// arrives, then answers both newest first.
    pub fn reverse_transport_replies(self) -> Self {
        self.state.lock().reverse_transport_replies = true;
        self
    }

    /// Replaces the default reply for `event`.
    pub fn respond_with<F>(self, event: &str, responder: F) -> Self
    where
        F: FnMut(&Value) -> Vec<Reply> + Send + 'static,
    {
        self.state
            .lock()
            .responders
            .insert(event.to_string(), Box::new(responder));
        self
    }

    pub fn emitted(&self, event: &str) -> Vec<Value> {
        self.log
            .lock()
            .iter()
            .filter(|signal| signal.event == event)
            .map(|signal| signal.payload.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.emitted(event).len()
    }

    fn serve(&self, client: &Arc<SignalingClient>, mut queue: OutboundQueue) {
        let weak = Arc::downgrade(client);
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = queue.recv().await {
                server.log.lock().push(signal.clone());
                let replies = server.reply_to(&signal);
                let Some(client) = weak.upgrade() else { break };
                for (event, payload) in replies {
                    client.dispatch(&event, payload);
                }
            }
        });
    }

    fn reply_to(&self, signal: &OutboundSignal) -> Vec<Reply> {
        let mut state = self.state.lock();
        if let Some(responder) = state.responders.get_mut(&signal.event) {
            return responder(&signal.payload);
        }
        let payload = &signal.payload;
        match signal.event.as_str() {
            "get-router-rtp-capabilities" => vec![(
                "router-rtp-capabilities".into(),
                json!({ "capabilities": { "codecs": [] } }),
            )],
            "create-transport" => {
                let direction = payload["direction"].as_str().unwrap_or("send");
                let mut reply = transport_params(&format!("{direction}-transport"));
                match state.echo {
                    Echo::Nothing => {}
                    Echo::RequestId => reply["requestId"] = payload["requestId"].clone(),
                    Echo::Direction => reply["direction"] = json!(direction),
                }
                let reply = ("transport-created".to_string(), reply);
                if !state.reverse_transport_replies {
                    return vec![reply];
                }
                state.held.push(reply);
                if state.held.len() < 2 {
                    return Vec::new();
                }
                let mut held = std::mem::take(&mut state.held);
                held.reverse();
                held
            }
            "connect-transport" => vec![(
                "transport-connected".into(),
                json!({ "transportId": payload["transportId"] }),
            )],
            "produce" => vec![(
                "produced".into(),
                json!({ "producerId": "producer-1", "transportId": payload["transportId"] }),
            )],
            "consume" => {
                state.consumers_created += 1;
                vec![(
                    "consumed".into(),
                    consumed(
                        &format!("consumer-{}", state.consumers_created),
                        payload["producerId"].as_str().unwrap_or_default(),
                    ),
                )]
            }
            _ => Vec::new(),
        }
    }
}

pub fn transport_params(id: &str) -> Value {
    json!({
        "id": id,
        "iceParameters": { "usernameFragment": "frag", "password": "secret" },
        "iceCandidates": [],
        "dtlsParameters": { "role": "auto", "fingerprints": [] },
    })
}

pub fn consumed(consumer_id: &str, producer_id: &str) -> Value {
    json!({
        "consumerId": consumer_id,
        "producerId": producer_id,
        "kind": "audio",
        "rtpParameters": {
            "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }],
            "encodings": [{ "ssrc": 2222 }],
        },
    })
}

/// A room client wired to mock media and a [`FakeServer`].
pub struct Harness {
    pub client: Arc<SignalingClient>,
    pub app_events: AppEvents,
    pub device: Arc<MockDevice>,
    pub output: Arc<MockAudioOutput>,
    pub microphone: Arc<MockMicrophone>,
    pub server: FakeServer,
}

impl Harness {
    pub fn start(server: FakeServer) -> Self {
        let app_events = AppEvents::new();
        let (client, queue) = SignalingClient::detached(app_events.clone());
        server.serve(&client, queue);
        Self {
            client,
            app_events,
            device: MockDevice::new(),
            output: MockAudioOutput::new(),
            microphone: MockMicrophone::new(),
            server,
        }
    }

    pub fn media(&self) -> MediaStack {
        MediaStack {
            device: self.device.clone(),
            output: self.output.clone(),
            microphone: self.microphone.clone(),
        }
    }

    pub fn room(&self) -> RoomSession {
        RoomSession::new(
            ROOM,
            self.client.clone(),
            self.media(),
            SessionConfig::default(),
        )
    }

    pub fn mock_transport(&self, direction: Direction) -> Arc<MockTransport> {
        self.device
            .transport(direction)
            .expect("transport created for direction")
    }
}

/// Polls `condition` every 10ms; the test deadline bounds the wait.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
