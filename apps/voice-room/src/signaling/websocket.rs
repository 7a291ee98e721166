use std::sync::Weak;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::wire::{self, EnginePacket, SocketPacket};
use super::{
    EVENT_CONNECT, EVENT_DISCONNECT, OutboundQueue, OutboundSignal, SignalingClient,
    SignalingError,
};

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl SignalingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    fn connect_packet(&self) -> SocketPacket {
        SocketPacket::Connect(self.auth_token.as_ref().map(|token| json!({ "token": token })))
    }
}

/// `http(s)://host[:port][/path]` → `ws(s)://host[:port]/socket.io/?EIO=4&transport=websocket`.
pub fn derive_websocket_url(base: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(base)
        .map_err(|err| SignalingError::Transport(format!("invalid signaling url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::Transport(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Transport(format!("cannot use scheme {scheme} for {base}")))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/socket.io/");
    }
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

enum SessionEnd {
    /// The owning client is gone or the outbound queue closed.
    Shutdown,
    /// Handshake rejected or server-initiated disconnect; no reconnection.
    Rejected,
    Dropped { was_connected: bool },
}

pub(super) fn spawn(
    client: Weak<SignalingClient>,
    config: SignalingConfig,
    mut queue: OutboundQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            let end = run_session(&client, &config, &mut queue).await;
            if let Some(client) = client.upgrade() {
                if client.set_connected(false) {
                    client.dispatch(EVENT_DISCONNECT, Value::String("transport close".into()));
                }
            }
            match end {
                SessionEnd::Shutdown | SessionEnd::Rejected => return,
                SessionEnd::Dropped { was_connected } => {
                    if was_connected {
                        failures = 0;
                    }
                    failures += 1;
                    if failures > config.reconnect_attempts {
                        warn!(
                            target = "signaling",
                            attempts = config.reconnect_attempts,
                            "reconnect_failed"
                        );
                        return;
                    }
                    info!(target = "signaling", attempt = failures, "reconnect_attempt");
                    tokio::time::sleep(config.reconnect_delay).await;
                }
            }
        }
    })
}

async fn run_session(
    client: &Weak<SignalingClient>,
    config: &SignalingConfig,
    queue: &mut OutboundQueue,
) -> SessionEnd {
    let url = match derive_websocket_url(&config.url) {
        Ok(url) => url,
        Err(err) => {
            if let Some(client) = client.upgrade() {
                client.handle_connect_error(&err.to_string());
            }
            return SessionEnd::Rejected;
        }
    };
    let (stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            if let Some(client) = client.upgrade() {
                client.handle_connect_error(&format!("websocket error: {err}"));
            }
            return SessionEnd::Dropped {
                was_connected: false,
            };
        }
    };
    debug!(target = "signaling", url = %url, "websocket open");
    let (mut write, mut read) = stream.split();
    let mut connected = false;

    loop {
        tokio::select! {
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(target = "signaling", "websocket closed by server");
                        return SessionEnd::Dropped { was_connected: connected };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "signaling", "websocket closed: {err}");
                            }
                            _ => warn!(target = "signaling", "websocket error: {err}"),
                        }
                        return SessionEnd::Dropped { was_connected: connected };
                    }
                };
                trace!(target = "signaling", len = text.len(), "ws_in");
                let packet = match wire::decode(&text) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!(target = "signaling", error = %err, "skipping undecodable frame");
                        continue;
                    }
                };
                let Some(client) = client.upgrade() else {
                    return SessionEnd::Shutdown;
                };
                let reply = match packet {
                    EnginePacket::Open(handshake) => {
                        debug!(target = "signaling", sid = %handshake.sid, "engine open");
                        Some(EnginePacket::Message(config.connect_packet()))
                    }
                    EnginePacket::Ping(data) => Some(EnginePacket::Pong(data)),
                    EnginePacket::Message(SocketPacket::Connect(data)) => {
                        connected = true;
                        client.set_connected(true);
                        info!(target = "signaling", "connected");
                        client.dispatch(EVENT_CONNECT, data.unwrap_or(Value::Null));
                        None
                    }
                    EnginePacket::Message(SocketPacket::Event { name, payload, .. }) => {
                        client.dispatch(&name, payload);
                        None
                    }
                    EnginePacket::Message(SocketPacket::ConnectError(data)) => {
                        client.handle_connect_error(&SocketPacket::connect_error_reason(&data));
                        return SessionEnd::Rejected;
                    }
                    EnginePacket::Message(SocketPacket::Disconnect) | EnginePacket::Close => {
                        info!(target = "signaling", "server closed the session");
                        return SessionEnd::Rejected;
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    if send_packet(&mut write, &reply).await.is_err() {
                        return SessionEnd::Dropped { was_connected: connected };
                    }
                }
            }
            outbound = queue.recv(), if connected => {
                let Some(OutboundSignal { event, payload }) = outbound else {
                    return SessionEnd::Shutdown;
                };
                let packet = EnginePacket::Message(SocketPacket::event(event, payload));
                if send_packet(&mut write, &packet).await.is_err() {
                    return SessionEnd::Dropped { was_connected: connected };
                }
            }
        }
    }
}

async fn send_packet<S>(write: &mut S, packet: &EnginePacket) -> Result<(), SignalingError>
where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let frame = wire::encode(packet)?;
    trace!(target = "signaling", len = frame.len(), "ws_out");
    write.send(Message::Text(frame)).await.map_err(|err| {
        warn!(target = "signaling", error = %err, "websocket send failed");
        SignalingError::Transport(err.to_string())
    })
}
