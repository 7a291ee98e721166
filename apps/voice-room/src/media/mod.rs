//! Seam to the media-transport library.
//!
//! The engine never touches ICE, DTLS or SRTP itself. It drives a
//! [`MediaDevice`] that builds [`MediaTransport`]s, and the library calls back
//! into the engine through a [`TransportHandler`] whenever it needs the
//! server: once to connect a transport, once per outbound track to produce.

pub mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Device not loaded")]
    DeviceNotLoaded,
    #[error("device rejected capabilities: {0}")]
    UnsupportedCapabilities(String),
    #[error("transport {0} is closed")]
    TransportClosed(String),
    #[error("{0} is closed")]
    Closed(String),
    #[error("server rejected {operation}: {reason}")]
    Rejected { operation: &'static str, reason: String },
    #[error("microphone unavailable: {0}")]
    Capture(String),
    #[error("media library error: {0}")]
    Library(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("playback blocked until user interaction")]
    AutoplayBlocked,
    #[error("playback failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque codec metadata; the engine only relays it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

impl RtpParameters {
    /// Missing, null, non-object and `{}` all mean "nothing to consume".
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Object(map) => map.is_empty(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// Everything the library needs to build one local transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub id: String,
    pub direction: Direction,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub ice_servers: Vec<RTCIceServer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Server-authoritative description of one inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Cumulative delivery counters as reported by the library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub packets_lost: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportObservation {
    Connection(RTCPeerConnectionState),
    IceConnection(RTCIceConnectionState),
    IceGathering(RTCIceGatheringState),
}

impl TransportObservation {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TransportObservation::Connection(RTCPeerConnectionState::Failed)
                | TransportObservation::IceConnection(RTCIceConnectionState::Failed)
        )
    }
}

impl fmt::Display for TransportObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportObservation::Connection(state) => write!(f, "connection={state}"),
            TransportObservation::IceConnection(state) => write!(f, "ice={state}"),
            TransportObservation::IceGathering(state) => write!(f, "gathering={state}"),
        }
    }
}

/// Callbacks the library invokes on a transport it built.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// First use of the transport; must resolve once the server acknowledged
    /// the DTLS parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError>;

    /// Send transports only; returns the server-assigned producer id.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, MediaError>;

    fn observe(&self, observation: TransportObservation);
}

#[async_trait]
pub trait MediaDevice: Send + Sync {
    async fn load(&self, capabilities: &RtpCapabilities) -> Result<(), MediaError>;

    fn is_loaded(&self) -> bool;

    /// Local capabilities, sent with every consume request.
    fn rtp_capabilities(&self) -> Result<RtpCapabilities, MediaError>;

    fn create_send_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    fn create_recv_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    fn direction(&self) -> Direction;

    async fn produce(&self, track: MediaTrack) -> Result<Arc<dyn Producer>, MediaError>;

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, MediaError>;

    async fn stats(&self) -> Result<DeliveryStats, MediaError>;

    /// Closes the transport and everything produced or consumed on it.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the transport is closed.
    async fn closed(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn close(&self);

    fn is_closed(&self) -> bool;

    async fn closed(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> MediaTrack;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<(), MediaError>;

    async fn stats(&self) -> Result<DeliveryStats, MediaError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates playback sinks, one per logical consumer slot.
pub trait AudioOutput: Send + Sync {
    fn create_sink(&self, slot: &str) -> Arc<dyn AudioSink>;
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Replaces the track being rendered; `None` detaches.
    fn set_source(&self, track: Option<MediaTrack>);

    fn source(&self) -> Option<MediaTrack>;

    async fn play(&self) -> Result<(), PlaybackError>;

    fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;

    fn stop(&self);
}

/// A live local capture; stopping it releases the device.
pub trait LocalStream: Send + Sync {
    fn audio_track(&self) -> Option<MediaTrack>;

    fn stop(&self);

    fn is_active(&self) -> bool;
}

#[async_trait]
pub trait MicrophoneCapture: Send + Sync {
    async fn capture(&self) -> Result<Arc<dyn LocalStream>, MediaError>;
}

/// Fallback relay configuration used when the server sends none.
pub fn default_ice_servers(stun_url: &str) -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![stun_url.to_string()],
        ..Default::default()
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_rtp_parameters() {
        assert!(RtpParameters(Value::Null).is_empty());
        assert!(RtpParameters(json!({})).is_empty());
        assert!(RtpParameters(json!([])).is_empty());
        assert!(!RtpParameters(json!({"codecs": []})).is_empty());
    }

    #[test]
    fn failure_observations() {
        assert!(TransportObservation::Connection(RTCPeerConnectionState::Failed).is_failure());
        assert!(!TransportObservation::IceGathering(RTCIceGatheringState::Complete).is_failure());
    }

    #[test]
    fn default_relay_is_stun_only() {
        let servers = default_ice_servers(DEFAULT_STUN_URL);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert!(servers[0].username.is_empty());
    }
}
