//! Transport negotiation.
//!
//! Each direction runs `idle → awaiting_capabilities →
//! awaiting_transport_params → constructed → connect_pending → connected`,
//! or ends in `failed`. Capabilities are fetched once per room and shared by
//! both directions. The library's `connect`/`produce` callbacks are bridged
//! back onto the correlator by [`NegotiationHandler`], the only place the
//! callback style appears.

pub mod protocol;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::media::{
    DeliveryStats, Direction, DtlsParameters, MediaDevice, MediaError, MediaKind, MediaTransport,
    RtpCapabilities, RtpParameters, TransportHandler, TransportObservation,
};
use crate::signaling::{ReplyMatcher, SignalingClient, SignalingError};
use protocol::{
    CONNECT_TRANSPORT, CREATE_TRANSPORT, GET_ROUTER_RTP_CAPABILITIES, PRODUCE, PRODUCED,
    ROUTER_RTP_CAPABILITIES, TRANSPORT_CONNECTED, TRANSPORT_CREATED, TRANSPORT_ECHO_KEYS,
    TRANSPORT_ID_KEYS, TransportCreated,
};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("invalid {event} reply: {reason}")]
    InvalidReply { event: &'static str, reason: String },
    #[error("invalid consumer payload: {0}")]
    InvalidConsumerPayload(String),
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingCapabilities,
    AwaitingTransportParams,
    Constructed,
    ConnectPending,
    Connected,
    Failed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingCapabilities => "awaiting_capabilities",
            NegotiationState::AwaitingTransportParams => "awaiting_transport_params",
            NegotiationState::Constructed => "constructed",
            NegotiationState::ConnectPending => "connect_pending",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One direction's handshake, owned by the [`Negotiator`] that started it.
#[derive(Debug, Clone)]
pub struct TransportNegotiation {
    pub direction: Direction,
    pub request_id: String,
    pub transport_id: Option<String>,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
    pub relay_servers: Vec<RTCIceServer>,
    pub state: NegotiationState,
    pub connection_state: Option<RTCPeerConnectionState>,
    pub ice_connection_state: Option<RTCIceConnectionState>,
    pub ice_gathering_state: Option<RTCIceGatheringState>,
    /// Stats captured once, when the transport first reported failure.
    pub failure_snapshot: Option<DeliveryStats>,
}

impl TransportNegotiation {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            request_id: Uuid::new_v4().to_string(),
            transport_id: None,
            ice_parameters: serde_json::Value::Null,
            ice_candidates: serde_json::Value::Null,
            dtls_parameters: serde_json::Value::Null,
            relay_servers: Vec::new(),
            state: NegotiationState::Idle,
            connection_state: None,
            ice_connection_state: None,
            ice_gathering_state: None,
            failure_snapshot: None,
        }
    }
}

type SharedRecord = Arc<Mutex<TransportNegotiation>>;

fn set_state(record: &SharedRecord, state: NegotiationState) {
    let mut record = record.lock();
    debug!(
        direction = %record.direction,
        from = %record.state,
        to = %state,
        "negotiation state"
    );
    record.state = state;
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub match_timeout: Duration,
    pub fallback_stun: String,
}

/// Drives both directions' handshakes for one room.
pub struct Negotiator {
    signaling: Arc<SignalingClient>,
    device: Arc<dyn MediaDevice>,
    room_id: String,
    config: NegotiatorConfig,
    capabilities: OnceCell<RtpCapabilities>,
    records: Mutex<HashMap<Direction, SharedRecord>>,
}

impl Negotiator {
    pub fn new(
        signaling: Arc<SignalingClient>,
        device: Arc<dyn MediaDevice>,
        room_id: impl Into<String>,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            signaling,
            device,
            room_id: room_id.into(),
            config,
            capabilities: OnceCell::new(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Router capabilities, requested and loaded into the device at most once.
    pub async fn load_capabilities(&self) -> Result<RtpCapabilities, NegotiationError> {
        self.capabilities
            .get_or_try_init(|| async {
                let pending = self
                    .signaling
                    .once(ROUTER_RTP_CAPABILITIES)
                    .with_timeout(self.config.match_timeout);
                let reply = self
                    .signaling
                    .request(
                        GET_ROUTER_RTP_CAPABILITIES,
                        json!({ "roomId": self.room_id }),
                        pending,
                    )
                    .await?;
                let capabilities = protocol::parse_capabilities(&reply)?;
                self.device.load(&capabilities).await?;
                info!(room_id = %self.room_id, "device loaded");
                Ok::<_, NegotiationError>(capabilities)
            })
            .await
            .cloned()
    }

    /// The device's own capabilities, sent with every consume request.
    pub fn local_capabilities(&self) -> Result<RtpCapabilities, MediaError> {
        self.device.rtp_capabilities()
    }

    /// Runs one direction's handshake up to a constructed transport. The
    /// transport connects lazily, on its first produce or consume.
    pub async fn negotiate(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn MediaTransport>, NegotiationError> {
        let record: SharedRecord = Arc::new(Mutex::new(TransportNegotiation::new(direction)));
        self.records.lock().insert(direction, record.clone());
        match self.run(direction, &record).await {
            Ok(transport) => Ok(transport),
            Err(err) => {
                set_state(&record, NegotiationState::Failed);
                warn!(
                    room_id = %self.room_id,
                    direction = %direction,
                    error = %err,
                    "transport negotiation failed"
                );
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        direction: Direction,
        record: &SharedRecord,
    ) -> Result<Arc<dyn MediaTransport>, NegotiationError> {
        set_state(record, NegotiationState::AwaitingCapabilities);
        self.load_capabilities().await?;

        set_state(record, NegotiationState::AwaitingTransportParams);
        let request_id = record.lock().request_id.clone();
        let matcher = ReplyMatcher::new()
            .request_id(request_id.clone())
            .room_id(self.room_id.clone())
            .direction(direction.as_str());
        let pending = self
            .signaling
            .once_match(TRANSPORT_CREATED, matcher, self.config.match_timeout);
        let reply = self
            .signaling
            .request(
                CREATE_TRANSPORT,
                json!({
                    "roomId": self.room_id,
                    "direction": direction.as_str(),
                    "requestId": request_id,
                }),
                pending,
            )
            .await?;
        let options = TransportCreated::parse(&reply)?
            .into_options(direction, &self.config.fallback_stun);
        {
            let mut record = record.lock();
            record.transport_id = Some(options.id.clone());
            record.ice_parameters = options.ice_parameters.clone();
            record.ice_candidates = options.ice_candidates.clone();
            record.dtls_parameters = options.dtls_parameters.clone();
            record.relay_servers = options.ice_servers.clone();
        }
        info!(
            room_id = %self.room_id,
            direction = %direction,
            transport_id = %options.id,
            relays = options.ice_servers.len(),
            "transport parameters received"
        );

        let handler = Arc::new(NegotiationHandler {
            signaling: self.signaling.clone(),
            room_id: self.room_id.clone(),
            transport_id: options.id.clone(),
            direction,
            match_timeout: self.config.match_timeout,
            record: record.clone(),
            transport: OnceLock::new(),
        });
        let transport = match direction {
            Direction::Send => self.device.create_send_transport(options, handler.clone())?,
            Direction::Recv => self.device.create_recv_transport(options, handler.clone())?,
        };
        handler.bind(&transport);
        set_state(record, NegotiationState::Constructed);
        Ok(transport)
    }

    /// Snapshot of a direction's latest negotiation record.
    pub fn record(&self, direction: Direction) -> Option<TransportNegotiation> {
        self.records
            .lock()
            .get(&direction)
            .map(|record| record.lock().clone())
    }
}

/// Bridges the library's callbacks onto signaling round-trips.
pub struct NegotiationHandler {
    signaling: Arc<SignalingClient>,
    room_id: String,
    transport_id: String,
    direction: Direction,
    match_timeout: Duration,
    record: SharedRecord,
    transport: OnceLock<Weak<dyn MediaTransport>>,
}

impl NegotiationHandler {
    fn bind(&self, transport: &Arc<dyn MediaTransport>) {
        let _ = self.transport.set(Arc::downgrade(transport));
    }

    fn capture_failure_snapshot(&self) {
        let Some(transport) = self.transport.get().and_then(Weak::upgrade) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let record = self.record.clone();
        let transport_id = self.transport_id.clone();
        runtime.spawn(async move {
            match transport.stats().await {
                Ok(stats) => {
                    warn!(transport_id = %transport_id, ?stats, "transport failed; stats snapshot");
                    record.lock().failure_snapshot = Some(stats);
                }
                Err(err) => {
                    warn!(transport_id = %transport_id, error = %err, "transport failed; stats unavailable");
                }
            }
        });
    }
}

#[async_trait]
impl TransportHandler for NegotiationHandler {
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError> {
        set_state(&self.record, NegotiationState::ConnectPending);
        let matcher = ReplyMatcher::new()
            .room_id(self.room_id.clone())
            .identity(TRANSPORT_ID_KEYS, self.transport_id.clone())
            .direction(self.direction.as_str());
        let pending =
            self.signaling
                .once_match(TRANSPORT_CONNECTED, matcher, self.match_timeout);
        let result = self
            .signaling
            .request(
                CONNECT_TRANSPORT,
                json!({
                    "transportId": self.transport_id,
                    "dtlsParameters": dtls_parameters.0,
                    "roomId": self.room_id,
                }),
                pending,
            )
            .await
            .and_then(|ack| protocol::reject_negative(TRANSPORT_CONNECTED, &ack));
        match result {
            Ok(()) => {
                set_state(&self.record, NegotiationState::Connected);
                info!(
                    direction = %self.direction,
                    transport_id = %self.transport_id,
                    "transport connected"
                );
                Ok(())
            }
            Err(err) => {
                set_state(&self.record, NegotiationState::Failed);
                warn!(
                    direction = %self.direction,
                    transport_id = %self.transport_id,
                    error = %err,
                    "transport connect failed"
                );
                Err(MediaError::Rejected {
                    operation: CONNECT_TRANSPORT,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, MediaError> {
        if self.direction != Direction::Send {
            return Err(MediaError::Library(format!(
                "produce requested on {} transport {}",
                self.direction, self.transport_id
            )));
        }
        let matcher = ReplyMatcher::new()
            .room_id(self.room_id.clone())
            .identity(TRANSPORT_ECHO_KEYS, self.transport_id.clone());
        let pending = self
            .signaling
            .once_match(PRODUCED, matcher, self.match_timeout);
        let reply = self
            .signaling
            .request(
                PRODUCE,
                json!({
                    "transportId": self.transport_id,
                    "kind": kind.as_str(),
                    "rtpParameters": rtp_parameters.0,
                    "roomId": self.room_id,
                }),
                pending,
            )
            .await
            .map_err(NegotiationError::from)
            .and_then(|reply| protocol::parse_produced(&reply));
        match reply {
            Ok(producer_id) => {
                info!(
                    transport_id = %self.transport_id,
                    producer_id = %producer_id,
                    kind = %kind,
                    "producer created"
                );
                Ok(producer_id)
            }
            Err(err) => {
                warn!(transport_id = %self.transport_id, error = %err, "produce failed");
                Err(MediaError::Rejected {
                    operation: PRODUCE,
                    reason: err.to_string(),
                })
            }
        }
    }

    fn observe(&self, observation: TransportObservation) {
        debug!(
            direction = %self.direction,
            transport_id = %self.transport_id,
            %observation,
            "transport observation"
        );
        let first_failure = {
            let mut record = self.record.lock();
            match observation {
                TransportObservation::Connection(state) => record.connection_state = Some(state),
                TransportObservation::IceConnection(state) => {
                    record.ice_connection_state = Some(state)
                }
                TransportObservation::IceGathering(state) => {
                    record.ice_gathering_state = Some(state)
                }
            }
            let first = observation.is_failure() && record.state != NegotiationState::Failed;
            if observation.is_failure() {
                record.state = NegotiationState::Failed;
            }
            first
        };
        if first_failure {
            self.capture_failure_snapshot();
        }
    }
}
