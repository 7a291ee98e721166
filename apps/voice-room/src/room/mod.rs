//! Room session.
//!
//! [`RoomSession`] owns everything scoped to one joined room: both
//! transports, the producer, every consumer slot, and the tasks that watch
//! them. Leaving (or dropping the session) closes it all through one close
//! signal and removes every room-scoped signaling listener.

pub mod health;
pub mod lifecycle;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::{
    AudioOutput, DEFAULT_STUN_URL, Direction, MediaDevice, MediaError, MediaTransport,
    MicrophoneCapture, RtpCapabilities,
};
use crate::negotiation::protocol::{
    APPROVE_SPEAK, CONSUMER_ZERO_BYTES, JOIN_ROOM, LEAVE_ROOM, NEW_PRODUCER, PRODUCER_CHECK_ROUTE,
    PRODUCER_ID_KEYS, REJECT_SPEAK, REQUEST_SPEAK, ROOM_EVENTS, SPEAK_REQUEST,
    SPEAK_REQUEST_APPROVED, SPEAK_REQUEST_CANCELLED, SPEAK_REQUEST_REJECTED, USER_JOINED,
    USER_LEFT,
};
use crate::negotiation::{NegotiationError, Negotiator, NegotiatorConfig, TransportNegotiation};
use crate::signaling::app_events::{
    AUDIO_PRODUCER_UNHEARD, SOCKET_INSUFFICIENT_FUNDS, mentions_insufficient_funds,
};
use crate::signaling::correlator::{DEFAULT_MATCH_TIMEOUT, first_present};
use crate::signaling::{AppEvents, Listener, SignalingClient, SignalingError};
use crate::telemetry::timestamp_millis;
use health::{HealthConfig, HealthContext};
use lifecycle::{
    ConsumedAudio, ConsumerSlot, ProducingSession, attach_and_play, materialize,
    request_consumer,
};

const ZERO_BYTES_PRODUCER_KEYS: &[&str] = &["producerId", "producer_id"];

#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("room transports are not initialized")]
    NotInitialized,
    #[error("capture produced no audio track")]
    NoAudioTrack,
    #[error("room {0} was left")]
    Left(String),
}

impl RoomError {
    /// Actionable text for the end user; never raw protocol detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            RoomError::InsufficientFunds(_) => "Insufficient balance. Please recharge to continue.",
            RoomError::NoAudioTrack | RoomError::Media(MediaError::Capture(_)) => {
                "Microphone access is needed to speak. Check your device permissions."
            }
            RoomError::Signaling(SignalingError::Timeout { .. })
            | RoomError::Negotiation(NegotiationError::Signaling(SignalingError::Timeout {
                ..
            })) => "The room server is not responding. Please try again.",
            RoomError::NotInitialized => "Audio is still connecting. Please wait a moment.",
            RoomError::Left(_) => "You have left this room.",
            _ => "Could not set up room audio. Please try again.",
        }
    }

    fn classify(self, app_events: &AppEvents) -> Self {
        if matches!(self, RoomError::InsufficientFunds(_)) {
            return self;
        }
        let message = self.to_string();
        if mentions_insufficient_funds(&message) {
            app_events.publish(SOCKET_INSUFFICIENT_FUNDS, json!({ "reason": message }));
            RoomError::InsufficientFunds(message)
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub match_timeout: Duration,
    pub fallback_stun: String,
    pub health: HealthConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            match_timeout: DEFAULT_MATCH_TIMEOUT,
            fallback_stun: DEFAULT_STUN_URL.to_string(),
            health: HealthConfig::default(),
        }
    }
}

/// The media library collaborators a room runs on.
#[derive(Clone)]
pub struct MediaStack {
    pub device: Arc<dyn MediaDevice>,
    pub output: Arc<dyn AudioOutput>,
    pub microphone: Arc<dyn MicrophoneCapture>,
}

#[derive(Clone)]
pub struct RoomTransports {
    pub send: Arc<dyn MediaTransport>,
    pub recv: Arc<dyn MediaTransport>,
}

impl RoomTransports {
    fn close(&self) {
        self.send.close();
        self.recv.close();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeakDecision {
    Approved(Value),
    Rejected(Value),
}

/// A listener asking the moderator for the floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakRequest {
    pub id: String,
    pub user_id: String,
    pub display_name: Option<String>,
}

impl SpeakRequest {
    pub fn from_payload(payload: &Value) -> Self {
        let user_id = first_present(payload, &["userId", "user_id"]).unwrap_or_default();
        let id = first_present(payload, &["requestId", "id"])
            .unwrap_or_else(|| format!("{user_id}-{}", timestamp_millis()));
        Self {
            id,
            user_id,
            display_name: first_present(payload, &["displayName", "display_name"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationEvent {
    Requested(SpeakRequest),
    Cancelled {
        request_id: Option<String>,
        user_id: Option<String>,
    },
}

/// Incoming speak requests and cancellations, for room moderators.
pub struct ModerationFeed {
    requests: Listener,
    cancellations: Listener,
}

impl ModerationFeed {
    /// Next event, or `None` once the room's listeners are removed.
    pub async fn next(&mut self) -> Option<ModerationEvent> {
        tokio::select! {
            payload = self.requests.recv() => {
                payload.map(|payload| ModerationEvent::Requested(SpeakRequest::from_payload(&payload)))
            }
            payload = self.cancellations.recv() => payload.map(|payload| ModerationEvent::Cancelled {
                request_id: first_present(&payload, &["requestId", "id"]),
                user_id: first_present(&payload, &["userId", "user_id"]),
            }),
        }
    }
}

pub struct RoomSession {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    room_id: String,
    signaling: Arc<SignalingClient>,
    media: MediaStack,
    config: SessionConfig,
    negotiator: Negotiator,
    transports: Mutex<Option<RoomTransports>>,
    producing: Mutex<Option<ProducingSession>>,
    consumers: Mutex<Vec<Arc<ConsumerSlot>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    presence: Arc<AtomicU32>,
    joined: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl RoomSession {
    pub fn new(
        room_id: impl Into<String>,
        signaling: Arc<SignalingClient>,
        media: MediaStack,
        config: SessionConfig,
    ) -> Self {
        let room_id = room_id.into();
        let negotiator = Negotiator::new(
            signaling.clone(),
            media.device.clone(),
            room_id.clone(),
            NegotiatorConfig {
                match_timeout: config.match_timeout,
                fallback_stun: config.fallback_stun.clone(),
            },
        );
        let (close_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(RoomInner {
                room_id,
                signaling,
                media,
                config,
                negotiator,
                transports: Mutex::new(None),
                producing: Mutex::new(None),
                consumers: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                presence: Arc::new(AtomicU32::new(0)),
                joined: AtomicBool::new(false),
                close_tx,
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.inner.signaling
    }

    pub fn is_joined(&self) -> bool {
        self.inner.joined.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Listener count as tracked from `user-joined` / `user-left`.
    pub fn presence(&self) -> u32 {
        self.inner.presence.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Option<RoomTransports> {
        self.inner.transports.lock().clone()
    }

    pub fn producing(&self) -> Option<ProducingSession> {
        self.inner.producing.lock().clone()
    }

    pub fn consumers(&self) -> Vec<Arc<ConsumerSlot>> {
        self.inner.consumers.lock().clone()
    }

    pub fn negotiation_record(&self, direction: Direction) -> Option<TransportNegotiation> {
        self.inner.negotiator.record(direction)
    }

    /// Device capabilities to pass to [`RoomSession::consume_producer`].
    pub fn rtp_capabilities(&self) -> Result<RtpCapabilities, RoomError> {
        Ok(self.inner.negotiator.local_capabilities()?)
    }

    /// Background tasks (listeners, health monitors) still running.
    pub fn active_tasks(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    pub fn join(&self) -> Result<(), RoomError> {
        self.inner.join()
    }

    pub async fn initialize_room(&self) -> Result<RoomTransports, RoomError> {
        self.inner.initialize_room().await
    }

    pub async fn start_producing(
        &self,
        send: &Arc<dyn MediaTransport>,
    ) -> Result<ProducingSession, RoomError> {
        self.inner.start_producing(send).await
    }

    /// Returns `false` when nothing was being produced.
    pub fn stop_producing(&self) -> bool {
        self.inner.stop_producing()
    }

    /// `Ok(None)` when the server had nothing to consume yet.
    pub async fn consume_producer(
        &self,
        recv: &Arc<dyn MediaTransport>,
        producer_id: &str,
        room_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Option<ConsumedAudio>, RoomError> {
        self.inner
            .consume_producer(recv, producer_id, room_id, rtp_capabilities)
            .await
    }

    pub fn listen_for_producers(&self) -> Result<(), RoomError> {
        self.inner.listen_for_producers()
    }

    pub async fn request_to_speak(&self) -> Result<SpeakDecision, RoomError> {
        self.inner.request_to_speak().await
    }

    pub fn speak_requests(&self) -> ModerationFeed {
        ModerationFeed {
            requests: self.inner.signaling.on(SPEAK_REQUEST),
            cancellations: self.inner.signaling.on(SPEAK_REQUEST_CANCELLED),
        }
    }

    pub fn approve_speak(&self, request: &SpeakRequest) -> Result<(), RoomError> {
        self.inner.moderate(APPROVE_SPEAK, request)
    }

    pub fn reject_speak(&self, request: &SpeakRequest) -> Result<(), RoomError> {
        self.inner.moderate(REJECT_SPEAK, request)
    }

    /// Announces departure (if joined) and tears the room down. Safe to call
    /// any number of times.
    pub fn leave(&self) {
        self.inner.leave();
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl RoomInner {
    fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    fn ensure_open(&self) -> Result<(), RoomError> {
        if self.is_closed() {
            Err(RoomError::Left(self.room_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Spawns `work` so that it ends no later than the room.
    fn spawn_scoped<F>(&self, task: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut close_rx = self.close_tx.subscribe();
        let already_closed = *close_rx.borrow();
        if already_closed {
            debug!(room_id = %self.room_id, task, "room closed; task not started");
            return;
        }
        let room_id = self.room_id.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = close_rx.changed() => debug!(room_id = %room_id, task, "task cancelled"),
                _ = work => {}
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn join(&self) -> Result<(), RoomError> {
        self.ensure_open()?;
        if self.joined.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut arrivals = self.signaling.on(USER_JOINED);
        let mut departures = self.signaling.on(USER_LEFT);
        if let Err(err) = self
            .signaling
            .emit(JOIN_ROOM, json!({ "roomId": self.room_id }))
        {
            self.joined.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        info!(room_id = %self.room_id, "joined room");

        let presence = self.presence.clone();
        self.spawn_scoped("presence", async move {
            loop {
                tokio::select! {
                    payload = arrivals.recv() => {
                        if payload.is_none() {
                            break;
                        }
                        presence.fetch_add(1, Ordering::SeqCst);
                    }
                    payload = departures.recv() => {
                        if payload.is_none() {
                            break;
                        }
                        let _ = presence.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                            Some(count.saturating_sub(1))
                        });
                    }
                }
            }
        });
        Ok(())
    }

    async fn initialize_room(&self) -> Result<RoomTransports, RoomError> {
        self.ensure_open()?;
        let existing = self.transports.lock().clone();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        // Sequential: a server that echoes nothing can only be matched in
        // request order.
        let negotiated: Result<RoomTransports, NegotiationError> = async {
            let send = self.negotiator.negotiate(Direction::Send).await?;
            match self.negotiator.negotiate(Direction::Recv).await {
                Ok(recv) => Ok(RoomTransports { send, recv }),
                Err(err) => {
                    send.close();
                    Err(err)
                }
            }
        }
        .await;
        let transports = negotiated
            .map_err(|err| RoomError::from(err).classify(self.signaling.app_events()))?;

        if self.is_closed() {
            transports.close();
            return Err(RoomError::Left(self.room_id.clone()));
        }
        *self.transports.lock() = Some(transports.clone());
        info!(
            room_id = %self.room_id,
            send_transport = transports.send.id(),
            recv_transport = transports.recv.id(),
            "room media initialized"
        );
        Ok(transports)
    }

    async fn start_producing(
        &self,
        send: &Arc<dyn MediaTransport>,
    ) -> Result<ProducingSession, RoomError> {
        self.ensure_open()?;
        let stream = self.media.microphone.capture().await?;
        let Some(track) = stream.audio_track() else {
            stream.stop();
            return Err(RoomError::NoAudioTrack);
        };
        let producer = match send.produce(track).await {
            Ok(producer) => producer,
            Err(err) => {
                stream.stop();
                return Err(RoomError::from(err).classify(self.signaling.app_events()));
            }
        };
        info!(
            room_id = %self.room_id,
            producer_id = producer.id(),
            transport_id = send.id(),
            "audio producer started"
        );

        self.watch_producer(send.clone(), producer.clone());
        let session = ProducingSession { producer, stream };
        let previous = self.producing.lock().replace(session.clone());
        if let Some(previous) = previous {
            previous.producer.close();
            previous.stream.stop();
        }
        Ok(session)
    }

    /// Relays server reports that nobody hears this producer, until the
    /// producer or its transport closes.
    fn watch_producer(
        &self,
        transport: Arc<dyn MediaTransport>,
        producer: Arc<dyn crate::media::Producer>,
    ) {
        let mut reports = self.signaling.on(CONSUMER_ZERO_BYTES);
        let signaling = self.signaling.clone();
        self.spawn_scoped("producer-zero-bytes", async move {
            let producer_id = producer.id().to_string();
            loop {
                tokio::select! {
                    _ = producer.closed() => break,
                    _ = transport.closed() => break,
                    payload = reports.recv() => {
                        let Some(payload) = payload else { break };
                        if first_present(&payload, ZERO_BYTES_PRODUCER_KEYS).as_deref()
                            != Some(producer_id.as_str())
                        {
                            continue;
                        }
                        warn!(producer_id = %producer_id, "a listener receives no audio from this producer");
                        signaling.app_events().publish(
                            AUDIO_PRODUCER_UNHEARD,
                            json!({
                                "producerId": producer_id,
                                "consumerId": payload.get("consumerId").cloned().unwrap_or(Value::Null),
                            }),
                        );
                        let check = json!({
                            "producerId": producer_id,
                            "timestamp": timestamp_millis(),
                        });
                        if let Err(err) = signaling.emit(PRODUCER_CHECK_ROUTE, check) {
                            warn!(producer_id = %producer_id, error = %err, "route check not sent");
                        }
                    }
                }
            }
            debug!(producer_id = %producer_id, "zero-bytes listener retired");
        });
    }

    fn stop_producing(&self) -> bool {
        let active = self.producing.lock().take();
        let Some(session) = active else {
            return false;
        };
        session.producer.close();
        session.stream.stop();
        info!(room_id = %self.room_id, producer_id = session.producer.id(), "audio producer stopped");
        true
    }

    async fn consume_producer(
        &self,
        recv: &Arc<dyn MediaTransport>,
        producer_id: &str,
        room_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Option<ConsumedAudio>, RoomError> {
        self.ensure_open()?;
        let Some(options) = request_consumer(
            &self.signaling,
            recv.as_ref(),
            producer_id,
            room_id,
            rtp_capabilities,
            self.config.match_timeout,
        )
        .await?
        else {
            return Ok(None);
        };
        let consumer = materialize(recv.as_ref(), options).await?;
        if self.is_closed() {
            consumer.close();
            return Err(RoomError::Left(self.room_id.clone()));
        }

        let sink = self.media.output.create_sink(consumer.id());
        let outcome = attach_and_play(sink.as_ref(), consumer.as_ref(), false).await;
        info!(
            room_id,
            producer_id,
            consumer_id = consumer.id(),
            outcome = ?outcome,
            "consumer attached"
        );

        let slot = Arc::new(ConsumerSlot::new(
            room_id,
            recv.clone(),
            rtp_capabilities.clone(),
            sink.clone(),
            consumer.clone(),
        ));
        {
            // Teardown flips the close signal before it drains slots.
            let mut consumers = self.consumers.lock();
            if self.is_closed() {
                drop(consumers);
                slot.close();
                return Err(RoomError::Left(self.room_id.clone()));
            }
            consumers.push(slot.clone());
        }
        let ctx = HealthContext {
            signaling: self.signaling.clone(),
            config: self.config.health,
            match_timeout: self.config.match_timeout,
        };
        self.spawn_scoped("consumer-health", health::supervise(slot.clone(), ctx));
        Ok(Some(ConsumedAudio {
            consumer,
            sink,
            slot,
        }))
    }

    fn listen_for_producers(self: &Arc<Self>) -> Result<(), RoomError> {
        self.ensure_open()?;
        let transports = self
            .transports
            .lock()
            .clone()
            .ok_or(RoomError::NotInitialized)?;
        let rtp_capabilities = self.negotiator.local_capabilities()?;
        let mut announcements = self.signaling.on(NEW_PRODUCER);
        let room = Arc::downgrade(self);
        self.spawn_scoped("new-producer", async move {
            while let Some(payload) = announcements.recv().await {
                let Some(room) = room.upgrade() else { break };
                let Some(producer_id) = first_present(&payload, PRODUCER_ID_KEYS) else {
                    warn!(%payload, "new-producer without a producer id");
                    continue;
                };
                let own = room
                    .producing
                    .lock()
                    .as_ref()
                    .is_some_and(|session| session.producer.id() == producer_id);
                if own {
                    debug!(producer_id = %producer_id, "skipping own producer");
                    continue;
                }
                match room
                    .consume_producer(&transports.recv, &producer_id, &room.room_id, &rtp_capabilities)
                    .await
                {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(producer_id = %producer_id, "nothing to consume yet"),
                    Err(err) => warn!(producer_id = %producer_id, error = %err, "failed to consume producer"),
                }
            }
        });
        Ok(())
    }

    async fn request_to_speak(&self) -> Result<SpeakDecision, RoomError> {
        self.ensure_open()?;
        let mut approved = self.signaling.on(SPEAK_REQUEST_APPROVED);
        let mut rejected = self.signaling.on(SPEAK_REQUEST_REJECTED);
        let mut close_rx = self.close_tx.subscribe();
        self.signaling
            .emit(REQUEST_SPEAK, json!({ "roomId": self.room_id }))?;
        info!(room_id = %self.room_id, "requested to speak");

        let abandoned = |event: &str| {
            RoomError::Signaling(SignalingError::Abandoned {
                event: event.to_string(),
            })
        };
        tokio::select! {
            biased;
            _ = close_rx.changed() => Err(RoomError::Left(self.room_id.clone())),
            payload = approved.recv() => payload
                .map(SpeakDecision::Approved)
                .ok_or_else(|| abandoned(SPEAK_REQUEST_APPROVED)),
            payload = rejected.recv() => payload
                .map(SpeakDecision::Rejected)
                .ok_or_else(|| abandoned(SPEAK_REQUEST_REJECTED)),
        }
    }

    fn moderate(&self, event: &str, request: &SpeakRequest) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.signaling.emit(
            event,
            json!({
                "roomId": self.room_id,
                "requestId": request.id,
                "userId": request.user_id,
            }),
        )?;
        Ok(())
    }

    fn leave(&self) {
        if self.is_closed() {
            return;
        }
        if self.joined.swap(false, Ordering::SeqCst) {
            if let Err(err) = self
                .signaling
                .emit(LEAVE_ROOM, json!({ "roomId": self.room_id }))
            {
                debug!(room_id = %self.room_id, error = %err, "leave-room not sent");
            }
        }
        self.teardown();
    }

    /// Cancels every task, closes all media and removes every room-scoped
    /// listener. Runs at most once.
    fn teardown(&self) {
        if self.close_tx.send_replace(true) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let producing = self.producing.lock().take();
        if let Some(session) = producing {
            session.producer.close();
            session.stream.stop();
        }
        let slots = std::mem::take(&mut *self.consumers.lock());
        for slot in &slots {
            slot.close();
        }
        let transports = self.transports.lock().take();
        if let Some(transports) = transports {
            transports.close();
        }
        for event in ROOM_EVENTS {
            self.signaling.off(event);
        }
        self.joined.store(false, Ordering::SeqCst);
        self.presence.store(0, Ordering::SeqCst);
        info!(room_id = %self.room_id, consumers = slots.len(), "room torn down");
    }
}
