//! Producer and consumer lifecycles on negotiated transports.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use super::health::RecoveryState;
use crate::media::{
    AudioSink, Consumer, ConsumerOptions, LocalStream, MediaError, MediaTransport, PlaybackError,
    Producer, RtpCapabilities,
};
use crate::negotiation::protocol::{self, CONSUME, CONSUMED, CONSUMED_PRODUCER_KEYS};
use crate::negotiation::NegotiationError;
use crate::signaling::{ReplyMatcher, SignalingClient};

/// An outbound track and the capture it came from.
#[derive(Clone)]
pub struct ProducingSession {
    pub producer: Arc<dyn Producer>,
    pub stream: Arc<dyn LocalStream>,
}

/// One logical inbound stream. The sink and the recovery record outlive any
/// single consumer object; reconsume swaps the consumer in place.
pub struct ConsumerSlot {
    room_id: String,
    producer_id: String,
    transport: Arc<dyn MediaTransport>,
    rtp_capabilities: RtpCapabilities,
    sink: Arc<dyn AudioSink>,
    consumer: Mutex<Arc<dyn Consumer>>,
    pub(crate) recovery: Mutex<RecoveryState>,
}

impl ConsumerSlot {
    pub(crate) fn new(
        room_id: &str,
        transport: Arc<dyn MediaTransport>,
        rtp_capabilities: RtpCapabilities,
        sink: Arc<dyn AudioSink>,
        consumer: Arc<dyn Consumer>,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            producer_id: consumer.producer_id().to_string(),
            transport,
            rtp_capabilities,
            sink,
            consumer: Mutex::new(consumer),
            recovery: Mutex::new(RecoveryState::default()),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn transport(&self) -> &Arc<dyn MediaTransport> {
        &self.transport
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    /// The consumer currently backing this slot.
    pub fn consumer(&self) -> Arc<dyn Consumer> {
        self.consumer.lock().clone()
    }

    pub fn sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    pub fn recovery(&self) -> RecoveryState {
        self.recovery.lock().clone()
    }

    pub(crate) fn replace_consumer(&self, fresh: Arc<dyn Consumer>) -> Arc<dyn Consumer> {
        std::mem::replace(&mut *self.consumer.lock(), fresh)
    }

    pub(crate) fn close(&self) {
        self.sink.stop();
        self.consumer().close();
    }
}

/// What `consume_producer` hands back to the UI.
#[derive(Clone)]
pub struct ConsumedAudio {
    pub consumer: Arc<dyn Consumer>,
    pub sink: Arc<dyn AudioSink>,
    pub slot: Arc<ConsumerSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Playing,
    /// Autoplay blocked; source attached, starts on the next interaction.
    Primed,
    /// Autoplay blocked; playing muted until the user interacts.
    MutedPendingInteraction,
    Failed,
}

/// Emits `consume` and waits for this producer's `consumed` reply.
pub(crate) async fn request_consumer(
    signaling: &SignalingClient,
    transport: &dyn MediaTransport,
    producer_id: &str,
    room_id: &str,
    rtp_capabilities: &RtpCapabilities,
    match_timeout: Duration,
) -> Result<Option<ConsumerOptions>, NegotiationError> {
    let matcher = ReplyMatcher::new()
        .room_id(room_id)
        .identity(CONSUMED_PRODUCER_KEYS, producer_id);
    let pending = signaling.once_match(CONSUMED, matcher, match_timeout);
    let reply = signaling
        .request(
            CONSUME,
            json!({
                "producerId": producer_id,
                "rtpCapabilities": rtp_capabilities.0,
                "transportId": transport.id(),
                "roomId": room_id,
            }),
            pending,
        )
        .await?;
    protocol::parse_consumed(&reply, producer_id)
}

/// Builds the consumer from the server's parameters and resumes it if the
/// library started it paused; media never flows otherwise.
pub(crate) async fn materialize(
    transport: &dyn MediaTransport,
    options: ConsumerOptions,
) -> Result<Arc<dyn Consumer>, MediaError> {
    let consumer = transport.consume(options).await?;
    if consumer.is_paused() {
        consumer.resume().await?;
        debug!(consumer_id = consumer.id(), "consumer resumed");
    }
    Ok(consumer)
}

/// Attaches `consumer`'s track and starts playback. With `muted_retry`, a
/// blocked autoplay is retried muted instead of being left primed.
pub(crate) async fn attach_and_play(
    sink: &dyn AudioSink,
    consumer: &dyn Consumer,
    muted_retry: bool,
) -> PlaybackOutcome {
    sink.set_source(Some(consumer.track()));
    match sink.play().await {
        Ok(()) => PlaybackOutcome::Playing,
        Err(PlaybackError::AutoplayBlocked) if muted_retry => {
            sink.set_muted(true);
            match sink.play().await {
                Ok(()) => {
                    info!(consumer_id = consumer.id(), "playing muted until user interaction");
                    PlaybackOutcome::MutedPendingInteraction
                }
                Err(err) => {
                    warn!(consumer_id = consumer.id(), error = %err, "muted playback failed");
                    PlaybackOutcome::Failed
                }
            }
        }
        Err(PlaybackError::AutoplayBlocked) => {
            info!(consumer_id = consumer.id(), "autoplay blocked; sink primed");
            PlaybackOutcome::Primed
        }
        Err(err) => {
            warn!(consumer_id = consumer.id(), error = %err, "playback failed");
            PlaybackOutcome::Failed
        }
    }
}
