//! In-process media library for tests and local runs.
//!
//! Transports call their [`TransportHandler`] exactly like a real library
//! would: `connect` on first use, `produce` per outbound track. Consumers
//! report scripted byte counters so delivery health can be exercised.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{OnceCell, watch};
use tracing::debug;
use uuid::Uuid;

use super::{
    AudioOutput, AudioSink, Consumer, ConsumerOptions, DeliveryStats, Direction, DtlsParameters,
    LocalStream, MediaDevice, MediaError, MediaKind, MediaTrack, MediaTransport,
    MicrophoneCapture, PlaybackError, Producer, RtpCapabilities, RtpParameters, TransportHandler,
    TransportOptions,
};

/// Bytes each sample adds to a consumer's counter unless scripted otherwise.
pub const DEFAULT_BYTES_PER_SAMPLE: u64 = 1_200;

struct CloseFlag(watch::Sender<bool>);

impl CloseFlag {
    fn new() -> Self {
        Self(watch::channel(false).0)
    }

    /// Returns `true` for the call that actually closed.
    fn close(&self) -> bool {
        !self.0.send_replace(true)
    }

    fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.0.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct ConsumerScript {
    bytes_per_sample: Mutex<VecDeque<u64>>,
    default_bytes: AtomicU64,
    start_paused: AtomicBool,
}

pub struct MockDevice {
    capabilities: Mutex<Option<RtpCapabilities>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    script: Arc<ConsumerScript>,
}

impl Default for MockDevice {
    fn default() -> Self {
        let script = ConsumerScript::default();
        script
            .default_bytes
            .store(DEFAULT_BYTES_PER_SAMPLE, Ordering::SeqCst);
        script.start_paused.store(true, Ordering::SeqCst);
        Self {
            capabilities: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
            script: Arc::new(script),
        }
    }
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Byte rate for consumers created after this call, in creation order.
    pub fn script_consumer_bytes(&self, per_sample: impl IntoIterator<Item = u64>) {
        self.script.bytes_per_sample.lock().extend(per_sample);
    }

    pub fn set_default_consumer_bytes(&self, per_sample: u64) {
        self.script.default_bytes.store(per_sample, Ordering::SeqCst);
    }

    pub fn set_consumers_start_paused(&self, paused: bool) {
        self.script.start_paused.store(paused, Ordering::SeqCst);
    }

    pub fn loaded_capabilities(&self) -> Option<RtpCapabilities> {
        self.capabilities.lock().clone()
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    pub fn transport(&self, direction: Direction) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|transport| transport.direction == direction)
            .cloned()
    }

    fn build(
        &self,
        direction: Direction,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        if !self.is_loaded() {
            return Err(MediaError::DeviceNotLoaded);
        }
        let transport = Arc::new(MockTransport {
            direction,
            options,
            handler,
            connected: OnceCell::new(),
            consume_calls: AtomicUsize::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            script: self.script.clone(),
            closed: CloseFlag::new(),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[async_trait]
impl MediaDevice for MockDevice {
    async fn load(&self, capabilities: &RtpCapabilities) -> Result<(), MediaError> {
        if !capabilities.0.is_object() {
            return Err(MediaError::UnsupportedCapabilities(
                "router capabilities must be an object".into(),
            ));
        }
        *self.capabilities.lock() = Some(capabilities.clone());
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.lock().is_some()
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, MediaError> {
        self.capabilities
            .lock()
            .clone()
            .ok_or(MediaError::DeviceNotLoaded)
    }

    fn create_send_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        self.build(Direction::Send, options, handler)
    }

    fn create_recv_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        self.build(Direction::Recv, options, handler)
    }
}

pub struct MockTransport {
    direction: Direction,
    options: TransportOptions,
    handler: Arc<dyn TransportHandler>,
    connected: OnceCell<()>,
    consume_calls: AtomicUsize,
    producers: Mutex<Vec<Arc<MockProducer>>>,
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
    script: Arc<ConsumerScript>,
    closed: CloseFlag,
}

impl MockTransport {
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn handler(&self) -> Arc<dyn TransportHandler> {
        self.handler.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.initialized()
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    pub fn consumers(&self) -> Vec<Arc<MockConsumer>> {
        self.consumers.lock().clone()
    }

    pub fn producers(&self) -> Vec<Arc<MockProducer>> {
        self.producers.lock().clone()
    }

    async fn ensure_connected(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed(self.options.id.clone()));
        }
        self.connected
            .get_or_try_init(|| async {
                let dtls = DtlsParameters(json!({
                    "role": "client",
                    "fingerprints": [{"algorithm": "sha-256", "value": "00:00"}],
                }));
                self.handler.connect(dtls).await
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> &str {
        &self.options.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn produce(&self, track: MediaTrack) -> Result<Arc<dyn Producer>, MediaError> {
        if self.direction != Direction::Send {
            return Err(MediaError::Library("produce on a recv transport".into()));
        }
        self.ensure_connected().await?;
        let rtp = RtpParameters(json!({
            "codecs": [{"mimeType": format!("{}/opus", track.kind), "clockRate": 48000}],
            "encodings": [{"ssrc": 1111}],
        }));
        let id = self.handler.produce(track.kind, rtp).await?;
        let producer = Arc::new(MockProducer {
            id,
            kind: track.kind,
            closed: CloseFlag::new(),
        });
        self.producers.lock().push(producer.clone());
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, MediaError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        if self.direction != Direction::Recv {
            return Err(MediaError::Library("consume on a send transport".into()));
        }
        self.ensure_connected().await?;
        let bytes_per_sample = self
            .script
            .bytes_per_sample
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.script.default_bytes.load(Ordering::SeqCst));
        let consumer = Arc::new(MockConsumer {
            track: MediaTrack {
                id: format!("track-{}", options.id),
                kind: options.kind,
            },
            options,
            paused: AtomicBool::new(self.script.start_paused.load(Ordering::SeqCst)),
            resume_calls: AtomicUsize::new(0),
            bytes_per_sample,
            samples: AtomicU64::new(0),
            closed: CloseFlag::new(),
        });
        debug!(consumer_id = %consumer.options.id, bytes_per_sample, "mock consumer created");
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    async fn stats(&self) -> Result<DeliveryStats, MediaError> {
        let mut total = DeliveryStats::default();
        for consumer in self.consumers.lock().iter().filter(|c| !c.is_closed()) {
            total.bytes_received += consumer.current_bytes();
        }
        Ok(total)
    }

    fn close(&self) {
        if self.closed.close() {
            for producer in self.producers.lock().iter() {
                producer.close();
            }
            for consumer in self.consumers.lock().iter() {
                consumer.close();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    async fn closed(&self) {
        self.closed.closed().await
    }
}

pub struct MockProducer {
    id: String,
    kind: MediaKind,
    closed: CloseFlag,
}

#[async_trait]
impl Producer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.closed.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    async fn closed(&self) {
        self.closed.closed().await
    }
}

pub struct MockConsumer {
    options: ConsumerOptions,
    track: MediaTrack,
    paused: AtomicBool,
    resume_calls: AtomicUsize,
    bytes_per_sample: u64,
    samples: AtomicU64,
    closed: CloseFlag,
}

impl MockConsumer {
    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Stats reads taken while the consumer was running.
    pub fn samples_taken(&self) -> u64 {
        self.samples.load(Ordering::SeqCst)
    }

    fn current_bytes(&self) -> u64 {
        self.bytes_per_sample * self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for MockConsumer {
    fn id(&self) -> &str {
        &self.options.id
    }

    fn producer_id(&self) -> &str {
        &self.options.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.options.kind
    }

    fn track(&self) -> MediaTrack {
        self.track.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed(format!("consumer {}", self.options.id)));
        }
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<DeliveryStats, MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed(format!("consumer {}", self.options.id)));
        }
        let samples = if self.is_paused() {
            self.samples.load(Ordering::SeqCst)
        } else {
            self.samples.fetch_add(1, Ordering::SeqCst) + 1
        };
        let bytes_received = self.bytes_per_sample * samples;
        Ok(DeliveryStats {
            bytes_received,
            packets_received: bytes_received / 120,
            ..DeliveryStats::default()
        })
    }

    fn close(&self) {
        self.closed.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// Sinks share one autoplay policy: while blocked, unmuted playback fails.
#[derive(Default)]
pub struct MockAudioOutput {
    autoplay_blocked: Arc<AtomicBool>,
    play_delay_ms: Arc<AtomicU64>,
    sinks: Mutex<Vec<Arc<MockAudioSink>>>,
}

impl MockAudioOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn block_autoplay(&self, blocked: bool) {
        self.autoplay_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Makes every `play` take `delay` before it settles.
    pub fn delay_playback(&self, delay: std::time::Duration) {
        self.play_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn sinks(&self) -> Vec<Arc<MockAudioSink>> {
        self.sinks.lock().clone()
    }

    /// Sinks that are currently rendering something.
    pub fn playing_sinks(&self) -> Vec<Arc<MockAudioSink>> {
        self.sinks
            .lock()
            .iter()
            .filter(|sink| sink.is_playing())
            .cloned()
            .collect()
    }
}

impl AudioOutput for MockAudioOutput {
    fn create_sink(&self, slot: &str) -> Arc<dyn AudioSink> {
        let sink = Arc::new(MockAudioSink {
            slot: slot.to_string(),
            autoplay_blocked: self.autoplay_blocked.clone(),
            play_delay_ms: self.play_delay_ms.clone(),
            source: Mutex::new(None),
            muted: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            play_calls: AtomicUsize::new(0),
        });
        self.sinks.lock().push(sink.clone());
        sink
    }
}

pub struct MockAudioSink {
    slot: String,
    autoplay_blocked: Arc<AtomicBool>,
    play_delay_ms: Arc<AtomicU64>,
    source: Mutex<Option<MediaTrack>>,
    muted: AtomicBool,
    playing: AtomicBool,
    play_calls: AtomicUsize,
}

impl MockAudioSink {
    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn play_calls(&self) -> usize {
        self.play_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for MockAudioSink {
    fn set_source(&self, track: Option<MediaTrack>) {
        if track.is_none() {
            self.playing.store(false, Ordering::SeqCst);
        }
        *self.source.lock() = track;
    }

    fn source(&self) -> Option<MediaTrack> {
        self.source.lock().clone()
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        self.play_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.play_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.source.lock().is_none() {
            return Err(PlaybackError::Failed("no source attached".into()));
        }
        if !self.is_muted() && self.autoplay_blocked.load(Ordering::SeqCst) {
            return Err(PlaybackError::AutoplayBlocked);
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
        *self.source.lock() = None;
    }
}

#[derive(Default)]
pub struct MockMicrophone {
    denied: AtomicBool,
    streams: Mutex<Vec<Arc<MockStream>>>,
}

impl MockMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn streams(&self) -> Vec<Arc<MockStream>> {
        self.streams.lock().clone()
    }
}

#[async_trait]
impl MicrophoneCapture for MockMicrophone {
    async fn capture(&self) -> Result<Arc<dyn LocalStream>, MediaError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::Capture("permission denied".into()));
        }
        let stream = Arc::new(MockStream {
            track: MediaTrack {
                id: Uuid::new_v4().to_string(),
                kind: MediaKind::Audio,
            },
            active: AtomicBool::new(true),
        });
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }
}

pub struct MockStream {
    track: MediaTrack,
    active: AtomicBool,
}

impl LocalStream for MockStream {
    fn audio_track(&self) -> Option<MediaTrack> {
        Some(self.track.clone())
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
