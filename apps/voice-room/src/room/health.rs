//! Consumer delivery health and bounded reconsume.
//!
//! Every consumer gets one sampling window. A window that delivered no bytes
//! is reported to the server (once per slot, latched) and, while budget
//! remains, triggers a reconsume that swaps a fresh consumer into the same
//! slot and watches it with a new window. After [`MAX_RECONSUME`] attempts
//! the stall is only surfaced locally and windows keep being logged.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::lifecycle::{ConsumerSlot, PlaybackOutcome, attach_and_play, materialize, request_consumer};
use crate::media::Consumer;
use crate::negotiation::NegotiationError;
use crate::negotiation::protocol::{CONSUMED, CONSUMER_ZERO_BYTES};
use crate::signaling::SignalingClient;
use crate::signaling::app_events::{
    AUDIO_DELIVERY_STALLED, AUDIO_MUTED_PENDING_INTERACTION, AUDIO_RECOVERY_EXHAUSTED,
};
use crate::telemetry::timestamp_millis;

pub const MAX_RECONSUME: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub samples: u32,
    pub interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            samples: 10,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconsumeDenied {
    InProgress,
    Exhausted,
}

/// Per-slot recovery bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryState {
    reconsume_in_progress: bool,
    reconsume_attempts: u32,
    zero_bytes_reported: bool,
    exhaustion_reported: bool,
}

impl RecoveryState {
    /// `true` exactly once per slot.
    pub fn latch_zero_bytes_report(&mut self) -> bool {
        !std::mem::replace(&mut self.zero_bytes_reported, true)
    }

    /// Claims the next attempt, returning its 1-based number.
    pub fn try_begin_reconsume(&mut self) -> Result<u32, ReconsumeDenied> {
        if self.reconsume_in_progress {
            return Err(ReconsumeDenied::InProgress);
        }
        if self.reconsume_attempts >= MAX_RECONSUME {
            return Err(ReconsumeDenied::Exhausted);
        }
        self.reconsume_in_progress = true;
        self.reconsume_attempts += 1;
        Ok(self.reconsume_attempts)
    }

    pub fn finish_reconsume(&mut self) {
        self.reconsume_in_progress = false;
    }

    pub(crate) fn latch_exhaustion_report(&mut self) -> bool {
        !std::mem::replace(&mut self.exhaustion_reported, true)
    }

    pub fn attempts(&self) -> u32 {
        self.reconsume_attempts
    }

    pub fn in_progress(&self) -> bool {
        self.reconsume_in_progress
    }

    pub fn zero_bytes_reported(&self) -> bool {
        self.zero_bytes_reported
    }

    pub fn is_exhausted(&self) -> bool {
        self.reconsume_attempts >= MAX_RECONSUME
    }
}

/// What a health task needs besides its slot.
#[derive(Clone)]
pub(crate) struct HealthContext {
    pub signaling: Arc<SignalingClient>,
    pub config: HealthConfig,
    pub match_timeout: Duration,
}

/// Highest cumulative byte count seen over one window, or `None` once the
/// consumer is gone.
async fn sample_window(consumer: &dyn Consumer, config: HealthConfig) -> Option<u64> {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut delivered = 0u64;
    for sample in 1..=config.samples {
        ticker.tick().await;
        if consumer.is_closed() {
            return None;
        }
        match consumer.stats().await {
            Ok(stats) => {
                delivered = delivered.max(stats.bytes_received);
                debug!(
                    consumer_id = consumer.id(),
                    sample,
                    bytes_received = stats.bytes_received,
                    packets_received = stats.packets_received,
                    "delivery sample"
                );
            }
            Err(err) => {
                if consumer.is_closed() {
                    return None;
                }
                warn!(consumer_id = consumer.id(), sample, error = %err, "stats unavailable");
            }
        }
    }
    Some(delivered)
}

enum Recovery {
    Replaced,
    Exhausted,
    Abandoned,
}

/// Watches a slot until it proves healthy or its consumer closes.
pub(crate) async fn supervise(slot: Arc<ConsumerSlot>, ctx: HealthContext) {
    let app_events = ctx.signaling.app_events().clone();
    loop {
        let consumer = slot.consumer();
        let Some(delivered) = sample_window(consumer.as_ref(), ctx.config).await else {
            debug!(consumer_id = consumer.id(), "consumer closed; health window abandoned");
            return;
        };
        if delivered > 0 {
            debug!(consumer_id = consumer.id(), delivered, "consumer healthy");
            return;
        }

        let attempts = slot.recovery.lock().attempts();
        warn!(
            consumer_id = consumer.id(),
            producer_id = slot.producer_id(),
            attempt = attempts,
            "consumer delivered zero bytes"
        );
        app_events.publish(
            AUDIO_DELIVERY_STALLED,
            json!({
                "consumerId": consumer.id(),
                "producerId": slot.producer_id(),
                "attempts": attempts,
            }),
        );
        if slot.recovery.lock().latch_zero_bytes_report() {
            let report = json!({
                "roomId": slot.room_id(),
                "producerId": slot.producer_id(),
                "consumerId": consumer.id(),
                "timestamp": timestamp_millis(),
                "totalBytes": delivered,
            });
            if let Err(err) = ctx.signaling.emit(CONSUMER_ZERO_BYTES, report) {
                warn!(consumer_id = consumer.id(), error = %err, "zero-bytes report not sent");
            }
        }

        match recover(&slot, &ctx).await {
            Recovery::Replaced => {}
            Recovery::Exhausted => return observe_exhausted(&slot, ctx.config).await,
            Recovery::Abandoned => return,
        }
    }
}

/// Keeps sampling an unrecovered slot. Log only; nothing is emitted.
async fn observe_exhausted(slot: &ConsumerSlot, config: HealthConfig) {
    loop {
        let consumer = slot.consumer();
        let Some(delivered) = sample_window(consumer.as_ref(), config).await else {
            debug!(consumer_id = consumer.id(), "consumer closed; delivery no longer observed");
            return;
        };
        if delivered > 0 {
            info!(consumer_id = consumer.id(), delivered, "delivery resumed after recovery gave up");
            return;
        }
        warn!(
            consumer_id = consumer.id(),
            producer_id = slot.producer_id(),
            "consumer still delivering zero bytes"
        );
    }
}

/// Runs reconsume attempts until one yields a fresh consumer.
async fn recover(slot: &ConsumerSlot, ctx: &HealthContext) -> Recovery {
    loop {
        let claim = slot.recovery.lock().try_begin_reconsume();
        let attempt = match claim {
            Ok(attempt) => attempt,
            Err(ReconsumeDenied::InProgress) => return Recovery::Abandoned,
            Err(ReconsumeDenied::Exhausted) => {
                if slot.recovery.lock().latch_exhaustion_report() {
                    warn!(
                        producer_id = slot.producer_id(),
                        attempts = MAX_RECONSUME,
                        "recovery exhausted; audio stays unavailable"
                    );
                    ctx.signaling.app_events().publish(
                        AUDIO_RECOVERY_EXHAUSTED,
                        json!({
                            "producerId": slot.producer_id(),
                            "consumerId": slot.consumer().id(),
                            "attempts": MAX_RECONSUME,
                        }),
                    );
                }
                return Recovery::Exhausted;
            }
        };
        info!(producer_id = slot.producer_id(), attempt, "reconsume scheduled");
        let result = reconsume(slot, ctx).await;
        slot.recovery.lock().finish_reconsume();
        match result {
            Ok(()) => return Recovery::Replaced,
            Err(err) => {
                warn!(producer_id = slot.producer_id(), attempt, error = %err, "reconsume failed");
                if slot.transport().is_closed() {
                    return Recovery::Abandoned;
                }
            }
        }
    }
}

/// Replaces the slot's consumer in place and points the same sink at it.
async fn reconsume(slot: &ConsumerSlot, ctx: &HealthContext) -> Result<(), NegotiationError> {
    let stale = slot.consumer();
    stale.close();

    let options = request_consumer(
        &ctx.signaling,
        slot.transport().as_ref(),
        slot.producer_id(),
        slot.room_id(),
        slot.rtp_capabilities(),
        ctx.match_timeout,
    )
    .await?
    .ok_or_else(|| NegotiationError::InvalidReply {
        event: CONSUMED,
        reason: "no rtpParameters on reconsume".into(),
    })?;
    let fresh = materialize(slot.transport().as_ref(), options).await?;
    slot.replace_consumer(fresh.clone());
    info!(
        producer_id = slot.producer_id(),
        stale_consumer = stale.id(),
        consumer_id = fresh.id(),
        "consumer replaced"
    );

    let sink = slot.sink();
    if attach_and_play(sink.as_ref(), fresh.as_ref(), true).await
        == PlaybackOutcome::MutedPendingInteraction
    {
        ctx.signaling.app_events().publish(
            AUDIO_MUTED_PENDING_INTERACTION,
            json!({
                "consumerId": fresh.id(),
                "producerId": slot.producer_id(),
            }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconsume_budget_is_bounded() {
        let mut state = RecoveryState::default();
        assert_eq!(state.try_begin_reconsume(), Ok(1));
        assert_eq!(state.try_begin_reconsume(), Err(ReconsumeDenied::InProgress));
        state.finish_reconsume();
        assert_eq!(state.try_begin_reconsume(), Ok(2));
        state.finish_reconsume();
        assert_eq!(state.try_begin_reconsume(), Err(ReconsumeDenied::Exhausted));
        assert!(state.is_exhausted());
        assert_eq!(state.attempts(), MAX_RECONSUME);
    }

    #[test]
    fn zero_bytes_report_latches() {
        let mut state = RecoveryState::default();
        assert!(state.latch_zero_bytes_report());
        assert!(!state.latch_zero_bytes_report());
        assert!(state.zero_bytes_reported());
    }

    #[test]
    fn default_window() {
        let config = HealthConfig::default();
        assert_eq!(config.samples, 10);
        assert_eq!(config.interval, Duration::from_secs(1));
    }
}
