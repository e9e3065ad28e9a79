//! Renderer callback surface for the session layer
//!
//! The upstream streaming library drives audio through three
//! callbacks: `init` at stream start, `decode_and_play_sample` from
//! its network thread for every packet, and `cleanup` at teardown.
//! They bind to a single process-wide pipeline registration.

use crate::audio::{AudioPipeline, OpusStreamConfig, PipelineStats};
use crate::log_error;
use crate::sink::SinkProfile;
use std::sync::{Mutex, MutexGuard};

/// Packets are handed to `decode_and_play_sample` directly from the
/// receive path, with no intermediate queueing by the session layer.
pub const CAPABILITY_DIRECT_SUBMIT: u32 = 1 << 0;
/// Packet duration follows the negotiated `samples_per_frame`; the
/// renderer does not require a fixed 5 ms cadence.
pub const CAPABILITY_ARBITRARY_AUDIO_DURATION: u32 = 1 << 1;

/// Capability set advertised to the session layer.
pub const CAPABILITIES: u32 = CAPABILITY_DIRECT_SUBMIT | CAPABILITY_ARBITRARY_AUDIO_DURATION;

static ACTIVE: Mutex<Option<AudioPipeline>> = Mutex::new(None);

fn active() -> MutexGuard<'static, Option<AudioPipeline>> {
    ACTIVE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Session-layer init callback. Returns 0 on success, negative on
/// failure (after releasing anything partially acquired).
pub fn init(cfg: &OpusStreamConfig, jitter_override_ms: u32, profile: SinkProfile) -> i32 {
    let mut slot = active();
    if slot.is_some() {
        log_error!("AUD", "init called while a pipeline is active, restarting");
        *slot = None;
    }
    match AudioPipeline::init(cfg, jitter_override_ms, profile) {
        Ok(pipeline) => {
            *slot = Some(pipeline);
            0
        }
        Err(e) => {
            log_error!("AUD", "init failed: {:#}", e);
            -1
        }
    }
}

/// Network-thread entry: one encoded Opus packet. A no-op when no
/// pipeline is registered.
pub fn decode_and_play_sample(bytes: &[u8]) {
    if let Some(pipeline) = active().as_ref() {
        pipeline.submit_packet(bytes);
    }
}

/// Session-layer cleanup callback. Synchronous, bounded and
/// idempotent.
pub fn cleanup() {
    // Drop runs the pipeline's own cleanup
    *active() = None;
}

/// Take the push-profile consumer endpoint from the registered
/// pipeline, if any.
pub fn take_push_consumer() -> Option<crate::sink::PushConsumer> {
    active().as_mut().and_then(|p| p.take_push_consumer())
}

/// Counters of the registered pipeline, if any.
pub fn stats() -> Option<PipelineStats> {
    active().as_ref().map(|p| p.stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_advertise_direct_submit_and_arbitrary_duration() {
        assert_eq!(CAPABILITIES & CAPABILITY_DIRECT_SUBMIT, CAPABILITY_DIRECT_SUBMIT);
        assert_eq!(
            CAPABILITIES & CAPABILITY_ARBITRARY_AUDIO_DURATION,
            CAPABILITY_ARBITRARY_AUDIO_DURATION
        );
    }

    #[test]
    fn callbacks_are_no_ops_without_a_registered_pipeline() {
        // Must not panic or block
        decode_and_play_sample(&[1, 2, 3]);
        cleanup();
        cleanup();
        assert!(stats().is_none());
        assert!(take_push_consumer().is_none());
    }
}
