//! Feeder worker: drains the packet intake, decodes, drives the sink
//!
//! Single dedicated thread, started last in init and joined first in
//! cleanup. No lock is held across the Opus decode or any sink call;
//! the 1 ms bounded wait keeps worst-case shutdown latency and sink
//! polling latency fixed.

use crate::audio::intake::MAX_PACKET_BYTES;
use crate::audio::opus::MsDecoder;
use crate::audio::ring::{FrameRing, RingPush};
use crate::audio::sizing::DerivedSizes;
use crate::audio::PipelineShared;
use crate::sink::{PullBackend, PullBackendFactory, PushProducer, SourceState, StreamParams};
use crate::{log_info, log_verbose, log_warn};
use anyhow::Result;
use crossbeam_channel::Sender;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DIAG_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_SLICE: Duration = Duration::from_millis(1);

/// Everything the feeder thread owns. Built by init and moved onto
/// the thread; the decoder has no other user from then on.
pub(crate) struct FeederContext {
    pub shared: Arc<PipelineShared>,
    pub decoder: MsDecoder,
    pub sizes: DerivedSizes,
    pub samples_per_frame: usize,
    pub channel_count: usize,
    pub sample_rate: i32,
    pub sink: SinkInit,
}

pub(crate) enum SinkInit {
    Pull(PullBackendFactory),
    Push(PushProducer),
}

struct PullDriver {
    backend: Box<dyn PullBackend>,
    ring: FrameRing,
    effective_channels: usize,
    jitter_ready: bool,
    overflow_count: u64,
}

struct PushDriver {
    producer: PushProducer,
    overflow_count: u64,
}

enum Driver {
    Pull(PullDriver),
    Push(PushDriver),
}

/// Overflow logs are rate-limited: the first few, then every 100th.
fn should_log_overflow(count: u64) -> bool {
    count <= 3 || count % 100 == 0
}

/// Copy one decoded frame from the decode scratch into the staging
/// frame, applying the stereo fallback when the output channel count
/// differs from the decoder's.
fn stage_frame(scratch: &[i16], channels: usize, effective: usize, spf: usize, out: &mut [i16]) {
    if channels == effective {
        out.copy_from_slice(&scratch[..spf * channels]);
    } else if channels == 1 {
        for i in 0..spf {
            let s = scratch[i];
            out[2 * i] = s;
            out[2 * i + 1] = s;
        }
    } else {
        // Keep front-left/front-right, drop the rest
        for i in 0..spf {
            out[2 * i] = scratch[i * channels];
            out[2 * i + 1] = scratch[i * channels + 1];
        }
    }
}

pub(crate) fn run(ctx: FeederContext, ready_tx: Sender<Result<()>>) {
    let FeederContext {
        shared,
        mut decoder,
        sizes,
        samples_per_frame,
        channel_count,
        sample_rate,
        sink,
    } = ctx;

    // The pull backend opens here, on its owning thread (real device
    // streams are not Send). Init blocks on the outcome.
    let mut driver = match sink {
        SinkInit::Pull(factory) => {
            let params = StreamParams {
                sample_rate,
                channels: sizes.effective_channels,
                samples_per_frame,
                num_buffers: sizes.num_buffers,
            };
            match factory(&params) {
                Ok(backend) => {
                    let effective = backend.channels();
                    if effective != params.channels {
                        log_warn!("AUD", "downmixing to stereo ({} channel output refused)", params.channels);
                    }
                    let ring = FrameRing::new(sizes.ring_cap, samples_per_frame * effective);
                    let _ = ready_tx.send(Ok(()));
                    Driver::Pull(PullDriver {
                        backend,
                        ring,
                        effective_channels: effective,
                        jitter_ready: false,
                        overflow_count: 0,
                    })
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            }
        }
        SinkInit::Push(producer) => {
            // Descriptor fields are all valid at this point
            producer.shared().set_ready(true);
            let _ = ready_tx.send(Ok(()));
            Driver::Push(PushDriver {
                producer,
                overflow_count: 0,
            })
        }
    };

    let mut scratch = vec![0i16; sizes.decode_elems];
    let mut frame = vec![0i16; frame_len(&driver, samples_per_frame)];
    let mut pkt = Box::new([0u8; MAX_PACKET_BYTES]);
    let mut last_diag = Instant::now();

    log_verbose!("AUD", "feeder thread started");

    while shared.running.load(Ordering::Relaxed) {
        if last_diag.elapsed() >= DIAG_INTERVAL {
            diagnostics(&shared, &driver);
            last_diag = Instant::now();
        }

        // Scheduler gap recovery: discard stale packets that piled up
        // while the consumer was paused, so we do not decode audio the
        // scheduler has already written off
        if let Driver::Push(drv) = &driver {
            if drv.producer.shared().take_flush_request() {
                let dropped = shared.intake.clear();
                shared.counters.flushes.fetch_add(1, Ordering::Relaxed);
                log_info!(
                    "AUD",
                    "packet queue flushed by scheduler gap recovery ({} packets)",
                    dropped
                );
            }
        }

        match &mut driver {
            Driver::Pull(drv) => {
                drain_pull(&shared, &mut decoder, drv, &mut scratch, &mut frame, &mut pkt, channel_count, samples_per_frame);
                pace_pull(&shared, &mut decoder, drv, &mut scratch, &mut frame, &sizes, channel_count, samples_per_frame);
            }
            Driver::Push(drv) => {
                drain_push(&shared, &mut decoder, drv, &mut scratch, &mut frame, &mut pkt, &sizes, channel_count, samples_per_frame);
            }
        }

        shared.intake.wait_for_work(WAIT_SLICE);
    }

    log_verbose!("AUD", "feeder thread exiting");
}

fn frame_len(driver: &Driver, spf: usize) -> usize {
    match driver {
        Driver::Pull(drv) => spf * drv.effective_channels,
        Driver::Push(drv) => drv.producer.shared().descriptor().frame_elems,
    }
}

/// Decode every queued packet into the jitter ring (pull profile).
/// The ring drops its newest frame on overflow, preserving audio
/// nearest to playback.
#[allow(clippy::too_many_arguments)]
fn drain_pull(
    shared: &PipelineShared,
    decoder: &mut MsDecoder,
    drv: &mut PullDriver,
    scratch: &mut [i16],
    frame: &mut [i16],
    pkt: &mut [u8; MAX_PACKET_BYTES],
    channel_count: usize,
    spf: usize,
) {
    while let Some(len) = shared.intake.try_pop(pkt) {
        match decoder.decode(&pkt[..len], scratch, spf) {
            Ok(n) if n == spf => {
                shared.counters.decoded.fetch_add(1, Ordering::Relaxed);
                stage_frame(scratch, channel_count, drv.effective_channels, spf, frame);
                if drv.ring.push_frame(frame) == RingPush::EvictedNewest {
                    drv.overflow_count += 1;
                    shared.counters.ring_overflows.fetch_add(1, Ordering::Relaxed);
                    if should_log_overflow(drv.overflow_count) {
                        log_info!(
                            "AUD",
                            "frame ring overflow #{}, dropping newest frame",
                            drv.overflow_count
                        );
                    }
                }
            }
            Ok(n) => {
                shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                log_info!("AUD", "unexpected decode length {} (want {}), dropping", n, spf);
            }
            Err(e) => {
                shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                log_info!("AUD", "opus decode failed: {}", e);
            }
        }
    }
}

/// Decode every queued packet into the shared ring (push profile).
/// A full ring drops the *encoded* packet instead of decoded audio.
#[allow(clippy::too_many_arguments)]
fn drain_push(
    shared: &PipelineShared,
    decoder: &mut MsDecoder,
    drv: &mut PushDriver,
    scratch: &mut [i16],
    frame: &mut [i16],
    pkt: &mut [u8; MAX_PACKET_BYTES],
    sizes: &DerivedSizes,
    channel_count: usize,
    spf: usize,
) {
    while let Some(len) = shared.intake.try_pop(pkt) {
        if drv.producer.is_full() {
            drv.overflow_count += 1;
            shared.counters.ring_overflows.fetch_add(1, Ordering::Relaxed);
            if should_log_overflow(drv.overflow_count) {
                log_info!(
                    "AUD",
                    "PCM ring overflow #{}, dropping packet",
                    drv.overflow_count
                );
            }
            continue;
        }
        match decoder.decode(&pkt[..len], scratch, spf) {
            Ok(n) if n == spf => {
                shared.counters.decoded.fetch_add(1, Ordering::Relaxed);
                stage_frame(scratch, channel_count, sizes.effective_channels, spf, frame);
                drv.producer.publish(frame);
            }
            Ok(n) => {
                shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                log_info!("AUD", "unexpected decode length {} (want {}), dropping", n, spf);
            }
            Err(e) => {
                shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                log_info!("AUD", "opus decode failed: {}", e);
            }
        }
    }
}

/// Recycle processed output buffers: real frames from the ring first,
/// decoder concealment for the rest. One unqueue batch and one queue
/// batch per tick, however many buffers are due.
#[allow(clippy::too_many_arguments)]
fn pace_pull(
    shared: &PipelineShared,
    decoder: &mut MsDecoder,
    drv: &mut PullDriver,
    scratch: &mut [i16],
    frame: &mut [i16],
    sizes: &DerivedSizes,
    channel_count: usize,
    spf: usize,
) {
    // Until the jitter reservoir first fills, the silence queued at
    // init covers playback and nothing is uploaded
    if !drv.jitter_ready {
        if drv.ring.len() < sizes.jitter_frames {
            return;
        }
        drv.jitter_ready = true;
        log_info!(
            "AUD",
            "jitter buffer ready ({} frames, {} ms target)",
            sizes.jitter_frames,
            sizes.target_jitter_ms
        );
    }

    let processed = drv.backend.processed_count();
    if processed == 0 {
        return;
    }

    let mut bufs = drv.backend.unqueue_processed(processed);
    let real = bufs.len().min(drv.ring.len());

    for (i, buf) in bufs.iter_mut().enumerate() {
        if i < real {
            buf.fill(drv.ring.front());
            drv.ring.pop_front();
        } else {
            // Free slot but no decoded audio: ask the decoder for a
            // concealment frame rather than queueing silence
            match decoder.decode_lost(scratch, spf) {
                Ok(n) if n == spf => {}
                _ => scratch[..spf * channel_count].fill(0),
            }
            stage_frame(scratch, channel_count, drv.effective_channels, spf, frame);
            buf.fill(frame);
            shared.counters.plc_frames.fetch_add(1, Ordering::Relaxed);
        }
    }
    drv.backend.queue(bufs);

    if drv.backend.state() == SourceState::Stopped {
        shared.counters.underrun_restarts.fetch_add(1, Ordering::Relaxed);
        log_info!("AUD", "output source stopped, restarting playback");
        drv.backend.play();
    }
}

fn diagnostics(shared: &PipelineShared, driver: &Driver) {
    let c = &shared.counters;
    match driver {
        Driver::Pull(drv) => log_verbose!(
            "AUD",
            "diag: intake={} ring={}/{} ready={} decoded={} errors={} plc={} overflows={} restarts={}",
            shared.intake.depth(),
            drv.ring.len(),
            drv.ring.capacity(),
            drv.jitter_ready,
            c.decoded.load(Ordering::Relaxed),
            c.decode_errors.load(Ordering::Relaxed),
            c.plc_frames.load(Ordering::Relaxed),
            c.ring_overflows.load(Ordering::Relaxed),
            c.underrun_restarts.load(Ordering::Relaxed)
        ),
        Driver::Push(drv) => log_verbose!(
            "AUD",
            "diag: intake={} ring={}/{} ready={} decoded={} errors={} overflows={} flushes={}",
            shared.intake.depth(),
            drv.producer.shared().frames_queued(),
            drv.producer.shared().descriptor().ring_cap,
            drv.producer.shared().is_ready(),
            c.decoded.load(Ordering::Relaxed),
            c.decode_errors.load(Ordering::Relaxed),
            c.ring_overflows.load(Ordering::Relaxed),
            c.flushes.load(Ordering::Relaxed)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_frame_passthrough_when_counts_match() {
        let scratch: Vec<i16> = (0..8).collect();
        let mut out = vec![0i16; 8];
        stage_frame(&scratch, 2, 2, 4, &mut out);
        assert_eq!(out, scratch);
    }

    #[test]
    fn stage_frame_downmixes_surround_to_front_pair() {
        // Two sample frames of 6 channels each
        let scratch: Vec<i16> = (0..12).collect();
        let mut out = vec![0i16; 4];
        stage_frame(&scratch, 6, 2, 2, &mut out);
        assert_eq!(out, vec![0, 1, 6, 7]);
    }

    #[test]
    fn stage_frame_duplicates_mono() {
        let scratch: Vec<i16> = vec![3, 4, 5];
        let mut out = vec![0i16; 6];
        stage_frame(&scratch, 1, 2, 3, &mut out);
        assert_eq!(out, vec![3, 3, 4, 4, 5, 5]);
    }

    #[test]
    fn overflow_logging_is_rate_limited() {
        let logged: Vec<u64> = (1..=250).filter(|&c| should_log_overflow(c)).collect();
        assert_eq!(logged, vec![1, 2, 3, 100, 200]);
    }
}
