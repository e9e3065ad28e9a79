//! Audio pipeline - Opus decode and playback
//!
//! Receives encoded Opus packets from the session layer's network
//! thread, decodes them on a dedicated feeder thread and delivers PCM
//! to the configured output sink with jitter protection, drop policy
//! and packet-loss concealment.

mod feeder;
pub mod intake;
pub mod opus;
pub mod renderer;
pub mod ring;
pub mod sizing;

pub use intake::{IntakeStats, MAX_PACKET_BYTES};
pub use opus::{MsDecoder, MsEncoder, OpusError};
pub use sizing::{DerivedSizes, OpusStreamConfig, DEFAULT_JITTER_MS};

use crate::audio::feeder::{FeederContext, SinkInit};
use crate::audio::intake::PacketIntake;
use crate::sink::{PushConsumer, SharedFrameRing, SinkDescriptor, SinkProfile};
use crate::{log_error, log_info, log_warn};
use anyhow::{bail, Context, Result};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long init waits for the feeder to open the sink and report.
const SINK_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between the control thread, the network producer and
/// the feeder.
#[derive(Debug)]
pub(crate) struct PipelineShared {
    pub intake: PacketIntake,
    pub running: AtomicBool,
    pub counters: PipelineCounters,
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub plc_frames: AtomicU64,
    pub ring_overflows: AtomicU64,
    pub underrun_restarts: AtomicU64,
    pub flushes: AtomicU64,
}

/// Snapshot of the pipeline's lifetime counters.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStats {
    pub intake_depth: usize,
    pub intake: IntakeStats,
    pub decoded: u64,
    pub decode_errors: u64,
    pub plc_frames: u64,
    pub ring_overflows: u64,
    pub underrun_restarts: u64,
    pub flushes: u64,
}

/// The decode-and-playback pipeline for one streaming session.
///
/// Created by `init`, destroyed by `cleanup` (or drop). The steady
/// state never returns an error: audio plays, drops or conceals, but
/// the pipeline does not stop itself.
#[derive(Debug)]
pub struct AudioPipeline {
    shared: Arc<PipelineShared>,
    feeder: Option<JoinHandle<()>>,
    push_ring: Option<Arc<SharedFrameRing>>,
    push_consumer: Option<PushConsumer>,
    sizes: DerivedSizes,
}

impl AudioPipeline {
    /// Build the whole pipeline and start the feeder. The only
    /// fallible moment of the pipeline's life: decoder creation and
    /// sink open failures surface here, with everything already
    /// started torn back down.
    pub fn init(
        cfg: &OpusStreamConfig,
        jitter_override_ms: u32,
        profile: SinkProfile,
    ) -> Result<Self> {
        let sizes = DerivedSizes::compute(cfg, jitter_override_ms);
        if sizes.effective_channels != cfg.channel_count {
            log_warn!(
                "AUD",
                "unsupported channel count {}, downmixing to stereo",
                cfg.channel_count
            );
        }
        log_info!(
            "AUD",
            "init: {} Hz, {} ch, {} spf -> frame {:.2} ms, jitter {} frames ({} ms target), pkt cap {}",
            cfg.sample_rate,
            cfg.channel_count,
            cfg.samples_per_frame,
            sizes.frame_duration_ms,
            sizes.jitter_frames,
            sizes.target_jitter_ms,
            sizes.pkt_cap
        );

        let shared = Arc::new(PipelineShared {
            intake: PacketIntake::new(sizes.pkt_cap),
            running: AtomicBool::new(false),
            counters: PipelineCounters::default(),
        });

        let decoder =
            MsDecoder::new(cfg).context("failed to create opus multistream decoder")?;

        let (sink, push_ring, push_consumer) = match profile {
            SinkProfile::Pull(factory) => (SinkInit::Pull(factory), None, None),
            SinkProfile::Push => {
                let (producer, consumer) = SharedFrameRing::new(&sizes, cfg.sample_rate);
                let ring = producer.shared().clone();
                (SinkInit::Push(producer), Some(ring), Some(consumer))
            }
        };

        shared.running.store(true, Ordering::Release);
        let (ready_tx, ready_rx) = bounded(1);
        let ctx = FeederContext {
            shared: shared.clone(),
            decoder,
            sizes,
            samples_per_frame: cfg.samples_per_frame,
            channel_count: cfg.channel_count,
            sample_rate: cfg.sample_rate,
            sink,
        };
        let handle = thread::Builder::new()
            .name("cw-audio-feeder".into())
            .spawn(move || feeder::run(ctx, ready_tx))
            .context("failed to spawn feeder thread")?;

        let mut pipeline = Self {
            shared,
            feeder: Some(handle),
            push_ring,
            push_consumer,
            sizes,
        };

        match ready_rx.recv_timeout(SINK_OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                pipeline.cleanup();
                return Err(e.context("audio sink open failed"));
            }
            Err(_) => {
                pipeline.cleanup();
                bail!("feeder did not report sink readiness in time");
            }
        }

        log_info!("AUD", "pipeline started");
        Ok(pipeline)
    }

    /// Network-producer entry point. Copies the packet into the
    /// intake; a no-op once the pipeline is stopped. Never blocks
    /// beyond the intake's short critical section.
    pub fn submit_packet(&self, bytes: &[u8]) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.intake.submit(bytes);
    }

    /// Stop the feeder and release the sink and decoder. Idempotent
    /// and safe after a partially failed init. The feeder's bounded
    /// wait makes the join complete within about a millisecond plus
    /// one in-flight decode.
    pub fn cleanup(&mut self) {
        // Push profile: the consumer must stop reading shared frames
        // before anything is released
        if let Some(ring) = &self.push_ring {
            ring.set_ready(false);
        }
        if let Some(handle) = self.feeder.take() {
            self.shared.running.store(false, Ordering::Release);
            self.shared.intake.shutdown();
            if handle.join().is_err() {
                log_error!("AUD", "feeder thread panicked during shutdown");
            }
            log_info!("AUD", "pipeline stopped");
        }
    }

    pub fn sizes(&self) -> &DerivedSizes {
        &self.sizes
    }

    pub fn intake_depth(&self) -> usize {
        self.shared.intake.depth()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            intake_depth: self.shared.intake.depth(),
            intake: self.shared.intake.stats(),
            decoded: c.decoded.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            plc_frames: c.plc_frames.load(Ordering::Relaxed),
            ring_overflows: c.ring_overflows.load(Ordering::Relaxed),
            underrun_restarts: c.underrun_restarts.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
        }
    }

    /// Hand the push-profile consumer endpoint to the host scheduler.
    /// Returns `None` for pull pipelines or if already taken.
    pub fn take_push_consumer(&mut self) -> Option<PushConsumer> {
        self.push_consumer.take()
    }

    /// The push-profile configuration descriptor (stable for the
    /// pipeline lifetime).
    pub fn push_descriptor(&self) -> Option<SinkDescriptor> {
        self.push_ring.as_ref().map(|r| r.descriptor())
    }

    /// True until cleanup begins.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.cleanup();
    }
}
