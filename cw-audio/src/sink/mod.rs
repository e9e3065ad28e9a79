//! Audio output sinks
//!
//! The feeder drives one of two profiles: a pull sink that owns a pool
//! of output buffers the pipeline recycles (processed -> filled ->
//! re-queued), or a push sink that publishes decoded frames into a
//! shared ring for an external scheduler. The pull profile is a trait
//! so the feeder can be exercised against a mock backend in tests.

pub mod pull;
pub mod push;

pub use pull::CpalOutput;
pub use push::{PushConsumer, PushProducer, SharedFrameRing, SinkDescriptor};

/// Playback state of the pull sink's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Playing,
    /// The source ran out of queued buffers (or was never started) and
    /// will emit silence until `play()` is called again.
    Stopped,
}

/// One preallocated output buffer holding a single interleaved i16
/// PCM frame. Buffers cycle between the backend and the feeder; they
/// are never reallocated after init.
pub struct PoolBuffer {
    samples: Vec<i16>,
}

impl PoolBuffer {
    pub fn silence(frame_elems: usize) -> Self {
        Self {
            samples: vec![0i16; frame_elems],
        }
    }

    /// Upload one frame of PCM into this buffer.
    pub fn fill(&mut self, pcm: &[i16]) {
        self.samples.copy_from_slice(pcm);
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }
}

/// Capability set of the pull profile: query processed buffers,
/// unqueue and re-queue them in batches, inspect source state, start
/// playback. Batching is part of the contract: one `unqueue_processed`
/// and one `queue` call per feeder tick regardless of the batch size.
pub trait PullBackend {
    /// Channel count actually opened (after any stereo fallback).
    fn channels(&self) -> usize;

    /// Number of buffers the device has finished playing.
    fn processed_count(&mut self) -> usize;

    /// Reclaim up to `n` processed buffers in one batch.
    fn unqueue_processed(&mut self, n: usize) -> Vec<PoolBuffer>;

    /// Hand a batch of filled buffers back to the device.
    fn queue(&mut self, bufs: Vec<PoolBuffer>);

    fn state(&mut self) -> SourceState;

    /// Start (or restart after underrun) playback.
    fn play(&mut self);
}

/// Stream parameters a pull backend is opened with.
#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub sample_rate: i32,
    /// Requested channel count; the backend may fall back to stereo.
    pub channels: usize,
    pub samples_per_frame: usize,
    pub num_buffers: usize,
}

/// Opens a pull backend on the feeder thread. A factory is used
/// because real device streams are not `Send` and must live on the
/// thread that services them.
pub type PullBackendFactory =
    Box<dyn FnOnce(&StreamParams) -> anyhow::Result<Box<dyn PullBackend>> + Send>;

/// Which output profile a pipeline drives.
pub enum SinkProfile {
    Pull(PullBackendFactory),
    Push,
}

impl SinkProfile {
    /// Pull profile on the default audio device.
    pub fn pull_device() -> Self {
        SinkProfile::Pull(Box::new(|params| {
            CpalOutput::open(params).map(|out| Box::new(out) as Box<dyn PullBackend>)
        }))
    }

    /// Pull profile over a caller-provided backend factory.
    pub fn pull_with(factory: PullBackendFactory) -> Self {
        SinkProfile::Pull(factory)
    }
}
