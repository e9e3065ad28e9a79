//! Pull sink on a real audio device via cpal
//!
//! The device callback consumes queued pool buffers sample by sample
//! and recycles exhausted ones onto the processed channel. When the
//! callback starves it stops consuming and reports `Stopped`, like a
//! source that played out its last queued buffer; the feeder restarts
//! it with `play()` once buffers are queued again.

use crate::sink::{PoolBuffer, PullBackend, SourceState, StreamParams};
use crate::{log_error, log_info, log_warn};
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct CpalOutput {
    // Held only to keep the device stream alive
    _stream: cpal::Stream,
    channels: usize,
    playing: Arc<AtomicBool>,
    to_play_tx: Sender<PoolBuffer>,
    processed_rx: Receiver<PoolBuffer>,
}

/// Callback-side state. Lives inside the cpal data callback; never
/// blocks and never allocates.
struct CallbackFeed {
    to_play_rx: Receiver<PoolBuffer>,
    processed_tx: Sender<PoolBuffer>,
    playing: Arc<AtomicBool>,
    current: Option<PoolBuffer>,
    pos: usize,
}

impl CallbackFeed {
    fn fill(&mut self, data: &mut [f32]) {
        for out in data.iter_mut() {
            *out = self.next_sample();
        }
    }

    fn next_sample(&mut self) -> f32 {
        if !self.playing.load(Ordering::Relaxed) {
            return 0.0;
        }
        loop {
            if let Some(buf) = self.current.as_ref() {
                if self.pos < buf.samples().len() {
                    let s = buf.samples()[self.pos];
                    self.pos += 1;
                    return s as f32 / 32768.0;
                }
                if let Some(done) = self.current.take() {
                    let _ = self.processed_tx.try_send(done);
                }
            }
            match self.to_play_rx.try_recv() {
                Ok(buf) => {
                    self.current = Some(buf);
                    self.pos = 0;
                }
                Err(_) => {
                    // Played out every queued buffer: the source stops
                    // until the feeder queues more and calls play()
                    self.playing.store(false, Ordering::Relaxed);
                    return 0.0;
                }
            }
        }
    }
}

impl CpalOutput {
    /// Open the default output device at the negotiated sample rate.
    /// A failure to open 6 or 8 channels falls back to stereo; the
    /// pipeline then downmixes.
    pub fn open(params: &StreamParams) -> Result<CpalOutput> {
        match Self::open_with_channels(params, params.channels) {
            Ok(out) => Ok(out),
            Err(e) if params.channels > 2 => {
                log_warn!(
                    "SNK",
                    "failed to open {}-channel stream ({}), retrying as stereo",
                    params.channels,
                    e
                );
                Self::open_with_channels(params, 2)
            }
            Err(e) => Err(e),
        }
    }

    fn open_with_channels(params: &StreamParams, channels: usize) -> Result<CpalOutput> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no audio output device found")?;

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(params.sample_rate as u32),
            buffer_size: BufferSize::Default,
        };

        let (to_play_tx, to_play_rx) = bounded::<PoolBuffer>(params.num_buffers);
        let (processed_tx, processed_rx) = bounded::<PoolBuffer>(params.num_buffers);
        let playing = Arc::new(AtomicBool::new(false));

        let mut feed = CallbackFeed {
            to_play_rx,
            processed_tx,
            playing: playing.clone(),
            current: None,
            pos: 0,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feed.fill(data),
                |err| log_error!("SNK", "stream error: {}", err),
                None,
            )
            .with_context(|| format!("failed to build {}-channel output stream", channels))?;

        // Pre-fill the whole pool with silence and queue it so
        // playback starts immediately, before real PCM is available
        let frame_elems = params.samples_per_frame * channels;
        for _ in 0..params.num_buffers {
            let _ = to_play_tx.try_send(PoolBuffer::silence(frame_elems));
        }
        playing.store(true, Ordering::Relaxed);
        stream.play().context("failed to start output stream")?;

        log_info!(
            "SNK",
            "output open: {} Hz, {} ch, {} pool buffers of {} samples",
            params.sample_rate,
            channels,
            params.num_buffers,
            frame_elems
        );

        Ok(CpalOutput {
            _stream: stream,
            channels,
            playing,
            to_play_tx,
            processed_rx,
        })
    }
}

impl PullBackend for CpalOutput {
    fn channels(&self) -> usize {
        self.channels
    }

    fn processed_count(&mut self) -> usize {
        self.processed_rx.len()
    }

    fn unqueue_processed(&mut self, n: usize) -> Vec<PoolBuffer> {
        let mut bufs = Vec::with_capacity(n);
        for _ in 0..n {
            match self.processed_rx.try_recv() {
                Ok(buf) => bufs.push(buf),
                Err(_) => break,
            }
        }
        bufs
    }

    fn queue(&mut self, bufs: Vec<PoolBuffer>) {
        for buf in bufs {
            // Cannot overflow: the channel holds the whole pool
            let _ = self.to_play_tx.try_send(buf);
        }
    }

    fn state(&mut self) -> SourceState {
        if self.playing.load(Ordering::Relaxed) {
            SourceState::Playing
        } else {
            SourceState::Stopped
        }
    }

    fn play(&mut self) {
        self.playing.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_pair(cap: usize) -> (CallbackFeed, Sender<PoolBuffer>, Receiver<PoolBuffer>) {
        let (to_play_tx, to_play_rx) = bounded(cap);
        let (processed_tx, processed_rx) = bounded(cap);
        let feed = CallbackFeed {
            to_play_rx,
            processed_tx,
            playing: Arc::new(AtomicBool::new(true)),
            current: None,
            pos: 0,
        };
        (feed, to_play_tx, processed_rx)
    }

    #[test]
    fn callback_drains_buffers_in_order_and_recycles_them() {
        let (mut feed, to_play, processed) = feed_pair(4);
        let mut a = PoolBuffer::silence(4);
        a.fill(&[100, 200, 300, 400]);
        let mut b = PoolBuffer::silence(4);
        b.fill(&[500, 600, 700, 800]);
        to_play.send(a).unwrap();
        to_play.send(b).unwrap();

        let mut out = [0f32; 8];
        feed.fill(&mut out);
        assert!((out[0] - 100.0 / 32768.0).abs() < 1e-6);
        assert!((out[4] - 500.0 / 32768.0).abs() < 1e-6);

        // First buffer fully played -> recycled as processed
        assert_eq!(processed.len(), 1);
    }

    #[test]
    fn starvation_stops_the_source_and_emits_silence() {
        let (mut feed, to_play, _processed) = feed_pair(4);
        let mut a = PoolBuffer::silence(2);
        a.fill(&[1000, 2000]);
        to_play.send(a).unwrap();

        let mut out = [1.0f32; 6];
        feed.fill(&mut out);
        // Two real samples, then underrun silence
        assert!(out[0] != 0.0);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[5], 0.0);
        assert!(!feed.playing.load(Ordering::Relaxed));

        // Stopped source does not consume newly queued buffers
        let mut b = PoolBuffer::silence(2);
        b.fill(&[3000, 4000]);
        to_play.send(b).unwrap();
        let mut out2 = [1.0f32; 2];
        feed.fill(&mut out2);
        assert_eq!(out2, [0.0, 0.0]);

        // play() resumes consumption
        feed.playing.store(true, Ordering::Relaxed);
        let mut out3 = [0f32; 2];
        feed.fill(&mut out3);
        assert!((out3[0] - 3000.0 / 32768.0).abs() < 1e-6);
    }
}
