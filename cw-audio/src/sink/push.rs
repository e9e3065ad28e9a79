//! Push sink: decoded frames published into a shared ring
//!
//! Used when the audio backend is an external scheduler that consumes
//! PCM frames on its own cadence. The feeder writes at the tail and
//! publishes by incrementing the atomic frame count with release
//! ordering; the consumer reads at its private head with acquire
//! ordering. Single writer, single reader.

use crate::audio::sizing::DerivedSizes;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Everything the external scheduler needs to configure itself,
/// published once at init and stable for the pipeline lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkDescriptor {
    pub sample_rate: i32,
    pub channels: usize,
    pub ring_cap: usize,
    pub frame_elems: usize,
    pub jitter_frames: usize,
    pub target_ms: u32,
    pub ready: bool,
    pub flush_requested: bool,
}

/// The shared frame ring behind the push profile.
///
/// `size` is the only synchronization between the two sides: the
/// producer checks it (acquire) before writing a slot and increments
/// it (release) after, the consumer checks it (acquire) before
/// reading and decrements it (release) after. A slot is therefore
/// never accessed by both sides at once.
#[derive(Debug)]
pub struct SharedFrameRing {
    samples: Box<[UnsafeCell<i16>]>,
    size: AtomicI32,
    ready: AtomicBool,
    flush_request: AtomicBool,
    sample_rate: i32,
    channels: usize,
    cap: usize,
    frame_elems: usize,
    jitter_frames: usize,
    target_ms: u32,
}

// SAFETY: slot contents are only touched under the SPSC protocol
// documented on the struct; `size` carries the release/acquire edges.
unsafe impl Sync for SharedFrameRing {}

impl SharedFrameRing {
    /// Allocate the ring and hand back the feeder-side producer and
    /// the host-side consumer.
    pub fn new(sizes: &DerivedSizes, sample_rate: i32) -> (PushProducer, PushConsumer) {
        let mut samples = Vec::with_capacity(sizes.ring_cap * sizes.frame_elems);
        samples.resize_with(sizes.ring_cap * sizes.frame_elems, || UnsafeCell::new(0i16));
        let shared = Arc::new(SharedFrameRing {
            samples: samples.into_boxed_slice(),
            size: AtomicI32::new(0),
            ready: AtomicBool::new(false),
            flush_request: AtomicBool::new(false),
            sample_rate,
            channels: sizes.effective_channels,
            cap: sizes.ring_cap,
            frame_elems: sizes.frame_elems,
            jitter_frames: sizes.jitter_frames,
            target_ms: sizes.target_jitter_ms,
        });
        (
            PushProducer {
                shared: shared.clone(),
                tail: 0,
            },
            PushConsumer { shared, head: 0 },
        )
    }

    pub fn frames_queued(&self) -> usize {
        self.size.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flip the readiness flag. Set once all descriptor fields are
    /// valid; cleared at the start of cleanup, before any buffer is
    /// released.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Ask the feeder to discard queued encoded packets (gap recovery).
    pub fn request_flush(&self) {
        self.flush_request.store(true, Ordering::Release);
    }

    /// Consume a pending flush request, if any. Feeder side.
    pub fn take_flush_request(&self) -> bool {
        self.flush_request.swap(false, Ordering::AcqRel)
    }

    pub fn descriptor(&self) -> SinkDescriptor {
        SinkDescriptor {
            sample_rate: self.sample_rate,
            channels: self.channels,
            ring_cap: self.cap,
            frame_elems: self.frame_elems,
            jitter_frames: self.jitter_frames,
            target_ms: self.target_ms,
            ready: self.is_ready(),
            flush_requested: self.flush_request.load(Ordering::Acquire),
        }
    }

    unsafe fn write_slot(&self, slot: usize, pcm: &[i16]) {
        let base = slot * self.frame_elems;
        for (i, &s) in pcm.iter().enumerate() {
            *self.samples[base + i].get() = s;
        }
    }

    unsafe fn read_slot(&self, slot: usize, out: &mut [i16]) {
        let base = slot * self.frame_elems;
        for (i, out_s) in out.iter_mut().enumerate() {
            *out_s = *self.samples[base + i].get();
        }
    }
}

/// Feeder-side handle: writes frames at the tail.
pub struct PushProducer {
    shared: Arc<SharedFrameRing>,
    tail: usize,
}

impl PushProducer {
    pub fn is_full(&self) -> bool {
        self.shared.size.load(Ordering::Acquire) as usize >= self.shared.cap
    }

    /// Publish one decoded frame. Returns false (frame not written)
    /// when the ring is full; the caller drops the encoded packet
    /// instead, preserving the oldest decoded audio.
    pub fn publish(&mut self, pcm: &[i16]) -> bool {
        debug_assert_eq!(pcm.len(), self.shared.frame_elems);
        if self.is_full() {
            return false;
        }
        // SAFETY: size < cap, so the consumer cannot be reading this
        // slot; the release increment below makes the write visible
        // before the frame becomes poppable.
        unsafe { self.shared.write_slot(self.tail, pcm) };
        self.tail = (self.tail + 1) % self.shared.cap;
        self.shared.size.fetch_add(1, Ordering::Release);
        true
    }

    pub fn shared(&self) -> &Arc<SharedFrameRing> {
        &self.shared
    }
}

/// Host-side handle: reads frames at its private head.
#[derive(Debug)]
pub struct PushConsumer {
    shared: Arc<SharedFrameRing>,
    head: usize,
}

impl PushConsumer {
    /// Pop the oldest published frame into `out` (length
    /// `frame_elems`). Returns false when the ring is empty.
    pub fn poll_frame(&mut self, out: &mut [i16]) -> bool {
        debug_assert_eq!(out.len(), self.shared.frame_elems);
        if self.shared.size.load(Ordering::Acquire) <= 0 {
            return false;
        }
        // SAFETY: size > 0, so this slot was fully written before the
        // producer's release increment; the release decrement below
        // frees it for reuse only after the copy completes.
        unsafe { self.shared.read_slot(self.head, out) };
        self.head = (self.head + 1) % self.shared.cap;
        self.shared.size.fetch_sub(1, Ordering::Release);
        true
    }

    pub fn frames_queued(&self) -> usize {
        self.shared.frames_queued()
    }

    pub fn frame_elems(&self) -> usize {
        self.shared.frame_elems
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Signal the feeder to flush stale encoded packets, e.g. after a
    /// wall-clock gap larger than the jitter target.
    pub fn request_flush(&self) {
        self.shared.request_flush();
    }

    pub fn descriptor(&self) -> SinkDescriptor {
        self.shared.descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sizing::{DerivedSizes, OpusStreamConfig};

    fn make_ring(spf: usize) -> (PushProducer, PushConsumer) {
        let cfg = OpusStreamConfig::stereo(48000, spf);
        let sizes = DerivedSizes::compute(&cfg, 0);
        SharedFrameRing::new(&sizes, cfg.sample_rate)
    }

    #[test]
    fn publish_then_poll_round_trips_in_order() {
        let (mut prod, mut cons) = make_ring(4);
        let elems = cons.frame_elems();
        for tag in 0..5i16 {
            assert!(prod.publish(&vec![tag; elems]));
        }
        let mut out = vec![0i16; elems];
        for tag in 0..5i16 {
            assert!(cons.poll_frame(&mut out));
            assert!(out.iter().all(|&s| s == tag));
        }
        assert!(!cons.poll_frame(&mut out));
    }

    #[test]
    fn full_ring_refuses_frames_and_preserves_oldest() {
        let (mut prod, mut cons) = make_ring(4);
        let elems = cons.frame_elems();
        let cap = prod.shared().descriptor().ring_cap;
        for tag in 0..cap as i16 {
            assert!(prod.publish(&vec![tag; elems]));
        }
        assert!(prod.is_full());
        assert!(!prod.publish(&vec![99; elems]));

        // Frame 0 is still the first out
        let mut out = vec![0i16; elems];
        assert!(cons.poll_frame(&mut out));
        assert!(out.iter().all(|&s| s == 0));
        // And the freed slot accepts a new frame again
        assert!(prod.publish(&vec![77; elems]));
    }

    #[test]
    fn size_counter_stays_within_bounds_across_threads() {
        let (mut prod, mut cons) = make_ring(2);
        let elems = cons.frame_elems();
        let cap = prod.shared().descriptor().ring_cap;
        let shared = prod.shared().clone();

        let writer = std::thread::spawn(move || {
            let mut published = 0u32;
            let frame = vec![5i16; elems];
            while published < 1000 {
                if prod.publish(&frame) {
                    published += 1;
                }
            }
        });
        let reader = std::thread::spawn(move || {
            let mut out = vec![0i16; elems];
            let mut popped = 0u32;
            while popped < 1000 {
                if cons.poll_frame(&mut out) {
                    assert!(out.iter().all(|&s| s == 5));
                    popped += 1;
                }
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
        assert!(shared.frames_queued() <= cap);
        assert_eq!(shared.frames_queued(), 0);
    }

    #[test]
    fn flush_request_handshake() {
        let (prod, cons) = make_ring(4);
        assert!(!prod.shared().take_flush_request());
        cons.request_flush();
        assert!(cons.descriptor().flush_requested);
        assert!(prod.shared().take_flush_request());
        // One request, one observation
        assert!(!prod.shared().take_flush_request());
        assert!(!cons.descriptor().flush_requested);
    }

    #[test]
    fn ready_lifecycle_and_descriptor_fields() {
        let cfg = OpusStreamConfig::stereo(48000, 240);
        let sizes = DerivedSizes::compute(&cfg, 0);
        let (prod, cons) = SharedFrameRing::new(&sizes, cfg.sample_rate);

        assert!(!cons.is_ready());
        prod.shared().set_ready(true);
        assert!(cons.is_ready());

        let desc = cons.descriptor();
        assert_eq!(desc.sample_rate, 48000);
        assert_eq!(desc.channels, 2);
        assert_eq!(desc.ring_cap, sizes.ring_cap);
        assert_eq!(desc.frame_elems, 480);
        assert_eq!(desc.jitter_frames, 20);
        assert_eq!(desc.target_ms, 100);
        assert!(desc.ready);

        prod.shared().set_ready(false);
        assert!(!cons.is_ready());
    }
}
