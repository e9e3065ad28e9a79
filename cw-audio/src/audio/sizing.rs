//! Session configuration and derived buffer sizing
//!
//! All capacities are fixed once at init from the negotiated Opus
//! stream parameters and the jitter target; nothing resizes at runtime.

/// Opus multistream parameters negotiated by the session layer.
/// Immutable for the lifetime of the pipeline.
#[derive(Debug, Clone)]
pub struct OpusStreamConfig {
    pub sample_rate: i32,
    pub channel_count: usize,
    pub samples_per_frame: usize,
    pub streams: i32,
    pub coupled_streams: i32,
    /// Channel-to-stream mapping table; the first `channel_count`
    /// entries are meaningful.
    pub mapping: [u8; 8],
}

impl OpusStreamConfig {
    /// Standard stereo configuration (one coupled stream).
    pub fn stereo(sample_rate: i32, samples_per_frame: usize) -> Self {
        Self {
            sample_rate,
            channel_count: 2,
            samples_per_frame,
            streams: 1,
            coupled_streams: 1,
            mapping: [0, 1, 0, 0, 0, 0, 0, 0],
        }
    }
}

/// Default jitter target when the session layer does not override it.
pub const DEFAULT_JITTER_MS: u32 = 100;

/// Buffer capacities computed once at init.
#[derive(Debug, Clone, Copy)]
pub struct DerivedSizes {
    pub frame_duration_ms: f64,
    pub target_jitter_ms: u32,
    pub jitter_frames: usize,
    /// Encoded-packet queue capacity.
    pub pkt_cap: usize,
    /// Decoded-frame ring capacity (jitter depth plus burst slack).
    pub ring_cap: usize,
    /// Output buffer pool size (pull profile).
    pub num_buffers: usize,
    /// Channel count used downstream after any stereo fallback.
    pub effective_channels: usize,
    /// Interleaved samples per frame after any fallback.
    pub frame_elems: usize,
    /// Interleaved samples per frame at the decoder's channel count.
    /// The decode scratch is sized from this, never from the
    /// downmixed count, so the decoder cannot overrun it.
    pub decode_elems: usize,
}

impl DerivedSizes {
    pub fn compute(cfg: &OpusStreamConfig, jitter_override_ms: u32) -> Self {
        let target_jitter_ms = if jitter_override_ms != 0 {
            jitter_override_ms
        } else {
            DEFAULT_JITTER_MS
        };
        let frame_duration_ms =
            cfg.samples_per_frame as f64 * 1000.0 / cfg.sample_rate as f64;
        let jitter_frames = (target_jitter_ms as f64 / frame_duration_ms).ceil() as usize;

        let effective_channels = match cfg.channel_count {
            2 | 6 | 8 => cfg.channel_count,
            _ => 2,
        };

        Self {
            frame_duration_ms,
            target_jitter_ms,
            jitter_frames,
            pkt_cap: (jitter_frames * 4).max(64),
            ring_cap: (jitter_frames * 4).max(32),
            num_buffers: jitter_frames.max(10),
            effective_channels,
            frame_elems: cfg.samples_per_frame * effective_channels,
            decode_elems: cfg.samples_per_frame * cfg.channel_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_5ms_frames_default_jitter() {
        let cfg = OpusStreamConfig::stereo(48000, 240);
        let sizes = DerivedSizes::compute(&cfg, 0);
        assert_eq!(sizes.frame_duration_ms, 5.0);
        assert_eq!(sizes.target_jitter_ms, 100);
        assert_eq!(sizes.jitter_frames, 20);
        assert_eq!(sizes.pkt_cap, 80);
        assert!(sizes.num_buffers >= 20);
        assert_eq!(sizes.frame_elems, 480);
    }

    #[test]
    fn stereo_10ms_frames_override_150() {
        let cfg = OpusStreamConfig::stereo(48000, 480);
        let sizes = DerivedSizes::compute(&cfg, 150);
        assert_eq!(sizes.frame_duration_ms, 10.0);
        assert_eq!(sizes.jitter_frames, 15);
        // 15 * 4 = 60 is below the floor
        assert_eq!(sizes.pkt_cap, 64);
        assert!(sizes.num_buffers >= 15);
    }

    #[test]
    fn jitter_frames_is_ceiling_of_target_over_duration() {
        for &(rate, spf) in &[
            (48000, 120),
            (48000, 240),
            (48000, 480),
            (48000, 960),
            (44100, 441),
            (24000, 480),
        ] {
            for &target in &[20u32, 60, 100, 150, 500] {
                let cfg = OpusStreamConfig::stereo(rate, spf);
                let sizes = DerivedSizes::compute(&cfg, target);
                let duration = spf as f64 * 1000.0 / rate as f64;
                assert_eq!(
                    sizes.jitter_frames,
                    (target as f64 / duration).ceil() as usize,
                    "rate={} spf={} target={}",
                    rate,
                    spf,
                    target
                );
            }
        }
    }

    #[test]
    fn unusual_channel_counts_fall_back_to_stereo() {
        for cc in [1usize, 3, 4, 5, 7] {
            let cfg = OpusStreamConfig {
                channel_count: cc,
                ..OpusStreamConfig::stereo(48000, 240)
            };
            let sizes = DerivedSizes::compute(&cfg, 0);
            assert_eq!(sizes.effective_channels, 2);
            assert_eq!(sizes.frame_elems, 480);
            // Scratch still follows the decoder's channel count
            assert_eq!(sizes.decode_elems, 240 * cc);
        }
        for cc in [2usize, 6, 8] {
            let cfg = OpusStreamConfig {
                channel_count: cc,
                ..OpusStreamConfig::stereo(48000, 240)
            };
            assert_eq!(DerivedSizes::compute(&cfg, 0).effective_channels, cc);
        }
    }

    #[test]
    fn ring_cap_covers_jitter_plus_burst() {
        for &target in &[20u32, 100, 1000] {
            let cfg = OpusStreamConfig::stereo(48000, 240);
            let sizes = DerivedSizes::compute(&cfg, target);
            assert!(sizes.ring_cap >= sizes.jitter_frames * 2);
            assert!(sizes.ring_cap >= 32);
        }
    }
}
