//! Ownership wrappers over the libopus multistream API
//!
//! The decoder is the only piece the pipeline needs; the encoder is
//! here for the loopback binary and for synthesizing well-formed
//! packets in tests. Both wrappers own a raw libopus handle and free
//! it on drop. They are `Send` (moved onto the feeder thread after
//! creation) but not `Sync`; each handle has exactly one user.

use crate::audio::sizing::OpusStreamConfig;
use audiopus_sys as sys;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;
use std::ptr;

/// A libopus failure: the raw return code plus its `opus_strerror` text.
#[derive(Debug, Clone, Copy)]
pub struct OpusError {
    pub code: i32,
}

impl OpusError {
    fn message(&self) -> &'static str {
        // opus_strerror returns a pointer to a static string for any input
        unsafe {
            let msg = sys::opus_strerror(self.code as c_int);
            CStr::from_ptr(msg).to_str().unwrap_or("unknown error")
        }
    }
}

impl fmt::Display for OpusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opus error {}: {}", self.code, self.message())
    }
}

impl std::error::Error for OpusError {}

fn check(rc: i32) -> Result<usize, OpusError> {
    if rc >= 0 {
        Ok(rc as usize)
    } else {
        Err(OpusError { code: rc })
    }
}

fn validate(cfg: &OpusStreamConfig) -> Result<(), OpusError> {
    let bad = OpusError {
        code: sys::OPUS_BAD_ARG as i32,
    };
    if cfg.channel_count == 0 || cfg.channel_count > cfg.mapping.len() {
        return Err(bad);
    }
    if cfg.streams <= 0 || cfg.coupled_streams < 0 || cfg.coupled_streams > cfg.streams {
        return Err(bad);
    }
    Ok(())
}

/// Multistream Opus decoder. Touched only by the feeder once the
/// pipeline is running.
pub struct MsDecoder {
    raw: *mut sys::OpusMSDecoder,
}

unsafe impl Send for MsDecoder {}

impl MsDecoder {
    pub fn new(cfg: &OpusStreamConfig) -> Result<Self, OpusError> {
        validate(cfg)?;
        let mut err: c_int = 0;
        let raw = unsafe {
            sys::opus_multistream_decoder_create(
                cfg.sample_rate,
                cfg.channel_count as c_int,
                cfg.streams,
                cfg.coupled_streams,
                cfg.mapping.as_ptr(),
                &mut err,
            )
        };
        if raw.is_null() {
            return Err(OpusError { code: err });
        }
        Ok(Self { raw })
    }

    /// Decode one packet into `pcm` (interleaved i16, sized for the
    /// decoder's channel count). Returns samples decoded per channel.
    pub fn decode(
        &mut self,
        packet: &[u8],
        pcm: &mut [i16],
        samples_per_frame: usize,
    ) -> Result<usize, OpusError> {
        let rc = unsafe {
            sys::opus_multistream_decode(
                self.raw,
                packet.as_ptr(),
                packet.len() as i32,
                pcm.as_mut_ptr(),
                samples_per_frame as c_int,
                0,
            )
        };
        check(rc)
    }

    /// Ask the decoder for a concealment frame (null-packet PLC).
    pub fn decode_lost(
        &mut self,
        pcm: &mut [i16],
        samples_per_frame: usize,
    ) -> Result<usize, OpusError> {
        let rc = unsafe {
            sys::opus_multistream_decode(
                self.raw,
                ptr::null(),
                0,
                pcm.as_mut_ptr(),
                samples_per_frame as c_int,
                0,
            )
        };
        check(rc)
    }
}

impl Drop for MsDecoder {
    fn drop(&mut self) {
        unsafe { sys::opus_multistream_decoder_destroy(self.raw) };
    }
}

/// Multistream Opus encoder. Not part of the playback path; used by
/// the loopback binary and by tests to produce real packets.
pub struct MsEncoder {
    raw: *mut sys::OpusMSEncoder,
}

unsafe impl Send for MsEncoder {}

impl MsEncoder {
    pub fn new(cfg: &OpusStreamConfig) -> Result<Self, OpusError> {
        validate(cfg)?;
        let mut err: c_int = 0;
        let raw = unsafe {
            sys::opus_multistream_encoder_create(
                cfg.sample_rate,
                cfg.channel_count as c_int,
                cfg.streams,
                cfg.coupled_streams,
                cfg.mapping.as_ptr(),
                sys::OPUS_APPLICATION_AUDIO as c_int,
                &mut err,
            )
        };
        if raw.is_null() {
            return Err(OpusError { code: err });
        }
        Ok(Self { raw })
    }

    /// Encode `samples_per_frame` samples per channel of interleaved
    /// i16 PCM. Returns the packet length written into `out`.
    pub fn encode(
        &mut self,
        pcm: &[i16],
        samples_per_frame: usize,
        out: &mut [u8],
    ) -> Result<usize, OpusError> {
        let rc = unsafe {
            sys::opus_multistream_encode(
                self.raw,
                pcm.as_ptr(),
                samples_per_frame as c_int,
                out.as_mut_ptr(),
                out.len() as i32,
            )
        };
        check(rc)
    }
}

impl Drop for MsEncoder {
    fn drop(&mut self) {
        unsafe { sys::opus_multistream_encoder_destroy(self.raw) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_cfg() -> OpusStreamConfig {
        OpusStreamConfig::stereo(48000, 480)
    }

    fn sine_frame(cfg: &OpusStreamConfig) -> Vec<i16> {
        let mut pcm = vec![0i16; cfg.samples_per_frame * cfg.channel_count];
        for (i, frame) in pcm.chunks_mut(cfg.channel_count).enumerate() {
            let t = i as f32 / cfg.sample_rate as f32;
            let s = (f32::sin(2.0 * std::f32::consts::PI * 440.0 * t) * 12000.0) as i16;
            for ch in frame.iter_mut() {
                *ch = s;
            }
        }
        pcm
    }

    #[test]
    fn decoder_rejects_inconsistent_config() {
        let mut cfg = stereo_cfg();
        cfg.streams = 0;
        assert!(MsDecoder::new(&cfg).is_err());
        let mut cfg = stereo_cfg();
        cfg.coupled_streams = 5;
        assert!(MsDecoder::new(&cfg).is_err());
    }

    #[test]
    fn encode_decode_round_trip_sample_count() {
        let cfg = stereo_cfg();
        let mut enc = MsEncoder::new(&cfg).unwrap();
        let mut dec = MsDecoder::new(&cfg).unwrap();

        let pcm = sine_frame(&cfg);
        let mut packet = vec![0u8; 4000];
        let mut out = vec![0i16; cfg.samples_per_frame * cfg.channel_count];

        // A decoded packet always yields exactly samples_per_frame
        // samples per channel
        for _ in 0..5 {
            let len = enc.encode(&pcm, cfg.samples_per_frame, &mut packet).unwrap();
            assert!(len > 0);
            let n = dec
                .decode(&packet[..len], &mut out, cfg.samples_per_frame)
                .unwrap();
            assert_eq!(n, cfg.samples_per_frame);
        }
    }

    #[test]
    fn lost_packet_concealment_produces_a_full_frame() {
        let cfg = stereo_cfg();
        let mut enc = MsEncoder::new(&cfg).unwrap();
        let mut dec = MsDecoder::new(&cfg).unwrap();

        // Prime the decoder with one real packet so PLC has context
        let pcm = sine_frame(&cfg);
        let mut packet = vec![0u8; 4000];
        let len = enc.encode(&pcm, cfg.samples_per_frame, &mut packet).unwrap();
        let mut out = vec![0i16; cfg.samples_per_frame * cfg.channel_count];
        dec.decode(&packet[..len], &mut out, cfg.samples_per_frame)
            .unwrap();

        let n = dec.decode_lost(&mut out, cfg.samples_per_frame).unwrap();
        assert_eq!(n, cfg.samples_per_frame);
    }

    #[test]
    fn garbage_packets_fail_cleanly() {
        let cfg = stereo_cfg();
        let mut dec = MsDecoder::new(&cfg).unwrap();
        let mut out = vec![0i16; cfg.samples_per_frame * cfg.channel_count];
        // A packet this malformed must error, not crash; the error
        // carries the libopus code
        let garbage = [0xFFu8; 7];
        let err = dec
            .decode(&garbage, &mut out, cfg.samples_per_frame)
            .unwrap_err();
        assert!(err.code < 0);
        assert!(!err.to_string().is_empty());
    }
}
