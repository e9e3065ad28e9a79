use anyhow::Result;
use clap::{Parser, ValueEnum};
use cw_audio::audio::{renderer, MsEncoder, OpusStreamConfig};
use cw_audio::{core, log_info, SinkProfile};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Loopback player: synthesizes a tone, encodes it with the
/// multistream encoder at the frame cadence and feeds the packets
/// through the renderer callbacks, exactly the way the session
/// layer's network thread would.
#[derive(Parser, Debug)]
#[command(author, version, about = "CastWay audio renderer loopback")]
struct Args {
    /// Which output profile to drive
    #[arg(long, value_enum, default_value_t = Profile::Pull)]
    profile: Profile,

    /// Jitter target override in ms (0 = default 100)
    #[arg(long, default_value_t = 0)]
    jitter_ms: u32,

    /// How long to play, in seconds
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    tone_hz: f32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Mirror log lines to a TCP collector (host:port)
    #[arg(long)]
    log_collector: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    /// Play through the default audio device
    Pull,
    /// Publish frames into the shared ring and drain them here
    Push,
}

const SAMPLE_RATE: i32 = 48000;
const SAMPLES_PER_FRAME: usize = 240; // 5 ms

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    core::VERBOSE.store(args.verbose, Ordering::SeqCst);
    if let Some(addr) = &args.log_collector {
        core::set_remote_collector(addr);
    }

    let cfg = OpusStreamConfig::stereo(SAMPLE_RATE, SAMPLES_PER_FRAME);

    let profile = match args.profile {
        Profile::Pull => SinkProfile::pull_device(),
        Profile::Push => SinkProfile::Push,
    };
    if renderer::init(&cfg, args.jitter_ms, profile) != 0 {
        anyhow::bail!("audio renderer init failed");
    }

    // Push profile: stand in for the host scheduler, draining the
    // shared ring at the frame cadence once the jitter depth is there
    let consumer_thread = if matches!(args.profile, Profile::Push) {
        let Some(mut consumer) = renderer::take_push_consumer() else {
            anyhow::bail!("push consumer unavailable");
        };
        let desc = consumer.descriptor();
        log_info!(
            "NET",
            "scheduler descriptor: {} Hz, {} ch, ring {} frames, jitter {}",
            desc.sample_rate,
            desc.channels,
            desc.ring_cap,
            desc.jitter_frames
        );
        Some(std::thread::spawn(move || {
            let mut frame = vec![0i16; consumer.frame_elems()];
            let mut drained = 0u64;
            let mut started = false;
            while consumer.is_ready() {
                if !started && consumer.frames_queued() < desc.jitter_frames {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                started = true;
                if consumer.poll_frame(&mut frame) {
                    drained += 1;
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            log_info!("NET", "scheduler drained {} frames", drained);
        }))
    } else {
        None
    };

    // The "network thread": encode and submit one packet per frame
    // period, like packets arriving off the wire
    let mut encoder = MsEncoder::new(&cfg)?;
    let frame_period = Duration::from_micros(
        (SAMPLES_PER_FRAME as u64 * 1_000_000) / SAMPLE_RATE as u64,
    );
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut pcm = vec![0i16; SAMPLES_PER_FRAME * 2];
    let mut packet = vec![0u8; 1500];
    let mut t = 0u64;
    let mut next = Instant::now();

    log_info!("NET", "streaming {} s of {} Hz tone", args.seconds, args.tone_hz);
    while Instant::now() < deadline {
        for (i, frame) in pcm.chunks_mut(2).enumerate() {
            let phase = (t + i as u64) as f32 / SAMPLE_RATE as f32;
            let s = (f32::sin(2.0 * std::f32::consts::PI * args.tone_hz * phase) * 9000.0) as i16;
            frame[0] = s;
            frame[1] = s;
        }
        t += SAMPLES_PER_FRAME as u64;

        let len = encoder.encode(&pcm, SAMPLES_PER_FRAME, &mut packet)?;
        renderer::decode_and_play_sample(&packet[..len]);

        next += frame_period;
        if let Some(sleep) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(sleep);
        }
    }

    if let Some(stats) = renderer::stats() {
        log_info!(
            "NET",
            "done: decoded={} errors={} plc={} overflows={} restarts={}",
            stats.decoded,
            stats.decode_errors,
            stats.plc_frames,
            stats.ring_overflows,
            stats.underrun_restarts
        );
    }
    renderer::cleanup();
    if let Some(handle) = consumer_thread {
        let _ = handle.join();
    }
    Ok(())
}
