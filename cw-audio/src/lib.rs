//! CastWay audio renderer
//!
//! Real-time Opus decode-and-playback pipeline for the CastWay
//! streaming client: packets in from the session layer's network
//! thread, decoded PCM out to a device buffer pool or a host
//! scheduler's shared frame ring.

#[macro_use]
pub mod core;
pub mod audio;
pub mod sink;

// Re-export commonly used items
pub use audio::{AudioPipeline, OpusStreamConfig};
pub use sink::SinkProfile;
