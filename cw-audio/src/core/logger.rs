//! Configurable logging macros for cw-audio
//!
//! Every log line goes through [`emit`], which prefixes a monotonic
//! timestamp, caps the message at 1024 bytes and optionally mirrors the
//! line to a remote TCP collector (useful when the client runs on a
//! device without an accessible console). Debug and verbose lines are
//! gated on the [`VERBOSE`]/[`DEBUG`] flags below, set once from the
//! CLI before the pipeline starts.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Gates `log_verbose!` output.
pub static VERBOSE: AtomicBool = AtomicBool::new(false);
/// Gates `log_debug!` output.
pub static DEBUG: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

#[inline]
pub fn is_debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Maximum bytes per log line, including the level/tag prefix.
const MAX_LINE_BYTES: usize = 1024;

struct RemoteSink {
    addr: String,
    stream: Option<TcpStream>,
}

static REMOTE: Mutex<Option<RemoteSink>> = Mutex::new(None);
static START: OnceLock<Instant> = OnceLock::new();

/// Mirror every log line to `host:port` over TCP.
///
/// The connection is opened lazily on the next log line and re-opened
/// after a send failure. On the collector side: `nc -l -p 9999`.
pub fn set_remote_collector(addr: &str) {
    let mut remote = REMOTE.lock().unwrap_or_else(|e| e.into_inner());
    *remote = Some(RemoteSink {
        addr: addr.to_string(),
        stream: None,
    });
}

/// Format and deliver one log line. Called by the log macros only.
pub fn emit(prefix: &str, tag: &str, message: std::fmt::Arguments) {
    let elapsed = START.get_or_init(Instant::now).elapsed();
    let mut line = format!("{}[{}] {}", prefix, tag, message);
    if line.len() > MAX_LINE_BYTES {
        let mut cut = MAX_LINE_BYTES;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
    }

    eprintln!("{}", line);

    let mut remote = REMOTE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(sink) = remote.as_mut() {
        if sink.stream.is_none() {
            sink.stream = TcpStream::connect(&sink.addr).ok();
        }
        if let Some(stream) = sink.stream.as_mut() {
            let stamped = format!(
                "[{}.{:03}] {}\n",
                elapsed.as_secs(),
                elapsed.subsec_millis(),
                line
            );
            if stream.write_all(stamped.as_bytes()).is_err() {
                // Reconnect on the next line
                sink.stream = None;
            }
        }
    }
}

/// Debug log - only prints when debug mode is enabled
#[macro_export]
macro_rules! log_debug {
    ($tag:expr, $($arg:tt)*) => {
        if $crate::core::is_debug() {
            $crate::core::logger::emit("[DEBUG]", $tag, format_args!($($arg)*));
        }
    };
}

/// Verbose log - only prints when verbose mode is enabled
#[macro_export]
macro_rules! log_verbose {
    ($tag:expr, $($arg:tt)*) => {
        if $crate::core::is_verbose() {
            $crate::core::logger::emit("", $tag, format_args!($($arg)*));
        }
    };
}

/// Info log - always prints
#[macro_export]
macro_rules! log_info {
    ($tag:expr, $($arg:tt)*) => {
        $crate::core::logger::emit("", $tag, format_args!($($arg)*))
    };
}

/// Warning log - always prints with WARN prefix
#[macro_export]
macro_rules! log_warn {
    ($tag:expr, $($arg:tt)*) => {
        $crate::core::logger::emit("[WARN]", $tag, format_args!($($arg)*))
    };
}

/// Error log - always prints with ERROR prefix
#[macro_export]
macro_rules! log_error {
    ($tag:expr, $($arg:tt)*) => {
        $crate::core::logger::emit("[ERROR]", $tag, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn long_lines_are_capped() {
        // emit() must not panic on oversized or multibyte input
        let big = "x".repeat(4096);
        super::emit("", "LOG", format_args!("{}", big));
        let multibyte = "é".repeat(600);
        super::emit("", "LOG", format_args!("{}", multibyte));
    }
}
