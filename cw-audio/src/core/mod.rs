//! Core module - logging and global flags

#[macro_use]
pub mod logger;

pub use logger::{is_debug, is_verbose, set_remote_collector, DEBUG, VERBOSE};
