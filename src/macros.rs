// src/macros.rs

//
// Logging macros, shared crate-wide.
//
// With the `logging` feature the macros forward to `tracing`; without it
// everything but `log_error!` compiles away, and errors fall back to stderr.
//
// Per-delivery events in the consume loops go through log_trace so that a
// debug-level filter stays readable under load.
//

#![allow(unused_macros)]

macro_rules! log_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::error!($($arg)*);
        #[cfg(not(feature = "logging"))]
        eprintln!($($arg)*);
    };
}

macro_rules! log_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::warn!($($arg)*);
    };
}

macro_rules! log_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::info!($($arg)*);
    };
}

macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::debug!($($arg)*);
    };
}

macro_rules! log_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::trace!($($arg)*);
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_trace;
pub(crate) use log_warn;
