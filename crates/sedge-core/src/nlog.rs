//! Leveled stderr logging for the I/O layer.
//!
//! # Environment Variables
//!
//! - `SEDGE_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `SEDGE_FLUSH_EPRINT=1` - Flush stderr after each line (useful when debugging crashes)
//!
//! # Usage
//!
//! ```ignore
//! use sedge_core::{nerror, nwarn, ninfo, ndebug, ntrace};
//!
//! ninfo!("worker {} started", name);
//! nwarn!("read clog tries exceeded on {}", conn);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables.
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("SEDGE_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("SEDGE_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: leveled line to stderr. The stderr lock keeps lines atomic
/// across worker threads.
#[doc(hidden)]
pub fn _nlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! nerror {
    ($($arg:tt)*) => {{
        $crate::nlog::_nlog_impl(
            $crate::nlog::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! nwarn {
    ($($arg:tt)*) => {{
        $crate::nlog::_nlog_impl(
            $crate::nlog::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! ninfo {
    ($($arg:tt)*) => {{
        $crate::nlog::_nlog_impl(
            $crate::nlog::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! ndebug {
    ($($arg:tt)*) => {{
        $crate::nlog::_nlog_impl(
            $crate::nlog::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ntrace {
    ($($arg:tt)*) => {{
        $crate::nlog::_nlog_impl(
            $crate::nlog::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}
