//! File logging for orchestration runs.
//!
//! Log levels:
//! - ERROR: Failures that end a run or lose state (checkpoint writes, panicked workers)
//! - WARN: Recoverable surprises (corrupt checkpoint fallback, retry exhaustion)
//! - INFO: Run lifecycle (submit, start, wave completion, replanning, settle)
//! - DEBUG: Per-task transitions and dispatch decisions
//! - TRACE: Coordination loop internals
//!
//! Nothing is written until `init` is called, so library users and tests
//! stay silent. Debug mode can be enabled with `--debug` or
//! `WAVEFRONT_DEBUG=1`; `WAVEFRONT_DEBUG=trace` also writes TRACE lines.

use std::fmt::Arguments;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

struct Logger {
    path: PathBuf,
    max_level: LogLevel,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn level_from_env(value: Option<&str>) -> Option<LogLevel> {
    match value? {
        v if v.eq_ignore_ascii_case("trace") => Some(LogLevel::Trace),
        v if v == "1" || v.eq_ignore_ascii_case("true") => Some(LogLevel::Debug),
        _ => None,
    }
}

/// Start logging to `~/.wavefront/wavefront.log`, truncating the previous
/// process's log. Only the first call takes effect.
pub fn init(debug: bool) {
    let env = std::env::var("WAVEFRONT_DEBUG").ok();
    let max_level = match level_from_env(env.as_deref()) {
        Some(level) => level,
        None if debug => LogLevel::Debug,
        None => LogLevel::Info,
    };
    let Some(dir) = dirs::home_dir().map(|h| h.join(".wavefront")) else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join("wavefront.log");
    let _ = std::fs::write(&path, "");
    let _ = LOGGER.set(Logger { path, max_level });
}

/// Append one line at `level`. Used through the `wlog*` macros.
pub fn write(level: LogLevel, args: Arguments<'_>) {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    if level > logger.max_level {
        return;
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&logger.path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), args);
    }
}

#[macro_export]
macro_rules! wlog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Only written in debug mode.
#[macro_export]
macro_rules! wlog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Only written with `WAVEFRONT_DEBUG=trace`.
#[macro_export]
macro_rules! wlog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Trace, format_args!($($arg)*))
    };
}
