//! Structured logging utilities for Tidepool components.
//!
//! Every macro tags the event with a `component` field so a single
//! `RUST_LOG`/`EnvFilter` stream can be split per subsystem.
//!
//! # Usage
//!
//! ```ignore
//! use tide_config::{log_cache_debug, log_offload_warn};
//!
//! log_cache_debug!(payload = %id, block = 3, "block evicted");
//! log_offload_warn!(error = %e, attempt, "upload failed, backing off");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CACHE: &'static str = "CACHE";
    pub const WAL: &'static str = "WAL";
    pub const OFFLOAD: &'static str = "OFFLOAD";
    pub const DEDUP: &'static str = "DEDUP";
    pub const STORE: &'static str = "STORE";
    pub const CONTENT: &'static str = "CONTENT";
    pub const DAEMON: &'static str = "DAEMON";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

// === CACHE logging macros ===

#[macro_export]
macro_rules! log_cache_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "CACHE", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_cache_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "CACHE", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_cache_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "CACHE", $($arg)+)
    };
}

// === WAL logging macros ===

#[macro_export]
macro_rules! log_wal_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "WAL", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_wal_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "WAL", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_wal_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "WAL", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_wal_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "WAL", $($arg)+)
    };
}

// === OFFLOAD logging macros ===

#[macro_export]
macro_rules! log_offload_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "OFFLOAD", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_offload_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "OFFLOAD", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_offload_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "OFFLOAD", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_offload_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "OFFLOAD", $($arg)+)
    };
}

// === DEDUP logging macros ===

/// Dedup inconsistencies are invariant violations; they always log at error level.
#[macro_export]
macro_rules! log_dedup_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "DEDUP", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_dedup_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "DEDUP", $($arg)+)
    };
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "STORE", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_store_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "STORE", $($arg)+)
    };
}

// === CONTENT logging macros ===

#[macro_export]
macro_rules! log_content_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "CONTENT", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_content_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "CONTENT", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_content_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "CONTENT", $($arg)+)
    };
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "DAEMON", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_daemon_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "DAEMON", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_daemon_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "DAEMON", $($arg)+)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `RUST_LOG` wins when set.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::CACHE, "CACHE");
        assert_eq!(Component::OFFLOAD, "OFFLOAD");
        assert_eq!(Component::DEDUP, "DEDUP");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_macros_expand() {
        init_logging(LogLevel::Error);
        log_cache_debug!(block = 1u64, "cache macro");
        log_dedup_error!(hash = "ab", "dedup macro");
        log_offload_info!("offload macro");
    }
}
