//! Syslog-style verbosity levels and per-API masks, routed to `tracing`.

use std::fmt::Arguments;

/// Levels 0..=7 follow syslog; 8 is the extra-debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
    ExtraDebug = 8,
}

impl LogLevel {
    pub fn from_raw(level: u8) -> LogLevel {
        match level {
            0 => LogLevel::Emergency,
            1 => LogLevel::Alert,
            2 => LogLevel::Critical,
            3 => LogLevel::Error,
            4 => LogLevel::Warning,
            5 => LogLevel::Notice,
            6 => LogLevel::Info,
            7 => LogLevel::Debug,
            _ => LogLevel::ExtraDebug,
        }
    }
}

/// Bitmask of enabled levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMask(pub u32);

impl LogMask {
    /// Everything up to and including `level`.
    pub fn up_to(level: LogLevel) -> LogMask {
        LogMask((2 << (level as u32)) - 1)
    }

    /// The default mask: up to Info.
    pub fn default_mask() -> LogMask {
        LogMask::up_to(LogLevel::Info)
    }

    pub fn wants(self, level: LogLevel) -> bool {
        self.0 & (1 << (level as u32)) != 0
    }

    pub fn with(self, level: LogLevel) -> LogMask {
        LogMask(self.0 | (1 << (level as u32)))
    }

    pub fn without(self, level: LogLevel) -> LogMask {
        LogMask(self.0 & !(1 << (level as u32)))
    }
}

/// Emit one masked log line through the single pluggable back-end
/// (the `tracing` subscriber).
pub fn vlog(mask: LogMask, level: LogLevel, origin: &str, args: Arguments<'_>) {
    if !mask.wants(level) {
        return;
    }
    match level {
        LogLevel::Emergency | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
            tracing::error!(target: "microbus", origin, "{args}");
        }
        LogLevel::Warning => tracing::warn!(target: "microbus", origin, "{args}"),
        LogLevel::Notice | LogLevel::Info => tracing::info!(target: "microbus", origin, "{args}"),
        LogLevel::Debug => tracing::debug!(target: "microbus", origin, "{args}"),
        LogLevel::ExtraDebug => tracing::trace!(target: "microbus", origin, "{args}"),
    }
}
