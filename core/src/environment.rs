//! Injected process environment: time source and host identity.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability.
///
/// Timestamps written into log records go through a `Clock`; elapsed times
/// are measured with a monotonic [`std::time::Instant`] and never with the clock.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Host name of this process, or `"unknown"`.
#[must_use]
pub fn hostname() -> String {
    read_hostname().unwrap_or_else(|| "unknown".to_string())
}

/// Instance identifier of this process.
///
/// Resolution order: `configured`, the `INSTANCE_ID` environment variable,
/// the host name, then the process id.
#[must_use]
pub fn instance_id(configured: Option<&str>) -> String {
    configured
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var("INSTANCE_ID").ok().filter(|s| !s.is_empty()))
        .or_else(read_hostname)
        .unwrap_or_else(|| std::process::id().to_string())
}

fn read_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}
