use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Estimated reset time: the time of the check plus the policy window.
    pub reset_at_ms: i64,
}

impl Decision {
    /// Whole seconds until `reset_at_ms`, rounded up. Never negative.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let wait_ms = u64::try_from(self.reset_at_ms.saturating_sub(now_ms)).unwrap_or(0);
        wait_ms.div_ceil(1000)
    }

    /// `reset_at_ms` as an RFC 3339 UTC timestamp with millisecond precision.
    pub fn reset_at_rfc3339(&self) -> String {
        humantime::format_rfc3339_millis(self.reset_at()).to_string()
    }

    /// `reset_at_ms` as a `SystemTime`. Pre-epoch values clamp to the epoch.
    pub fn reset_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(u64::try_from(self.reset_at_ms).unwrap_or(0))
    }
}
