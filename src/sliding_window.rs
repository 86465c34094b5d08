//! Sliding window store.
//!
//! Each bucket keeps the epoch-millisecond timestamps of the requests it
//! admitted. A check prunes timestamps that fell out of the window, counts the
//! rest, and records the new request only if it is admitted.

use crate::decision::Decision;
use dashmap::DashMap;
use std::collections::VecDeque;

/// Buckets with no admitted request in this long are dropped by [`SlidingWindowStore::sweep`].
pub const DEFAULT_IDLE_THRESHOLD_MS: u64 = 15 * 60 * 1000;

/// In-memory map from bucket key to admitted-request timestamps.
///
/// Keys are sharded by `DashMap`; a check holds its shard's write guard for
/// the whole prune, count, append sequence.
#[derive(Debug, Default)]
pub struct SlidingWindowStore {
    buckets: DashMap<String, VecDeque<i64>>,
}

fn as_signed(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl SlidingWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `key` against a limit of `max_requests` per `window_ms` at `now_ms`.
    ///
    /// An admitted request consumes one slot; a denied one leaves the bucket as
    /// it was after pruning.
    pub fn check(&self, key: &str, window_ms: u64, max_requests: u64, now_ms: i64) -> Decision {
        let floor = now_ms.saturating_sub(as_signed(window_ms));

        let mut entry = self.buckets.entry(key.to_owned()).or_default();
        let timestamps = entry.value_mut();

        // Full filter rather than a prefix trim: a clock step backwards can
        // leave the deque out of order.
        timestamps.retain(|&ts| ts > floor);

        let active = timestamps.len() as u64;
        let reset_at_ms = now_ms.saturating_add(as_signed(window_ms));

        if active < max_requests {
            timestamps.push_back(now_ms);
            Decision {
                allowed: true,
                limit: max_requests,
                remaining: max_requests - active - 1,
                reset_at_ms,
            }
        } else {
            Decision {
                allowed: false,
                limit: max_requests,
                remaining: 0,
                reset_at_ms,
            }
        }
    }

    /// Remove every bucket that is empty or whose newest timestamp is at or
    /// before `now_ms - idle_threshold_ms`. Returns how many were removed.
    ///
    /// Policy windows play no part here: a bucket whose window expired but that
    /// saw traffic inside the idle threshold is kept as is.
    pub fn sweep(&self, now_ms: i64, idle_threshold_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(as_signed(idle_threshold_ms));
        let mut removed = 0;

        self.buckets.retain(|_, timestamps| {
            let keep = timestamps.iter().max().is_some_and(|&newest| newest > cutoff);
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Forget a bucket entirely. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Copy of the timestamps currently held for `key`, for diagnostics.
    pub fn timestamps(&self, key: &str) -> Option<Vec<i64>> {
        self.buckets
            .get(key)
            .map(|entry| entry.value().iter().copied().collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
