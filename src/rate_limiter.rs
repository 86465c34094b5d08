use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::decision::Decision;
use crate::error::{AdmissionError, Result};
use crate::identifier::bucket_key;
use crate::policy::{Policy, PolicyRegistry, DEFAULT_POLICY};
use crate::sliding_window::{SlidingWindowStore, DEFAULT_IDLE_THRESHOLD_MS};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const SWEEPER_IDLE: u8 = 0;
const SWEEPER_RUNNING: u8 = 1;
const SWEEPER_STOPPED: u8 = 2;

// Lives inside the sweeper task. When the task's future is dropped (abort,
// runtime shutdown) the state falls back to idle unless it was stopped.
struct SweeperGuard(Arc<AtomicU8>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        let _ = self.0.compare_exchange(
            SWEEPER_RUNNING,
            SWEEPER_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Admission decisions for request handlers.
///
/// Owns the bucket store and the background task that evicts idle buckets.
/// Build one per process (or per test), share it as `Arc<RateLimiter>`, and
/// call [`stop`](Self::stop) on shutdown.
pub struct RateLimiter {
    policies: PolicyRegistry,
    store: Arc<SlidingWindowStore>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    idle_threshold_ms: u64,
    sweeper_state: Arc<AtomicU8>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub buckets: usize,
    pub policies: usize,
    pub sweeper_running: bool,
}

impl RateLimiter {
    pub fn new(policies: PolicyRegistry) -> Self {
        Self {
            policies,
            store: Arc::new(SlidingWindowStore::new()),
            clock: Arc::new(SystemClock),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            sweeper_state: Arc::new(AtomicU8::new(SWEEPER_IDLE)),
            sweeper: Mutex::new(None),
        }
    }

    /// Built-in policies with sweep timing taken from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(PolicyRegistry::builtin())
            .with_sweep_interval(config.sweep_interval())
            .with_idle_threshold(config.idle_threshold())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Check and record a request by `identifier` under `policy`.
    ///
    /// # Panics
    ///
    /// If `policy` is not registered. Policy names are fixed at call sites, so
    /// an unknown one is a bug; it is never replaced by another policy's limits.
    pub fn admit(&self, policy: &str, identifier: &str) -> Decision {
        self.admit_at(policy, identifier, self.clock.now_ms())
    }

    /// [`admit`](Self::admit) under the default `api` policy.
    pub fn admit_default(&self, identifier: &str) -> Decision {
        self.admit(DEFAULT_POLICY, identifier)
    }

    /// [`admit`](Self::admit) at an explicit time.
    pub fn admit_at(&self, policy: &str, identifier: &str, now_ms: i64) -> Decision {
        match self.try_admit_at(policy, identifier, now_ms) {
            Ok(decision) => decision,
            Err(err) => panic!("{}", err),
        }
    }

    /// Non-panicking [`admit`](Self::admit): an unknown policy is returned as
    /// [`AdmissionError::UnknownPolicy`] and the request must be refused.
    pub fn try_admit(&self, policy: &str, identifier: &str) -> Result<Decision> {
        self.try_admit_at(policy, identifier, self.clock.now_ms())
    }

    pub fn try_admit_at(&self, policy: &str, identifier: &str, now_ms: i64) -> Result<Decision> {
        let rule = self.policies.lookup(policy).inspect_err(|_| {
            error!(
                target: "admission::rate_limiter",
                policy,
                identifier,
                "Admission requested for unknown policy; refusing request"
            );
        })?;

        self.ensure_sweeper();

        let key = bucket_key(&rule.name, identifier);
        let decision = self.store.check(&key, rule.window_ms, rule.max_requests, now_ms);

        if !decision.allowed {
            debug!(
                target: "admission::rate_limiter",
                policy,
                identifier,
                limit = decision.limit,
                reset_at_ms = decision.reset_at_ms,
                "Request denied"
            );
        }

        Ok(decision)
    }

    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Current time according to the limiter's clock.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Drop the bucket for `identifier` under `policy`. Returns whether one existed.
    pub fn reset(&self, policy: &str, identifier: &str) -> Result<bool> {
        let rule = self.policies.lookup(policy)?;
        let removed = self.store.remove(&bucket_key(&rule.name, identifier));
        if removed {
            info!(target: "admission::rate_limiter", policy, identifier, "Bucket reset");
        }
        Ok(removed)
    }

    /// Number of timestamps held for the bucket, if it exists. Diagnostic only.
    pub fn bucket_len(&self, policy: &str, identifier: &str) -> Option<usize> {
        self.store
            .timestamps(&bucket_key(policy, identifier))
            .map(|timestamps| timestamps.len())
    }

    /// Run one idle sweep now. Returns the number of evicted buckets.
    pub fn sweep_now(&self) -> usize {
        self.store.sweep(self.clock.now_ms(), self.idle_threshold_ms)
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            buckets: self.store.len(),
            policies: self.policies.len(),
            sweeper_running: self.is_sweeper_running(),
        }
    }

    pub fn is_sweeper_running(&self) -> bool {
        self.sweeper_state.load(Ordering::Acquire) == SWEEPER_RUNNING
    }

    /// Start the periodic idle sweep on the current tokio runtime.
    ///
    /// A sweeper whose task has died (its runtime shut down) is replaced.
    /// Returns `Ok(false)` if one is already running or it has been stopped.
    pub fn start_sweeper(&self) -> Result<bool> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            AdmissionError::Internal(format!("idle sweeper needs a tokio runtime: {}", e))
        })?;

        let mut handle_slot = self
            .sweeper
            .lock()
            .map_err(|_| AdmissionError::Internal("sweeper lock poisoned".to_string()))?;
        match self.sweeper_state.load(Ordering::Acquire) {
            SWEEPER_STOPPED => return Ok(false),
            SWEEPER_RUNNING if handle_slot.as_ref().is_some_and(|h| !h.is_finished()) => {
                return Ok(false)
            }
            _ => {}
        }

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let period = self.sweep_interval;
        let idle_threshold_ms = self.idle_threshold_ms;

        self.sweeper_state.store(SWEEPER_RUNNING, Ordering::Release);
        let guard = SweeperGuard(Arc::clone(&self.sweeper_state));

        let handle = runtime.spawn(async move {
            let _guard = guard;
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                let before = store.len();
                let removed = store.sweep(clock.now_ms(), idle_threshold_ms);
                debug!(
                    target: "admission::sweeper",
                    removed,
                    remaining = before.saturating_sub(removed),
                    "Idle sweep finished"
                );
            }
        });

        *handle_slot = Some(handle);
        info!(
            target: "admission::sweeper",
            interval_secs = period.as_secs(),
            idle_threshold_ms,
            "Idle sweeper started"
        );
        Ok(true)
    }

    /// Stop the idle sweep for good. Later admissions do not restart it.
    pub fn stop(&self) {
        self.sweeper_state.store(SWEEPER_STOPPED, Ordering::Release);
        let mut handle_slot = match self.sweeper.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = handle_slot.take() {
            handle.abort();
            info!(target: "admission::sweeper", "Idle sweeper stopped");
        }
    }

    // Lazily (re)start the sweeper inside a runtime. Lock-free unless idle.
    fn ensure_sweeper(&self) {
        if self.sweeper_state.load(Ordering::Acquire) != SWEEPER_IDLE
            || tokio::runtime::Handle::try_current().is_err()
        {
            return;
        }
        if let Err(err) = self.start_sweeper() {
            warn!(target: "admission::sweeper", error = %err, "Could not start idle sweeper");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(PolicyRegistry::builtin())
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policies", &self.policies)
            .field("buckets", &self.store.len())
            .field("clock", &self.clock)
            .field("sweep_interval", &self.sweep_interval)
            .field("idle_threshold_ms", &self.idle_threshold_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::SEARCH;

    fn limiter_with_clock(policies: PolicyRegistry) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(policies).with_clock(clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_quota_exactness() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        let limit = limiter.policy("upload").unwrap().max_requests;

        for expected in (0..limit).rev() {
            let decision = limiter.admit("upload", "user:1");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let decision = limiter.admit("upload", "user:1");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, limit);
    }

    #[test]
    fn test_window_recovery() {
        let (limiter, clock) = limiter_with_clock(PolicyRegistry::builtin());
        for _ in 0..5 {
            assert!(limiter.admit("rating", "ip:10.0.0.1").allowed);
        }
        assert!(!limiter.admit("rating", "ip:10.0.0.1").allowed);

        clock.advance(60_000);
        let decision = limiter.admit("rating", "ip:10.0.0.1");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_partial_expiry() {
        let policies = PolicyRegistry::empty().with_policy("burst", 100, 3).unwrap();
        let (limiter, clock) = limiter_with_clock(policies);

        for t in [0, 60, 120] {
            clock.set(t);
            assert!(limiter.admit("burst", "user:7").allowed);
        }

        clock.set(130);
        let decision = limiter.admit("burst", "user:7");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_key_isolation() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        for _ in 0..3 {
            limiter.admit("upload", "user:a");
        }
        assert!(!limiter.admit("upload", "user:a").allowed);

        let other = limiter.admit("upload", "user:b");
        assert!(other.allowed);
        assert_eq!(other.remaining, 2);
    }

    #[test]
    fn test_policies_do_not_share_quota() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        for _ in 0..3 {
            limiter.admit("upload", "user:a");
        }
        assert!(!limiter.admit("upload", "user:a").allowed);
        assert_eq!(limiter.admit("comment", "user:a").remaining, 9);
    }

    #[test]
    fn test_zero_limit_boundary() {
        let policies = PolicyRegistry::empty().with_policy("closed", 1_000, 0).unwrap();
        let (limiter, clock) = limiter_with_clock(policies);

        for _ in 0..5 {
            let decision = limiter.admit("closed", "user:1");
            assert!(!decision.allowed);
            assert_eq!(decision.remaining, 0);
            clock.advance(10);
        }
        assert_eq!(limiter.bucket_len("closed", "user:1"), Some(0));
    }

    #[test]
    fn test_search_scenario() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());

        for _ in 0..10 {
            assert!(limiter.admit_at(SEARCH, "ip:1.2.3.4", 0).allowed);
        }

        let eleventh = limiter.admit_at(SEARCH, "ip:1.2.3.4", 0);
        assert!(!eleventh.allowed);
        assert_eq!(eleventh.remaining, 0);
        assert_eq!(eleventh.limit, 10);

        let twelfth = limiter.admit_at(SEARCH, "ip:1.2.3.4", 10_001);
        assert!(twelfth.allowed);
        assert_eq!(twelfth.remaining, 9);
    }

    #[test]
    fn test_reset_at_is_now_plus_window() {
        let (limiter, clock) = limiter_with_clock(PolicyRegistry::builtin());
        clock.set(5_000);
        assert_eq!(limiter.admit("auth", "user:1").reset_at_ms, 5_000 + 3_600_000);
    }

    #[test]
    fn test_admit_default_uses_api_policy() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        let decision = limiter.admit_default("anonymous");
        assert_eq!(decision.limit, 30);
        assert_eq!(decision.remaining, 29);
        assert_eq!(limiter.bucket_len("api", "anonymous"), Some(1));
    }

    #[test]
    #[should_panic(expected = "Unknown rate limit policy 'downloads'")]
    fn test_admit_unknown_policy_panics() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        limiter.admit("downloads", "user:1");
    }

    #[test]
    fn test_try_admit_unknown_policy_fails_closed() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        let result = limiter.try_admit("downloads", "user:1");
        assert!(matches!(result, Err(AdmissionError::UnknownPolicy(_))));
        assert_eq!(limiter.stats().buckets, 0);
    }

    #[test]
    fn test_sweep_now_uses_idle_threshold() {
        let (limiter, clock) = limiter_with_clock(PolicyRegistry::builtin());
        limiter.admit("search", "user:old");
        clock.set(60_000);
        limiter.admit("search", "user:new");

        // user:old's search window expired long ago but it is not yet idle
        clock.set(DEFAULT_IDLE_THRESHOLD_MS as i64 - 1);
        assert_eq!(limiter.sweep_now(), 0);

        clock.set(DEFAULT_IDLE_THRESHOLD_MS as i64);
        assert_eq!(limiter.sweep_now(), 1);
        assert_eq!(limiter.bucket_len("search", "user:old"), None);
        assert_eq!(limiter.bucket_len("search", "user:new"), Some(1));
    }

    #[test]
    fn test_reset_bucket() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        for _ in 0..3 {
            limiter.admit("upload", "user:1");
        }
        assert!(limiter.reset("upload", "user:1").unwrap());
        assert!(limiter.admit("upload", "user:1").allowed);
        assert!(limiter.reset("nope", "user:1").is_err());
    }

    #[test]
    fn test_no_sweeper_without_runtime() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        limiter.admit("api", "user:1");
        assert!(!limiter.is_sweeper_running());
        assert!(limiter.start_sweeper().is_err());
    }

    #[tokio::test]
    async fn test_sweeper_starts_on_first_use() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        assert!(!limiter.is_sweeper_running());

        limiter.admit("api", "user:1");
        assert!(limiter.is_sweeper_running());
        assert!(!limiter.start_sweeper().unwrap());

        limiter.stop();
        assert!(!limiter.is_sweeper_running());

        // stays stopped
        limiter.admit("api", "user:1");
        assert!(!limiter.is_sweeper_running());
        assert!(!limiter.start_sweeper().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_buckets() {
        let (limiter, clock) = limiter_with_clock(PolicyRegistry::builtin());
        let limiter = limiter.with_sweep_interval(Duration::from_secs(60));

        limiter.admit("search", "user:1");
        limiter.admit("rating", "user:2");
        assert_eq!(limiter.stats().buckets, 2);

        clock.advance(DEFAULT_IDLE_THRESHOLD_MS as i64);
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.stats().buckets, 0);
        limiter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sweeper_does_not_evict() {
        let (limiter, clock) = limiter_with_clock(PolicyRegistry::builtin());
        let limiter = limiter.with_sweep_interval(Duration::from_secs(60));

        limiter.admit("search", "user:1");
        limiter.stop();

        clock.advance(DEFAULT_IDLE_THRESHOLD_MS as i64);
        tokio::time::sleep(Duration::from_secs(180)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.stats().buckets, 1);
    }

    fn current_thread_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_sweeper_restarts_after_runtime_shutdown() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());

        let first = current_thread_runtime();
        first.block_on(async {
            limiter.admit("api", "user:1");
        });
        assert!(limiter.is_sweeper_running());

        drop(first);
        assert!(!limiter.is_sweeper_running());

        let second = current_thread_runtime();
        second.block_on(async {
            limiter.admit("api", "user:1");
            assert!(limiter.is_sweeper_running());
            assert!(!limiter.start_sweeper().unwrap());
        });

        limiter.stop();
        assert!(!limiter.is_sweeper_running());
    }

    #[test]
    fn test_start_sweeper_replaces_dead_task() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());

        let first = current_thread_runtime();
        first.block_on(async {
            assert!(limiter.start_sweeper().unwrap());
        });
        drop(first);

        let second = current_thread_runtime();
        second.block_on(async {
            assert!(limiter.start_sweeper().unwrap());
            assert!(limiter.is_sweeper_running());
        });
        limiter.stop();
    }

    #[tokio::test]
    async fn test_admission_does_not_take_sweeper_lock_once_running() {
        let (limiter, _) = limiter_with_clock(PolicyRegistry::builtin());
        limiter.admit("api", "user:1");
        assert!(limiter.is_sweeper_running());

        // a std Mutex is not reentrant: admitting while holding it would hang
        let _held = limiter.sweeper.lock().unwrap();
        for n in 0..10 {
            limiter.admit("search", &format!("ip:10.0.0.{}", n));
        }
        assert_eq!(limiter.stats().buckets, 11);
    }
}
