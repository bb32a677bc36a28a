//! Generic exponential-backoff scheduler keyed by opaque string.
//!
//! Shared by the container manager (`image:<image>`, `service:<app>:<svc>`)
//! and the sensor adapter manager (`sensor:<name>`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff policy: attempt `n` waits `min(base · 2^(n-1), cap)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(5 * 60),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts }
    }

    /// Delay before the next attempt, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let delay = self.base.saturating_mul(factor.min(u32::MAX as u64) as u32);
        delay.min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub attempt: u32,
    pub last_error: String,
    pub next_attempt_at: DateTime<Utc>,
}

/// Tracks failure counts and next-attempt deadlines per key.
///
/// `record_success` erases the entry, so a recovered key starts fresh.
#[derive(Debug, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, RetryEntry>>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, entries: Mutex::new(HashMap::new()) }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// True on first sight of `key`; afterwards true iff the backoff deadline
    /// has passed and attempts are not exhausted.
    pub fn should_retry(&self, key: &str) -> bool {
        self.should_retry_at(key, Utc::now())
    }

    pub fn should_retry_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            None => true,
            Some(entry) => {
                entry.attempt < self.policy.max_attempts && now >= entry.next_attempt_at
            }
        }
    }

    /// Record a failure and return the updated entry.
    pub fn record_failure(&self, key: &str, error: impl Into<String>) -> RetryEntry {
        self.record_failure_at(key, error, Utc::now())
    }

    pub fn record_failure_at(
        &self,
        key: &str,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> RetryEntry {
        let mut entries = self.entries.lock().unwrap();
        let attempt = entries.get(key).map(|e| e.attempt).unwrap_or(0) + 1;
        let delay = self.policy.backoff(attempt);
        let entry = RetryEntry {
            attempt,
            last_error: error.into(),
            next_attempt_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
        };
        entries.insert(key.to_string(), entry.clone());
        entry
    }

    pub fn record_success(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn entry(&self, key: &str) -> Option<RetryEntry> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn exhausted(&self, key: &str) -> bool {
        self.entry(key)
            .map(|e| e.attempt >= self.policy.max_attempts)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(300), 10)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = fast_policy();
        assert_eq!(p.backoff(1), Duration::from_secs(10));
        assert_eq!(p.backoff(2), Duration::from_secs(20));
        assert_eq!(p.backoff(3), Duration::from_secs(40));
        assert_eq!(p.backoff(5), Duration::from_secs(160));
        // 10 · 2^5 = 320 > cap
        assert_eq!(p.backoff(6), Duration::from_secs(300));
        assert_eq!(p.backoff(10), Duration::from_secs(300));
        // No overflow on absurd attempt counts
        assert_eq!(p.backoff(200), Duration::from_secs(300));
    }

    #[test]
    fn first_sight_always_retries() {
        let mgr = RetryManager::new(fast_policy());
        assert!(mgr.should_retry("image:nginx:alpine"));
    }

    #[test]
    fn failure_schedules_next_attempt() {
        let mgr = RetryManager::new(fast_policy());
        let now = Utc::now();
        let entry = mgr.record_failure_at("k", "pull failed", now);
        assert_eq!(entry.attempt, 1);
        assert_eq!(entry.next_attempt_at, now + chrono::Duration::seconds(10));

        // Deadline not reached yet.
        assert!(!mgr.should_retry_at("k", now + chrono::Duration::seconds(5)));
        // Deadline passed.
        assert!(mgr.should_retry_at("k", now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn attempts_exhaust() {
        let mgr = RetryManager::new(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            3,
        ));
        let now = Utc::now();
        for _ in 0..3 {
            mgr.record_failure_at("k", "boom", now);
        }
        assert!(mgr.exhausted("k"));
        // Even far past the deadline, exhausted keys never retry.
        assert!(!mgr.should_retry_at("k", now + chrono::Duration::days(1)));
    }

    #[test]
    fn success_erases_entry() {
        let mgr = RetryManager::new(fast_policy());
        mgr.record_failure("k", "boom");
        assert!(mgr.entry("k").is_some());
        mgr.record_success("k");
        assert!(mgr.entry("k").is_none());
        assert!(mgr.should_retry("k"));
    }

    #[test]
    fn keys_are_independent() {
        let mgr = RetryManager::new(fast_policy());
        let now = Utc::now();
        mgr.record_failure_at("image:a", "boom", now);
        assert!(!mgr.should_retry_at("image:a", now));
        assert!(mgr.should_retry_at("image:b", now));
    }
}
