//! Per-key exponential backoff.
//!
//! Keys are usually pod names. A failed start records a failure; while the
//! key's retry instant lies in the future, callers skip the work entirely.
//! A fully successful pass resets the key.
//!
//! All methods take `now` explicitly; nothing in here reads the wall clock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Idle time after which a key's history is forgotten.
    fn expiry(&self) -> Duration {
        self.max.saturating_mul(2)
    }
}

/// Backoff state for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffEntry {
    /// Consecutive failures since the last reset.
    pub attempts: u32,

    /// Instant before which work for this key is skipped.
    pub next_retry_at: DateTime<Utc>,

    /// Instant of the most recent failure.
    pub last_failure_at: DateTime<Utc>,
}

/// Keyed exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    policy: BackoffPolicy,
    entries: HashMap<String, BackoffEntry>,
}

impl Backoff {
    /// Create a backoff tracker with the given policy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// The policy in use.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Returns true while `key` is backed off at `now`.
    pub fn should_skip(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.next_retry_at > now)
    }

    /// Time left until `key` may be retried, if it is backed off.
    pub fn remaining(&self, key: &str, now: DateTime<Utc>) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        (entry.next_retry_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Record a failure for `key` and return the delay now in effect.
    ///
    /// A key idle for longer than twice the maximum delay starts over from
    /// the base delay.
    pub fn record_failure(&mut self, key: &str, now: DateTime<Utc>) -> Duration {
        let expiry = self.policy.expiry();
        let attempts = match self.entries.get(key) {
            Some(entry) if !idle_longer_than(entry.last_failure_at, now, expiry) => entry.attempts,
            _ => 0,
        };

        let delay = self.policy.delay(attempts);
        let next_retry_at = add(now, delay);

        self.entries.insert(
            key.to_string(),
            BackoffEntry {
                attempts: attempts.saturating_add(1),
                next_retry_at,
                last_failure_at: now,
            },
        );

        delay
    }

    /// Clear backoff for `key` (on success).
    pub fn reset(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Current state for `key`.
    pub fn entry(&self, key: &str) -> Option<&BackoffEntry> {
        self.entries.get(key)
    }

    /// Consecutive failures recorded for `key`.
    pub fn attempts(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |entry| entry.attempts)
    }

    /// Drop keys that have been idle past the expiry window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let expiry = self.policy.expiry();
        self.entries
            .retain(|_, entry| !idle_longer_than(entry.last_failure_at, now, expiry));
    }
}

fn idle_longer_than(since: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - since).to_std() {
        Ok(idle) => idle > window,
        // `since` lies in the future; the clock went backwards.
        Err(_) => false,
    }
}

fn add(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_policy_delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
        };

        assert_eq!(policy.delay(0), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(20));
        assert_eq!(policy.delay(2), Duration::from_secs(40));
        assert_eq!(policy.delay(3), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_key_not_skipped() {
        let backoff = Backoff::default();
        assert!(!backoff.should_skip("pod-a", t0()));
        assert_eq!(backoff.remaining("pod-a", t0()), None);
    }

    #[test]
    fn test_failure_skips_until_retry_instant() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
        });

        let delay = backoff.record_failure("pod-a", t0());
        assert_eq!(delay, Duration::from_secs(10));

        assert!(backoff.should_skip("pod-a", t0()));
        assert!(backoff.should_skip("pod-a", t0() + secs(9)));
        assert!(!backoff.should_skip("pod-a", t0() + secs(10)));
        assert!(!backoff.should_skip("pod-b", t0()));
        assert_eq!(
            backoff.remaining("pod-a", t0() + secs(4)),
            Some(Duration::from_secs(6))
        );
    }

    #[test]
    fn test_consecutive_failures_grow() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
        });

        assert_eq!(backoff.record_failure("pod-a", t0()), Duration::from_secs(10));
        assert_eq!(
            backoff.record_failure("pod-a", t0() + secs(10)),
            Duration::from_secs(20)
        );
        assert_eq!(
            backoff.record_failure("pod-a", t0() + secs(30)),
            Duration::from_secs(40)
        );
        assert_eq!(backoff.attempts("pod-a"), 3);
    }

    #[test]
    fn test_reset_clears_key() {
        let mut backoff = Backoff::default();
        backoff.record_failure("pod-a", t0());
        backoff.reset("pod-a");

        assert!(!backoff.should_skip("pod-a", t0()));
        assert_eq!(backoff.attempts("pod-a"), 0);
        assert!(backoff.entry("pod-a").is_none());
    }

    #[test]
    fn test_idle_key_starts_over() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
        });

        backoff.record_failure("pod-a", t0());
        backoff.record_failure("pod-a", t0() + secs(10));

        // Idle for more than 2 * max.
        let delay = backoff.record_failure("pod-a", t0() + secs(200));
        assert_eq!(delay, Duration::from_secs(10));
        assert_eq!(backoff.attempts("pod-a"), 1);
    }

    #[test]
    fn test_prune_drops_expired() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
        });

        backoff.record_failure("old", t0());
        backoff.record_failure("fresh", t0() + secs(100));
        backoff.prune(t0() + secs(150));

        assert!(backoff.entry("old").is_none());
        assert!(backoff.entry("fresh").is_some());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delay_never_exceeds_max(
                base_ms in 1u64..10_000,
                max_ms in 1u64..1_000_000,
                attempt in 0u32..64,
            ) {
                let policy = BackoffPolicy {
                    base: Duration::from_millis(base_ms),
                    max: Duration::from_millis(max_ms),
                };
                prop_assert!(policy.delay(attempt) <= policy.max);
            }

            #[test]
            fn delay_is_monotonic(attempt in 0u32..63) {
                let policy = BackoffPolicy::default();
                prop_assert!(policy.delay(attempt) <= policy.delay(attempt + 1));
            }
        }
    }
}
