//! Exponential backoff policy for failed publish attempts.
//!
//! The policy is owned by the store: every `fail` call computes the next
//! `retry_after` from the record's retry count, and flips the record to
//! `DEAD` once the attempt ceiling is reached.
//!
//! Delay formula: `min(max_delay, base_delay * multiplier^retry_count)`,
//! plus optional jitter to avoid thundering-herd re-claims.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds
const DEFAULT_BASE_DELAY_MS: i64 = 200;

/// Default max delay in milliseconds (1 minute)
const DEFAULT_MAX_DELAY_MS: i64 = 60_000;

/// Default backoff multiplier
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (10%)
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Default max attempts before dead-lettering
const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Retry/backoff configuration shared by the outbox stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay in milliseconds (default: 200)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: i64,

    /// Maximum delay in milliseconds (default: 60000)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: i64,

    /// Growth factor per failed attempt (default: 2.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the delay (0.0-1.0, default: 0.1)
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,

    /// Failed attempts before a record becomes DEAD (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
}

fn default_base_delay() -> i64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay() -> i64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER_FACTOR
}

fn default_max_attempts() -> i32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl std::fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BackoffPolicy(base={}ms, max={}ms, x{}, jitter={:.1}%, max_attempts={})",
            self.base_delay_ms,
            self.max_delay_ms,
            self.multiplier,
            self.jitter_factor * 100.0,
            self.max_attempts
        )
    }
}

impl BackoffPolicy {
    /// The standard policy: 200ms base, 1 minute cap, x2, 10% jitter,
    /// 5 attempts.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Deterministic variant for tests: no jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before the attempt following `retry_count` previous failures.
    ///
    /// `retry_count = 0` yields the base delay; each further failure
    /// multiplies it until the cap.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exp = self.multiplier.powi(retry_count.max(0));
        let raw = (self.base_delay_ms as f64 * exp) as i64;
        let capped = raw.min(self.max_delay_ms);

        let jitter_range = (capped as f64 * self.jitter_factor) as i64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        Duration::milliseconds(capped + jitter)
    }

    /// Earliest re-claim time after the failure that brought the record to
    /// `retry_count` attempts.
    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
        // The first failure (count 1) waits the base delay.
        now + self.delay_for(retry_count - 1)
    }

    /// Whether `retry_count` failures exhaust the retry budget.
    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_attempts
    }

    /// Full delay schedule, useful for logging and tests.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|i| self.delay_for(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_defaults() {
        let policy = BackoffPolicy::standard();
        assert_eq!(policy.base_delay_ms, 200);
        assert_eq!(policy.max_delay_ms, 60_000);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter_factor, 0.1);
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = BackoffPolicy::standard().without_jitter();
        assert_eq!(policy.delay_for(0).num_milliseconds(), 200);
        assert_eq!(policy.delay_for(1).num_milliseconds(), 400);
        assert_eq!(policy.delay_for(2).num_milliseconds(), 800);
        assert_eq!(policy.delay_for(3).num_milliseconds(), 1600);
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::standard().without_jitter();
        assert_eq!(policy.delay_for(30).num_milliseconds(), 60_000);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            base_delay_ms: 1000,
            jitter_factor: 0.2,
            ..Default::default()
        };
        for _ in 0..50 {
            let ms = policy.delay_for(0).num_milliseconds();
            assert!((800..=1200).contains(&ms), "delay out of bounds: {}ms", ms);
        }
    }

    #[test]
    fn first_failure_waits_base_delay() {
        let policy = BackoffPolicy::standard().without_jitter();
        let now = Utc::now();
        let next = policy.next_retry_at(now, 1);
        assert_eq!((next - now).num_milliseconds(), 200);
    }

    #[test]
    fn retry_after_strictly_increases_until_cap() {
        let policy = BackoffPolicy::standard().without_jitter();
        let now = Utc::now();
        let mut last = now;
        for count in 1..=policy.max_attempts {
            let next = policy.next_retry_at(now, count);
            assert!(next > last, "retry_after did not increase at count {}", count);
            last = next;
        }
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let policy = BackoffPolicy::standard();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn schedule_length_matches_budget() {
        let policy = BackoffPolicy::standard().without_jitter();
        let schedule = policy.schedule();
        assert_eq!(schedule.len(), 5);
        assert_eq!(schedule[0].num_milliseconds(), 200);
    }

    #[test]
    fn serde_field_defaults() {
        let policy: BackoffPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.base_delay_ms, 200);
        assert_eq!(policy.max_attempts, 5);

        let policy: BackoffPolicy = serde_json::from_str(r#"{"max_attempts": 3}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 200);
    }
}
