use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Capped exponential reconnect delay.
///
/// `next_delay(n) = min(initial * 2^(n-1), max)` for the n-th consecutive
/// failure (n starts at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for computed delays.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

pub(crate) const fn default_initial_backoff_ms() -> u64 {
    500
}

pub(crate) const fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Delay to wait after the `retry_count`-th consecutive failure. A count of 0 reads as 1.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.max(1) - 1;
        let factor = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let base = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(base.min(self.max_backoff_ms))
    }
}

/// Decides which transport failures are surfaced to the `error` handler.
///
/// Before any message has been received, failures stay quiet until
/// `quiet_startup_retries` consecutive retries; after that, at most one error
/// is surfaced per `rate_limit` window.
#[derive(Debug, Clone)]
pub(crate) struct ErrorGate {
    rate_limit: Duration,
    quiet_startup_retries: u32,
    last_emitted: Option<Instant>,
}

impl ErrorGate {
    pub(crate) fn new(rate_limit: Duration, quiet_startup_retries: u32) -> Self {
        Self {
            rate_limit,
            quiet_startup_retries,
            last_emitted: None,
        }
    }

    pub(crate) fn admit(&mut self, now: Instant, retry_count: u32, received_any: bool) -> bool {
        if !received_any && retry_count < self.quiet_startup_retries {
            return false;
        }
        if let Some(last) = self.last_emitted
            && now.saturating_duration_since(last) < self.rate_limit
        {
            return false;
        }
        self.last_emitted = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sequence_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u128> = (1..=7).map(|n| policy.next_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn zero_count_and_huge_counts_stay_in_range() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::from_millis(500));
        assert_eq!(policy.next_delay(200), Duration::from_millis(5_000));
        let wide = BackoffPolicy::new(u64::MAX / 2, u64::MAX);
        assert_eq!(wide.next_delay(3).as_millis(), u64::MAX as u128);
    }

    #[test]
    fn serde_fills_missing_fields_with_defaults() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"max_backoff_ms": 800}"#).expect("parse");
        assert_eq!(policy.initial_backoff_ms, 500);
        assert_eq!(policy.next_delay(2), Duration::from_millis(800));
    }

    #[test]
    fn gate_is_quiet_on_startup_until_threshold() {
        let mut gate = ErrorGate::new(Duration::from_millis(1_500), 3);
        let now = Instant::now();
        assert!(!gate.admit(now, 1, false));
        assert!(!gate.admit(now, 2, false));
        assert!(gate.admit(now, 3, false));
    }

    #[test]
    fn gate_rate_limits_after_data() {
        let mut gate = ErrorGate::new(Duration::from_millis(1_500), 3);
        let start = Instant::now();
        assert!(gate.admit(start, 1, true));
        assert!(!gate.admit(start + Duration::from_millis(1_000), 2, true));
        assert!(gate.admit(start + Duration::from_millis(1_600), 3, true));
    }
}
