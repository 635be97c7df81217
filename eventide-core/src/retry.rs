//! Bounded retry with jittered exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// How many times to retry a conflicting write, and how long to wait between
/// attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            min_delay,
            max_delay,
        }
    }

    /// Fail on the first conflict.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Aggregate commits: 4 retries between 100ms and 2s.
    #[must_use]
    pub const fn commit_default() -> Self {
        Self::new(4, Duration::from_millis(100), Duration::from_secs(2))
    }

    /// Read-model writes: one immediate-ish retry.
    #[must_use]
    pub const fn read_model_default() -> Self {
        Self::new(1, Duration::ZERO, Duration::from_millis(50))
    }

    /// Whether retry number `retry` (1-based) is allowed.
    #[must_use]
    pub const fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// The ceiling doubles with each retry, capped at `max_delay`; the actual
    /// delay is drawn uniformly between `min_delay` and that ceiling.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.min_delay.max(Duration::from_millis(1));
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        let ceiling = base.saturating_mul(factor).min(self.max_delay);
        if ceiling <= self.min_delay {
            return self.min_delay.min(self.max_delay);
        }
        let low = u64::try_from(self.min_delay.as_micros()).unwrap_or(u64::MAX);
        let high = u64::try_from(ceiling.as_micros()).unwrap_or(u64::MAX);
        Duration::from_micros(rand::thread_rng().gen_range(low..=high))
    }

    /// Sleep before retry number `retry`. Returns `false` if cancelled first.
    pub async fn backoff(&self, retry: u32, cancel: &CancellationToken) -> bool {
        let delay = self.delay_for(retry);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::commit_default()
    }
}
