use std::time::Duration;

pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(3600);
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Retry strategy for webhook delivery
///
/// After the n-th failed attempt (1-indexed) the next attempt is delayed
/// by `min(base * 2^(n-1), cap)`, plus up to `jitter_ratio` of that delay,
/// never exceeding `cap`. The base comes from the subscription.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    cap: Duration,

    jitter_ratio: f64,
}

impl RetryStrategy {
    pub fn new(cap: Duration, jitter_ratio: f64) -> Self {
        Self {
            cap,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Same curve without jitter; used where reproducible delays matter.
    pub fn without_jitter(cap: Duration) -> Self {
        Self::new(cap, 0.0)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Deterministic part of the delay after `failed_attempts` failures.
    pub fn backoff(&self, base: Duration, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(63);
        let multiplier = 2_u64.saturating_pow(exponent);
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(multiplier));

        delay.min(self.cap)
    }

    /// Delay before the next attempt, jittered to spread retries that were
    /// scheduled at the same instant.
    pub fn next_delay(&self, base: Duration, failed_attempts: u32) -> Duration {
        let delay = self.backoff(base, failed_attempts);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        let spread = (delay_ms as f64 * self.jitter_ratio) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            fastrand::u64(0..=spread)
        };

        Duration::from_millis(delay_ms.saturating_add(jitter)).min(self.cap)
    }

    /// Whether another attempt is allowed after `attempt_count` attempts.
    pub fn should_retry(&self, attempt_count: u32, max_attempts: u32) -> bool {
        attempt_count < max_attempts
    }

    /// Every non-success response is retried, 4xx included.
    pub fn should_retry_status(&self, status_code: u16) -> bool {
        status_code >= 400
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_CAP, DEFAULT_JITTER_RATIO)
    }
}
