use std::time::Duration;

/// Bounded exponential backoff for queued sync changes.
///
/// The delay before attempt `n + 1` after `n` failures is
/// `base * multiplier^(n - 1)`, capped at `cap`. There is no jitter, so
/// eligibility of a queued change is a pure function of its stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            multiplier: 2,
            cap: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `attempts`-th failure. Zero attempts means no
    /// failure yet and no delay.
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempts - 1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Unix time at which a change that has now failed `attempts` times may be
    /// retried.
    pub fn next_attempt_at(&self, now: i64, attempts: u32) -> i64 {
        let secs = i64::try_from(self.delay(attempts).as_secs()).unwrap_or(i64::MAX);
        now.saturating_add(secs)
    }
}
