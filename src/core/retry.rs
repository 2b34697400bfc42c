use std::time::Duration;

/// Bounded retry policy for connection opens.
///
/// Policy lives outside the connection manager so callers can pick fixed
/// delays or backoff per deployment; the manager only cares about the attempt
/// bound and the wait between attempts.
pub trait RetryStrategy: Clone + Send + Sync + 'static {
    /// Total attempts before the open is abandoned. Always at least 1.
    fn max_attempts(&self) -> u32;

    /// Delay before retry number `attempt` (1-based, so `attempt` is the
    /// number of the failed attempt that preceded the wait).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Fixed number of attempts with a constant delay between them.
#[derive(Clone, Copy, Debug)]
pub struct FixedRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl FixedRetry {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for FixedRetry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryStrategy for FixedRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff with a cap, bounded by an attempt count.
#[derive(Clone, Copy, Debug)]
pub struct BackoffRetry {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl BackoffRetry {
    pub fn new(attempts: u32, base: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            1.5
        };
        Self {
            attempts: attempts.max(1),
            base,
            max,
            factor,
        }
    }
}

impl Default for BackoffRetry {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30), 1.5)
    }
}

impl RetryStrategy for BackoffRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = self.base.as_secs_f64() * self.factor.powi(exp as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}
