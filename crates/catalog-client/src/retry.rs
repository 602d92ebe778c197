use std::time::Duration;

/// Bounded exponential backoff: attempt `n` (zero based) that fails waits
/// `base_delay * 2^n` before attempt `n + 1`. No wait follows the last attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }

    /// Sum of every inter-attempt pause when all attempts fail.
    pub fn total_backoff(&self) -> Duration {
        (0..self.attempts.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Self::DEFAULT_BASE_DELAY)
    }
}

/// Connect failures and read/write timeouts are worth another attempt;
/// everything else (bad URL, TLS, body errors) is not.
pub(crate) fn is_retryable(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}
