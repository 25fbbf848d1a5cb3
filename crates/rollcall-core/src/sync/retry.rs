//! Retry policy shared by the write batcher and the health monitor.

use std::future::Future;
use std::time::Duration;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

/// Bounded retry with a delay function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    #[must_use]
    pub const fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    #[must_use]
    pub const fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        }
    }

    /// Whether another attempt is allowed after `attempts` have failed
    #[must_use]
    pub const fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Run `operation` until it succeeds, a non-retryable error occurs, or
    /// attempts are exhausted. The delay precedes each attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            tokio::time::sleep(self.delay_for(attempt)).await;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if is_retryable(&error) && self.allows_retry(attempt) => {
                    tracing::debug!(attempt, "Retrying after failure");
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
