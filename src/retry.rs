// =============================================================================
// RetryPolicy — exponential backoff bounded by a total-elapsed-time budget
// =============================================================================
//
// Wrapped around a specific fallible call at its call site (connect, preload
// fetch). The attempt count is uncapped; the budget is on wall-clock time.
// When the budget is exhausted the last error propagates to the owning task.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt; doubles each failure.
    base_delay: Duration,
    /// Ceiling for a single backoff delay.
    max_delay: Duration,
    /// Total elapsed-time budget across all attempts.
    budget: Duration,
}

impl RetryPolicy {
    pub fn new(budget: Duration) -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            budget,
        }
    }

    /// Run `op` until it succeeds or the elapsed-time budget is exhausted.
    ///
    /// The delay before attempt `n` is `base_delay * 2^(n-1)`, capped at
    /// `max_delay`. A delay that would overshoot the budget is not slept;
    /// the last error is returned instead.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;

                    if started.elapsed() + delay >= self.budget {
                        return Err(e).with_context(|| {
                            format!(
                                "{what}: retry budget ({:?}) exhausted after {attempt} attempt(s)",
                                self.budget
                            )
                        });
                    }

                    warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20); // 2^20 * base already dwarfs any sane cap
        let delay = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}
