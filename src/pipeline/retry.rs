//! Bounded retry with growing delay between attempts.

use crate::error::SyncError;
use crate::pipeline::RunHandle;
use std::future::Future;
use std::time::Duration;

/// Retry settings for one unit of remote work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least one)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff: f64,
    /// Ceiling on the delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff: 2.0,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Policy that waits the same `delay` between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: 1.0,
            max_delay: delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let delay = self.delay.mul_f64(factor.min(1e6));
        delay.min(self.max_delay.max(self.delay))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.run_observed(label, operation, |_, _| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry(attempt, error)` before each
    /// inter-attempt sleep.
    pub async fn run_observed<T, F, Fut, R>(
        &self,
        label: &str,
        operation: F,
        on_retry: R,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        R: FnMut(u32, &SyncError),
    {
        self.run_inner(label, None, operation, on_retry).await
    }

    /// Like [`run_observed`](Self::run_observed), bound to a run: the delay
    /// between attempts ends early on abort, and no retry is issued while the
    /// run is paused.
    pub async fn run_with_handle<T, F, Fut, R>(
        &self,
        label: &str,
        handle: &RunHandle,
        operation: F,
        on_retry: R,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        R: FnMut(u32, &SyncError),
    {
        self.run_inner(label, Some(handle), operation, on_retry).await
    }

    async fn run_inner<T, F, Fut, R>(
        &self,
        label: &str,
        handle: Option<&RunHandle>,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        R: FnMut(u32, &SyncError),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;

                    if !e.is_retryable() {
                        tracing::warn!("{} failed with non-retryable error: {}", label, e);
                        return Err(e);
                    }

                    if attempt >= max_attempts {
                        tracing::error!("{} failed after {} attempts: {}", label, attempt, e);
                        return Err(e);
                    }

                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "{} attempt {} failed: {}, retrying in {}ms",
                        label,
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    on_retry(attempt, &e);

                    match handle {
                        Some(handle) => {
                            handle.sleep(delay).await?;
                            handle.wait_if_paused().await?;
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }
}
