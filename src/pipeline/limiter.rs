//! Concurrency limiter for remote calls.
//!
//! A counting semaphore with FIFO waiters. Releasing a permit hands it
//! straight to the longest waiter, so the number of held permits never
//! exceeds the configured maximum. Permits are RAII guards: they are released
//! on every exit path, including task cancellation.

use crate::error::SyncError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pick a dispatch concurrency for a dataset of `total_records`.
///
/// Larger datasets get fewer simultaneous calls to soften load spikes.
pub fn adaptive_concurrency(total_records: usize) -> usize {
    match total_records {
        0..=10_000 => 5,
        10_001..=50_000 => 3,
        _ => 2,
    }
}

/// Caps the number of simultaneous in-flight operations for one run.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    held: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// A held permit. Dropping it releases the permit.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    held: Arc<AtomicUsize>,
}

impl LimiterPermit {
    /// Release the permit explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `max` simultaneous permits (at least one).
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            held: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait until a permit is available and take it.
    ///
    /// Fails with [`SyncError::Aborted`] once the limiter has been closed.
    pub async fn acquire(&self) -> Result<LimiterPermit, SyncError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Aborted)?;

        let now_held = self.held.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_held, Ordering::SeqCst);

        Ok(LimiterPermit {
            _permit: permit,
            held: self.held.clone(),
        })
    }

    /// Run `operation` while holding a permit.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let _permit = self.acquire().await?;
        operation().await
    }

    /// Close the limiter. Pending and future `acquire` calls fail; permits
    /// already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Configured maximum.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Permits currently held.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Highest number of permits held at once since creation.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
