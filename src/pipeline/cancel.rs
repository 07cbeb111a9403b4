//! Pause / resume / abort control for a running pipeline.

use crate::error::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Caller-side handle to an in-flight run. Cheap to clone.
///
/// Pausing stops new dispatch and poll calls from being issued; calls
/// already sent complete normally. Aborting is final.
#[derive(Debug, Clone)]
pub struct RunHandle {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunHandle {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn pause(&self) {
        if !self.is_aborted() {
            tracing::info!("Run paused");
            self.paused.send_replace(true);
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::info!("Run resumed");
        }
    }

    pub fn abort(&self) {
        if !self.cancel.is_cancelled() {
            tracing::warn!("Run abort requested");
        }
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is aborted.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Receiver that observes pause/resume changes.
    pub fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Return immediately when running; wait while paused.
    ///
    /// Fails with [`SyncError::Aborted`] if the run is, or becomes, aborted.
    pub async fn wait_if_paused(&self) -> Result<(), SyncError> {
        let mut paused = self.paused.subscribe();
        loop {
            if self.is_aborted() {
                return Err(SyncError::Aborted);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Aborted),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep for `duration` unless the run is aborted first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), SyncError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Aborted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_if_paused_passes_when_running() {
        let handle = RunHandle::new();
        assert!(handle.wait_if_paused().await.is_ok());
    }

    #[tokio::test]
    async fn test_resume_releases_waiter() {
        let handle = RunHandle::new();
        handle.pause();
        assert!(handle.is_paused());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        handle.resume();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abort_releases_paused_waiter() {
        let handle = RunHandle::new();
        handle.pause();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        handle.abort();
        assert_eq!(waiter.await.unwrap(), Err(SyncError::Aborted));
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn test_sleep_is_cut_short_by_abort() {
        let handle = RunHandle::new();
        let sleeper = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.sleep(Duration::from_secs(60)).await })
        };
        handle.abort();
        assert_eq!(sleeper.await.unwrap(), Err(SyncError::Aborted));
    }

    #[test]
    fn test_pause_after_abort_is_ignored() {
        let handle = RunHandle::new();
        handle.abort();
        handle.pause();
        assert!(!handle.is_paused());
    }
}
