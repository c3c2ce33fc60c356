use std::sync::Arc;
use std::time::Duration;

use embedstore_core::EmbedStoreError;
use tokio::sync::watch;

/// Counts embedding jobs that have been submitted but not finished.
///
/// Searches call [`drain`](Self::drain) before reading so they observe every write
/// submitted before them. Clones share the same count.
#[derive(Debug, Clone)]
pub struct PendingTracker {
    count: Arc<watch::Sender<usize>>,
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Count one job as pending until the returned guard is dropped.
    pub fn begin(&self) -> PendingGuard {
        self.count.send_modify(|n| *n += 1);
        PendingGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn pending(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no job is pending.
    pub async fn drain(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// [`drain`](Self::drain), failing with `Timeout` after `timeout`.
    pub async fn drain_timeout(&self, timeout: Duration) -> Result<(), EmbedStoreError> {
        tokio::time::timeout(timeout, self.drain())
            .await
            .map_err(|_| {
                EmbedStoreError::Timeout(format!(
                    "{} embedding job(s) still pending after {timeout:?}",
                    self.pending()
                ))
            })
    }
}

/// Marks one pending job. Dropping it, on success, error or panic, ends the job.
#[must_use = "the job stops counting as pending as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PendingGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}
