//! Where background embedding jobs run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use embedstore_core::EmbedStoreError;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Runs submitted jobs to completion at some later point.
///
/// `submit` must not block and must not run the job inline: callers count the job as
/// pending before submitting it and rely on it completing elsewhere.
pub trait TaskScheduler: Send + Sync {
    fn submit(&self, job: BoxFuture<'static, ()>);
}

/// Spawns jobs on a tokio runtime, optionally bounding how many run at once.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
    limit: Option<Arc<Semaphore>>,
}

impl TokioScheduler {
    /// Scheduler for the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime. See [`try_current`](Self::try_current).
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    pub fn try_current() -> Result<Self, EmbedStoreError> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| EmbedStoreError::Configuration(format!("no tokio runtime: {e}")))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            limit: None,
        }
    }

    /// Run at most `max` jobs at the same time.
    ///
    /// # Panics
    ///
    /// Panics if `max` is zero.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        assert!(max > 0, "max concurrency must be > 0");
        self.limit = Some(Arc::new(Semaphore::new(max)));
        self
    }
}

impl TaskScheduler for TokioScheduler {
    fn submit(&self, job: BoxFuture<'static, ()>) {
        let limit = self.limit.clone();
        self.handle.spawn(async move {
            let _permit = match limit {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            job.await;
        });
    }
}

/// Queues jobs until the owner runs them. Useful for deterministic tests.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<VecDeque<BoxFuture<'static, ()>>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_jobs(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Run the oldest queued job. Returns `false` when the queue was empty.
    pub async fn run_next(&self) -> bool {
        let job = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match job {
            Some(job) => {
                job.await;
                true
            }
            None => false,
        }
    }

    /// Run queued jobs, including ones queued meanwhile, until none are left.
    pub async fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next().await {
            ran += 1;
        }
        ran
    }
}

impl TaskScheduler for ManualScheduler {
    fn submit(&self, job: BoxFuture<'static, ()>) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(job);
    }
}
