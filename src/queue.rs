//! Bounded-concurrency snapshot job queue.
//!
//! Jobs are admitted FIFO and at most `concurrency` run at once. `idle()`
//! resolves whenever nothing is queued or running, which is what build
//! finalization waits on.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::debug;

use crate::error::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueueInner {
    /// Queued + running job count.
    pending: AtomicUsize,
    notify: Notify,
    closed: AtomicBool,
    cancelling: AtomicBool,
}

impl QueueInner {
    fn finish_one(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

pub struct SnapshotQueue {
    tx: mpsc::UnboundedSender<Job>,
    inner: Arc<QueueInner>,
}

impl SnapshotQueue {
    pub fn new(concurrency: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let inner = Arc::new(QueueInner {
            pending: AtomicUsize::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            cancelling: AtomicBool::new(false),
        });
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let dispatcher = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if dispatcher.cancelling.load(Ordering::Acquire) {
                    // Dropping the job wakes its handle with a cancellation.
                    dispatcher.finish_one();
                    continue;
                }
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                if dispatcher.cancelling.load(Ordering::Acquire) {
                    dispatcher.finish_one();
                    continue;
                }
                let inner = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                    inner.finish_one();
                });
            }
            debug!("snapshot queue dispatcher exited");
        });

        Self { tx, inner }
    }

    /// Enqueue a job. The returned receiver resolves with the job's output,
    /// or errs if the job was cancelled before running.
    pub fn push<F, T>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let wrapped: Job = Box::pin(async move {
            let _ = done_tx.send(job.await);
        });
        if self.tx.send(wrapped).is_err() {
            self.inner.finish_one();
            return Err(Error::NotRunning);
        }
        Ok(done_rx)
    }

    /// Resolves when no job is queued or running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reject new pushes, then wait. With `drain` the queue finishes
    /// everything; without it queued jobs are dropped and only the jobs
    /// already running are awaited.
    pub async fn stop(&self, drain: bool) {
        self.inner.closed.store(true, Ordering::Release);
        if !drain {
            self.inner.cancelling.store(true, Ordering::Release);
            self.inner.notify.notify_waiters();
        }
        self.idle().await;
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }
}
