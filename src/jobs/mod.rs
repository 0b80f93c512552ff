//! Queued worker pool with fan-in barriers
//!
//! Independent units of work (proxy-validation chunks, scrape jobs,
//! aggregation barriers) go through a bounded queue consumed by a fixed set
//! of worker tasks. Results come back on oneshot handles. A [`Barrier`]
//! waits for every member of a fan-out group and exposes a progress counter
//! so the orchestrator can poll when a completion handle times out.
//!
//! On shutdown, queued work is discarded; running jobs observe the shutdown
//! signal at their own suspension points.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::shutdown::ShutdownSignal;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Errors surfaced by job handles
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("worker pool is shut down")]
    PoolClosed,
    #[error("job was dropped before completing")]
    JobDropped,
    #[error("timed out waiting for job result")]
    Timeout,
}

/// Completion handle for one submitted job
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Wait for the job's result
    pub async fn wait(self) -> Result<T, JobError> {
        self.rx.await.map_err(|_| JobError::JobDropped)
    }

    /// Wait with a deadline
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T, JobError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(JobError::JobDropped),
            Err(_) => Err(JobError::Timeout),
        }
    }
}

/// Fixed-size pool of worker tasks consuming a bounded job queue
pub struct WorkerPool {
    tx: mpsc::Sender<BoxedJob>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
    parallelism: usize,
}

impl WorkerPool {
    /// Start `parallelism` workers over a queue of `queue_depth` slots
    #[must_use]
    pub fn start(parallelism: usize, queue_depth: usize, shutdown: ShutdownSignal) -> Arc<Self> {
        let parallelism = parallelism.max(1);
        let (tx, rx) = mpsc::channel::<BoxedJob>(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(parallelism);
        for worker_id in 0..parallelism {
            let rx = Arc::clone(&rx);
            let worker_shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            job = guard.recv() => job,
                            () = worker_shutdown.wait() => None,
                        }
                    };
                    let Some(job) = job else {
                        debug!("Worker {worker_id} exiting");
                        break;
                    };
                    job.await;
                }
            }));
        }

        info!("Worker pool started with {parallelism} workers");
        Arc::new(Self {
            tx,
            workers: parking_lot::Mutex::new(workers),
            shutdown,
            parallelism,
        })
    }

    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Submit a unit of work; the handle resolves with its output
    pub async fn submit<T, Fut>(&self, work: Fut) -> Result<JobHandle<T>, JobError>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.shutdown.is_triggered() {
            return Err(JobError::PoolClosed);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let job: BoxedJob = Box::pin(async move {
            let value = work.await;
            // Receiver may be gone if the submitter stopped caring
            let _ = result_tx.send(value);
        });

        self.tx.send(job).await.map_err(|_| JobError::PoolClosed)?;
        Ok(JobHandle { rx: result_rx })
    }

    /// Submit a fan-out group and return its barrier
    pub async fn submit_group<T, Fut, I>(&self, group: I) -> Result<Barrier<T>, JobError>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        I: IntoIterator<Item = Fut>,
    {
        let progress = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for work in group {
            let progress = Arc::clone(&progress);
            let handle = self
                .submit(async move {
                    let value = work.await;
                    progress.fetch_add(1, Ordering::SeqCst);
                    value
                })
                .await?;
            handles.push(handle);
        }

        Ok(Barrier {
            total: handles.len(),
            progress,
            handles,
        })
    }

    /// Stop the workers; queued jobs are discarded
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await
                && !e.is_cancelled()
            {
                warn!("Worker task failed during shutdown: {e}");
            }
        }
        info!("Worker pool stopped");
    }
}

/// Fan-in node over one fan-out group
///
/// The chord completes when every member has finished; `progress()` exposes
/// how many members are done for timeout-fallback polling.
pub struct Barrier<T> {
    total: usize,
    progress: Arc<AtomicUsize>,
    handles: Vec<JobHandle<T>>,
}

impl<T> Barrier<T> {
    /// (completed, total) members
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        (self.progress.load(Ordering::SeqCst), self.total)
    }

    /// Clonable progress counter for polling after a handle timeout
    #[must_use]
    pub fn progress_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.progress)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Wait for every member, bounded by `timeout`
    ///
    /// Members that were dropped (worker shutdown) are omitted from the
    /// result rather than failing the whole group.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Vec<T>, JobError> {
        let gather = async {
            let mut results = Vec::with_capacity(self.handles.len());
            for handle in self.handles {
                match handle.wait().await {
                    Ok(value) => results.push(value),
                    Err(JobError::JobDropped) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(results)
        };

        match tokio::time::timeout(timeout, gather).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout),
        }
    }
}
