//! Bounded worker pool for asynchronous sends
//!
//! Core workers live as long as the pool. When the queue is full the pool
//! grows by one transient worker, up to `max_workers`; transient workers
//! exit after sitting idle for the keep-alive period. A panicking job is
//! logged and does not take its worker down.
//!
//! Shutdown drops the pool's sender: workers finish what is queued, then
//! see the closed channel and exit.

use futures::future::BoxFuture;
use futures::FutureExt;
use replikv_common::config::{Backpressure, DispatcherConfig};
use replikv_common::{Error, Result};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Unit of work run by the pool
pub type Job = BoxFuture<'static, ()>;

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

pub struct WorkerPool {
    /// `None` once shut down
    tx: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    rx: SharedQueue,
    workers: Arc<AtomicUsize>,
    max_workers: usize,
    keep_alive: Duration,
    backpressure: Backpressure,
}

impl WorkerPool {
    /// Start the pool with its core workers. Must be called inside a
    /// tokio runtime.
    pub fn new(config: &DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let pool = Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Arc::new(AtomicUsize::new(0)),
            max_workers: config.max_workers.max(config.core_workers),
            keep_alive: config.worker_keep_alive(),
            backpressure: config.backpressure,
        };
        for id in 0..config.core_workers {
            pool.spawn_worker(id, None);
        }
        pool
    }

    /// Queue a job.
    ///
    /// With a full queue this waits for space or fails with
    /// [`Error::QueueFull`], depending on the backpressure policy.
    pub async fn submit(&self, job: Job) -> Result<()> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(Error::AlreadyClosed);
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::AlreadyClosed),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.grow();
                match self.backpressure {
                    Backpressure::Block => tx.send(job).await.map_err(|_| Error::AlreadyClosed),
                    Backpressure::Reject => {
                        warn!("dispatch queue full, rejecting job");
                        Err(Error::QueueFull)
                    }
                }
            }
        }
    }

    /// Add a transient worker if below the limit
    fn grow(&self) {
        let mut current = self.workers.load(Ordering::Acquire);
        loop {
            if current >= self.max_workers {
                return;
            }
            match self.workers.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        debug!(workers = current + 1, "spawning transient worker");
        self.spawn_counted(current, Some(self.keep_alive));
    }

    fn spawn_worker(&self, id: usize, keep_alive: Option<Duration>) {
        self.workers.fetch_add(1, Ordering::AcqRel);
        self.spawn_counted(id, keep_alive);
    }

    /// Spawn a worker whose slot is already counted in `workers`
    fn spawn_counted(&self, id: usize, keep_alive: Option<Duration>) {
        let rx = Arc::clone(&self.rx);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            loop {
                let next = match keep_alive {
                    None => rx.lock().await.recv().await,
                    Some(idle) => match tokio::time::timeout(idle, async {
                        rx.lock().await.recv().await
                    })
                    .await
                    {
                        Ok(next) => next,
                        Err(_) => {
                            debug!(worker = id, "transient worker idle, exiting");
                            break;
                        }
                    },
                };
                let Some(job) = next else {
                    break;
                };
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!(worker = id, "dispatch job panicked");
                }
            }
            workers.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Workers currently running
    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting jobs. Queued jobs still run; workers exit once the
    /// queue is empty and no blocked submit still holds a sender.
    pub fn shutdown(&self) {
        if self.tx.lock().take().is_some() {
            debug!("worker pool shut down");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("max_workers", &self.max_workers)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{oneshot, Semaphore};

    fn config(core: usize, max: usize, capacity: usize, backpressure: Backpressure) -> DispatcherConfig {
        DispatcherConfig {
            core_workers: core,
            max_workers: max,
            queue_capacity: capacity,
            backpressure,
            worker_keep_alive_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new(&DispatcherConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);

        for i in 0..10 {
            let counter = Arc::clone(&counter);
            let done = if i == 9 { done_tx.take() } else { None };
            pool.submit(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                .boxed(),
            )
            .await
            .unwrap();
        }
        done_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let pool = WorkerPool::new(&config(1, 1, 1, Backpressure::Reject));
        let gate = Arc::new(Semaphore::new(0));

        // occupies the only worker
        let (started_tx, started_rx) = oneshot::channel();
        {
            let gate = Arc::clone(&gate);
            pool.submit(
                async move {
                    let _ = started_tx.send(());
                    let _ = gate.acquire().await;
                }
                .boxed(),
            )
            .await
            .unwrap();
        }
        started_rx.await.unwrap();

        // fills the queue
        pool.submit(async {}.boxed()).await.unwrap();
        let err = pool.submit(async {}.boxed()).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull));

        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_grows_under_load_up_to_max() {
        let pool = WorkerPool::new(&config(1, 3, 1, Backpressure::Reject));
        let gate = Arc::new(Semaphore::new(0));
        assert_eq!(pool.worker_count(), 1);

        for _ in 0..6 {
            let gate = Arc::clone(&gate);
            let _ = pool
                .submit(
                    async move {
                        let _ = gate.acquire().await;
                    }
                    .boxed(),
                )
                .await;
            tokio::task::yield_now().await;
        }
        assert!(pool.worker_count() <= 3);
        assert!(pool.worker_count() > 1);

        gate.add_permits(100);
        // transient workers leave after their keep-alive
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_worker() {
        let pool = WorkerPool::new(&config(1, 1, 8, Backpressure::Block));
        pool.submit(async { panic!("boom") }.boxed()).await.unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(
            async move {
                let _ = tx.send(7);
            }
            .boxed(),
        )
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), 7);
        assert_eq!(pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_block_waits_for_a_free_slot() {
        let pool = Arc::new(WorkerPool::new(&config(1, 1, 1, Backpressure::Block)));
        let gate = Arc::new(Semaphore::new(0));

        let (started_tx, started_rx) = oneshot::channel();
        {
            let gate = Arc::clone(&gate);
            pool.submit(
                async move {
                    let _ = started_tx.send(());
                    let _ = gate.acquire().await;
                }
                .boxed(),
            )
            .await
            .unwrap();
        }
        started_rx.await.unwrap();
        pool.submit(async {}.boxed()).await.unwrap();

        let (ran_tx, ran_rx) = oneshot::channel();
        let blocked = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.submit(
                    async move {
                        let _ = ran_tx.send(());
                    }
                    .boxed(),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), ran_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = WorkerPool::new(&DispatcherConfig::default());
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_closed());
        let err = pool.submit(async {}.boxed()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_shutdown_with_idle_workers_drains_and_exits() {
        let pool = WorkerPool::new(&config(2, 2, 8, Backpressure::Block));
        // let the core workers park on the empty queue
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, rx) = oneshot::channel();
        pool.submit(
            async move {
                let _ = tx.send(());
            }
            .boxed(),
        )
        .await
        .unwrap();
        pool.shutdown();
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.worker_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
