//! Background execution surface: a shared bounded worker pool for directory
//! listings and search scans, plus one dedicated sequential executor for
//! tasks that must never interleave with each other.
//!
//! Jobs are blocking closures; results travel back through a oneshot-backed
//! [`Completion`], never synchronously across thread boundaries.

use std::sync::{Arc, Mutex, Once};

use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Asynchronous completion signal for a submitted background job.
///
/// Await it via [`Completion::wait`]. Dropping it detaches from the job
/// without cancelling it.
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Completion {
    /// A completion that resolves immediately with `result`.
    pub(crate) fn ready(result: Result<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    pub(crate) fn channel() -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the job to finish and return its outcome.
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Task("completion channel dropped".into())),
        }
    }
}

/// Shared worker pool for the path model.
///
/// `run` executes jobs with bounded parallelism; `run_serial` executes jobs
/// one at a time in submission order on a dedicated queue.
pub struct BackgroundLoader {
    permits: Arc<Semaphore>,
    serial_tx: mpsc::UnboundedSender<Job>,
    serial_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    serial_started: Once,
}

impl BackgroundLoader {
    /// Create a loader with at most `max_parallel` concurrent jobs.
    ///
    /// No tasks are spawned until the first job is submitted, so construction
    /// does not require a Tokio runtime.
    pub fn new(max_parallel: usize) -> Self {
        let (serial_tx, serial_rx) = mpsc::unbounded_channel();
        Self {
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            serial_tx,
            serial_rx: Mutex::new(Some(serial_rx)),
            serial_started: Once::new(),
        }
    }

    /// Submit a blocking job to the bounded pool.
    ///
    /// Must be called from within a Tokio runtime. Returns immediately; the
    /// job's outcome arrives through the returned [`Completion`].
    pub fn run<F>(&self, job: F) -> Completion
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (tx, completion) = Completion::channel();
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = tx.send(Err(Error::Task("worker pool closed".into())));
                    return;
                }
            };
            let outcome = tokio::task::spawn_blocking(job).await;
            let _ = tx.send(match outcome {
                Ok(result) => result,
                Err(e) => Err(Error::Task(e.to_string())),
            });
        });
        completion
    }

    /// Submit a blocking job to the sequential executor.
    ///
    /// Jobs run strictly in submission order, one at a time, independently of
    /// the bounded pool.
    pub fn run_serial<F>(&self, job: F) -> Completion
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.ensure_serial_worker();
        let (tx, completion) = Completion::channel();
        let wrapped: Job = Box::new(move || {
            let _ = tx.send(job());
        });
        if self.serial_tx.send(wrapped).is_err() {
            return Completion::ready(Err(Error::Task("serial executor closed".into())));
        }
        completion
    }

    /// Acquire a pool permit from async context.
    ///
    /// Used by the search engine to bound its fan-out with the same permits
    /// that gate directory listings.
    pub(crate) async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Task("worker pool closed".into()))
    }

    /// Spawn the serial drain task on first use (requires a runtime).
    fn ensure_serial_worker(&self) {
        self.serial_started.call_once(|| {
            let rx = self.serial_rx.lock().unwrap().take();
            if let Some(mut rx) = rx {
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        // Awaited one at a time: this is what serializes the queue.
                        let _ = tokio::task::spawn_blocking(job).await;
                    }
                });
            }
        });
    }
}
