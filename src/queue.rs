// dedupe-coordinator: the single-worker index queue
//
// Mirrors the teacher's request-ordering guarantee: every job that touches
// engine/session state runs on exactly one worker task, in submission
// order, so callers never need to serialize among themselves.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce() -> BoxFuture + Send>;

#[derive(Clone)]
pub(crate) struct IndexQueueHandle {
    sender: mpsc::UnboundedSender<Job>,
    shutdown: Arc<Notify>,
}

impl IndexQueueHandle {
    /// Enqueue a job. Silently dropped if the worker has already shut down,
    /// matching the "best effort, coordinator is tearing down" semantics of
    /// `finish()`.
    pub(crate) fn submit<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Job = Box::new(move || Box::pin(job()) as BoxFuture);
        let _ = self.sender.send(boxed);
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Spawn the worker task and return a handle to it plus its `JoinHandle`,
/// so `Coordinator::finish` can await a clean drain.
pub(crate) fn spawn() -> (IndexQueueHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
    let shutdown = Arc::new(Notify::new());
    let handle = IndexQueueHandle { sender, shutdown: Arc::clone(&shutdown) };

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    receiver.close();
                    while let Ok(job) = receiver.try_recv() {
                        job().await;
                    }
                    break;
                }
                job = receiver.recv() => {
                    match job {
                        Some(job) => job().await,
                        None => break,
                    }
                }
            }
        }
    });

    (handle, join)
}
