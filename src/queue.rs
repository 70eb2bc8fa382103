//! Background job queue feeding the pipeline runner.
//!
//! Jobs travel over a bounded `mpsc` channel to a dispatcher task, which
//! spawns one runner task per job. A semaphore caps how many pipelines run at
//! once. [`JobQueue::enqueue`] never waits for a pipeline: when the channel is
//! full the job is handed to a detached task that waits for capacity. Those
//! overflow tasks are themselves bounded by a second semaphore; once it is
//! exhausted, `enqueue` fails with [`ServiceError::QueueFull`].

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ServiceError;
use crate::pipeline::{Job, PipelineRunner};

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    overflow: Arc<Semaphore>,
}

impl JobQueue {
    /// Start the dispatcher. The returned handle finishes once every
    /// `JobQueue` clone is dropped and in-flight pipelines are done.
    pub fn spawn(
        runner: Arc<PipelineRunner>,
        workers: usize,
        capacity: usize,
        overflow: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(dispatch(rx, runner, workers.max(1)));
        let overflow = Arc::new(Semaphore::new(overflow));
        (Self { tx, overflow }, handle)
    }

    pub fn enqueue(&self, job: Job) -> Result<(), ServiceError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                let Ok(permit) = self.overflow.clone().try_acquire_owned() else {
                    warn!(request_id = %job.request_id, "job queue and overflow full, refusing job");
                    return Err(ServiceError::QueueFull);
                };
                debug!(request_id = %job.request_id, "job queue full, deferring enqueue");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let request_id = job.request_id.clone();
                    if tx.send(job).await.is_err() {
                        error!(request_id = %request_id, "job queue closed before deferred enqueue");
                    }
                    drop(permit);
                });
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ServiceError::QueueClosed),
        }
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Job>, runner: Arc<PipelineRunner>, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers));
    info!(workers, "pipeline dispatcher started");

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let runner = runner.clone();
        tokio::spawn(async move {
            debug!(request_id = %job.request_id, "pipeline started");
            let outcome = runner.run(&job).await;
            debug!(request_id = %job.request_id, ?outcome, "pipeline finished");
            drop(permit);
        });
    }

    // Wait for in-flight pipelines before reporting shutdown.
    let _ = permits.acquire_many(workers as u32).await;
    info!("pipeline dispatcher stopped");
}
