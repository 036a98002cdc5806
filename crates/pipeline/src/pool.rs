//! Bounded worker pool consuming the work queue.
//!
//! Each worker is a long-lived Tokio task: lease, run, repeat. The pool
//! shares one [`JobRunner`] and shuts down by cancelling a master token
//! and waiting bounded time per task.

use std::sync::Arc;
use std::time::Duration;

use coursecast_core::types::WorkerId;
use coursecast_db::store::WorkQueue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::runner::JobRunner;

/// Wait per worker task during shutdown before giving up on it.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// A fixed-size pool of queue consumers.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Mutex<Vec<(WorkerId, tokio::task::JoinHandle<()>)>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` worker loops.
    ///
    /// The returned handle is the only way to stop them; dropping it
    /// does not abort the workers.
    pub fn start(
        runner: Arc<JobRunner>,
        queue: Arc<dyn WorkQueue>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(config.worker_count);

        for _ in 0..config.worker_count {
            let worker_id = WorkerId::generate();
            let handle = tokio::spawn(worker_loop(
                Arc::clone(&runner),
                Arc::clone(&queue),
                config.clone(),
                worker_id.clone(),
                cancel.child_token(),
            ));
            handles.push((worker_id, handle));
        }

        tracing::info!(worker_count = config.worker_count, "Worker pool started");

        Arc::new(Self {
            cancel,
            handles: Mutex::new(handles),
        })
    }

    /// Gracefully stop all workers.
    ///
    /// Cancels the master token, then waits up to [`SHUTDOWN_WAIT`] per
    /// task for a clean exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker pool");
        self.cancel.cancel();

        let mut handles = self.handles.lock().await;
        for (worker_id, handle) in handles.drain(..) {
            if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                tracing::warn!(worker_id = %worker_id, "Worker did not stop in time");
            }
        }

        tracing::info!("Worker pool shut down complete");
    }
}

/// One worker: lease when work is due, otherwise idle-poll the queue.
async fn worker_loop(
    runner: Arc<JobRunner>,
    queue: Arc<dyn WorkQueue>,
    config: PipelineConfig,
    worker_id: WorkerId,
    cancel: CancellationToken,
) {
    tracing::info!(worker_id = %worker_id, "Worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match queue.lease(&worker_id, config.visibility_timeout).await {
            Ok(Some(lease)) => {
                tracing::debug!(
                    worker_id = %worker_id,
                    job_id = %lease.job_id,
                    delivery_attempts = lease.attempts,
                    "Job leased",
                );
                if let Err(e) = runner.run_lease(&lease, &worker_id, &cancel).await {
                    tracing::error!(
                        worker_id = %worker_id,
                        job_id = %lease.job_id,
                        error = %e,
                        "Lease execution failed",
                    );
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_poll_interval) => {}
                }
            }
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Queue lease failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_poll_interval) => {}
                }
            }
        }
    }

    tracing::info!(worker_id = %worker_id, "Worker stopped");
}
