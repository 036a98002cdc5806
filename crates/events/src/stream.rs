//! Per-job live status streaming.
//!
//! A subscription immediately emits the current persisted status, then
//! an update each time the job record changes. Change detection couples
//! a short store poll (the staleness bound) with bus signals for low
//! latency. Once the job is terminal the stream emits that status once
//! more and closes after a short grace delay.

use std::sync::Arc;
use std::time::Duration;

use coursecast_core::error::CoreError;
use coursecast_core::types::JobId;
use coursecast_db::models::JobStatusView;
use coursecast_db::store::JobStore;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, JobSignal};

/// Buffered updates per subscription; beyond this the emitter waits for
/// the consumer, preserving at-most-last-known-value semantics.
const CHANNEL_CAPACITY: usize = 16;

/// Tunable parameters for status streaming.
#[derive(Debug, Clone)]
pub struct StatusStreamConfig {
    /// Store poll interval; equals the worst-case staleness.
    pub poll_interval: Duration,
    /// Delay between the terminal emission and channel close.
    pub terminal_grace: Duration,
}

impl Default for StatusStreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            terminal_grace: Duration::from_secs(1),
        }
    }
}

/// Factory for per-job status subscriptions.
pub struct StatusStream {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    config: StatusStreamConfig,
}

/// A live subscription to one job's status.
///
/// Dropping the subscription (or its receiver half) stops the backing
/// task promptly and releases its polling resources.
#[derive(Debug)]
pub struct StatusSubscription {
    receiver: mpsc::Receiver<JobStatusView>,
    cancel: CancellationToken,
}

impl StatusSubscription {
    /// Receive the next status update, or `None` once the stream closed.
    pub async fn next(&mut self) -> Option<JobStatusView> {
        self.receiver.recv().await
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StatusStream {
    /// Create a stream factory over the given store and bus.
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<EventBus>, config: StatusStreamConfig) -> Self {
        Self { store, bus, config }
    }

    /// Open a subscription for `job_id`.
    ///
    /// Fails with [`CoreError::NotFound`] when the job does not exist.
    pub async fn subscribe(&self, job_id: JobId) -> Result<StatusSubscription, CoreError> {
        let initial = self
            .store
            .get_job(&job_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .ok_or_else(|| CoreError::job_not_found(job_id.to_string()))?
            .status_view();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let store = Arc::clone(&self.store);
        let bus_rx = self.bus.subscribe();
        let config = self.config.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_stream(store, bus_rx, config, job_id, initial, tx, task_cancel).await;
        });

        Ok(StatusSubscription {
            receiver: rx,
            cancel,
        })
    }
}

/// Emit loop for one subscription.
async fn run_stream(
    store: Arc<dyn JobStore>,
    mut bus_rx: broadcast::Receiver<JobSignal>,
    config: StatusStreamConfig,
    job_id: JobId,
    initial: JobStatusView,
    tx: mpsc::Sender<JobStatusView>,
    cancel: CancellationToken,
) {
    let terminal_on_entry = initial.status.is_terminal();
    if tx.send(initial.clone()).await.is_err() {
        return;
    }
    if terminal_on_entry {
        tokio::time::sleep(config.terminal_grace).await;
        return;
    }

    let mut last = initial;
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; consume it so the loop starts
    // with a full poll interval.
    ticker.tick().await;
    let mut bus_alive = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            _ = ticker.tick() => {}
            received = bus_rx.recv(), if bus_alive => {
                match received {
                    Ok(signal) if signal.job_id != job_id => continue,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %job_id, skipped, "Status stream lagged behind bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        bus_alive = false;
                        continue;
                    }
                }
            }
        }

        let view = match store.get_job(&job_id).await {
            Ok(Some(job)) => job.status_view(),
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Streamed job disappeared from the store");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Status stream read failed");
                continue;
            }
        };

        if view != last {
            let terminal = view.status.is_terminal();
            last = view.clone();
            if tx.send(view).await.is_err() {
                return;
            }
            if terminal {
                tokio::time::sleep(config.terminal_grace).await;
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
