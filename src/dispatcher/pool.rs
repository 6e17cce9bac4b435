use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{DispatchError, Dispatcher};

/// Delivery workers plus the health-sweep loop.
pub struct WorkerPool {
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` poll loops and one health-sweep loop.
    pub fn start(dispatcher: Arc<Dispatcher>) -> Self {
        let cancellation_token = CancellationToken::new();
        let worker_count = dispatcher.config().worker_count;
        let mut handles = Vec::with_capacity(worker_count + 1);

        info!(worker_count, "spawning delivery workers");

        for index in 0..worker_count {
            let worker_id = format!("courier-worker-{index}-{}", uuid::Uuid::new_v4());
            handles.push(tokio::spawn(run_worker(
                Arc::clone(&dispatcher),
                worker_id,
                cancellation_token.clone(),
            )));
        }
        handles.push(tokio::spawn(run_health_loop(
            dispatcher,
            cancellation_token.clone(),
        )));

        Self {
            cancellation_token,
            handles,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stops claiming, lets in-flight attempts finish and joins every loop
    /// within `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), DispatchError> {
        info!(
            tasks = self.handles.len(),
            timeout_ms = timeout.as_millis() as u64,
            "initiating graceful worker shutdown"
        );
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.handles);
        let join_all = async {
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(error = %err, "worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            }
            Err(_elapsed) => {
                error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "worker shutdown timed out"
                );
                Err(DispatchError::ShutdownTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() && !self.cancellation_token.is_cancelled() {
            warn!("worker pool dropped without shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

async fn run_worker(dispatcher: Arc<Dispatcher>, worker_id: String, token: CancellationToken) {
    info!(worker_id = %worker_id, "delivery worker starting");
    let poll_interval = dispatcher.config().poll_interval;

    loop {
        if token.is_cancelled() {
            break;
        }

        let idle = match dispatcher.process_batch(&worker_id).await {
            Ok(report) => {
                if report.claimed > 0 {
                    info!(
                        worker_id = %worker_id,
                        claimed = report.claimed,
                        delivered = report.delivered,
                        retried = report.retried,
                        failed = report.failed,
                        cancelled = report.cancelled,
                        deferred = report.deferred,
                        "batch processed"
                    );
                }
                report.is_idle()
            }
            Err(err) => {
                error!(worker_id = %worker_id, error = %err, "failed to claim deliveries");
                true
            }
        };

        if idle {
            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                () = token.cancelled() => break,
            }
        }
    }

    info!(worker_id = %worker_id, "delivery worker stopped");
}

async fn run_health_loop(dispatcher: Arc<Dispatcher>, token: CancellationToken) {
    let interval = dispatcher.config().health_interval;

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = token.cancelled() => break,
        }
        if let Err(err) = dispatcher.run_health_sweep().await {
            error!(error = %err, "health sweep failed");
        }
    }

    info!("health sweep loop stopped");
}
