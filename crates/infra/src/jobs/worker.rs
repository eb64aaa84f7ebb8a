//! Worker loop and the shared background-task handle.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::queue::{JobHandler, JobQueue};
use super::types::JobOutcome;

/// Handle to control and join a background task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the task to stop. A step that is
    /// already running is allowed to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(worker = %self.name, error = %e, "background task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Run `tick` every `period` until shutdown. Errors are logged and counted,
    /// never fatal.
    pub fn periodic<F, Fut, E>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display + Send,
    {
        let name = name.into();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let task_stats = stats.clone();
        let task_name = name.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(worker = %task_name, period_ms = period.as_millis() as u64, "periodic task started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {}
                }
                let result = tick().await;
                let mut s = task_stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.iterations += 1;
                if let Err(e) = result {
                    s.errors += 1;
                    error!(worker = %task_name, error = %e, "periodic task failed");
                }
            }

            info!(worker = %task_name, "periodic task stopped");
        });

        Self {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            started: Instant::now(),
        }
    }
}

/// Runtime counters for one background task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub iterations: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub locks_lost: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sleep between polls when the queue is empty or the ledger errored.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Claims and executes provisioning jobs until shut down.
#[derive(Debug)]
pub struct Worker;

impl Worker {
    pub fn spawn(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let name = config.worker_id.clone();
        let join = tokio::spawn(worker_loop(config, queue, handler, shutdown_rx, stats.clone()));

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop(
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let worker_id = config.worker_id.as_str();
    info!(worker_id, "job worker started");

    while !*shutdown_rx.borrow() {
        let result = queue.process_next(worker_id, handler.as_ref()).await;

        let idle = {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.iterations += 1;
            match result {
                Ok(Some(outcome)) => {
                    match outcome {
                        JobOutcome::Completed => s.jobs_succeeded += 1,
                        JobOutcome::Retrying => s.jobs_retried += 1,
                        JobOutcome::Failed => s.jobs_failed += 1,
                        JobOutcome::LockLost => s.locks_lost += 1,
                    }
                    false
                }
                Ok(None) => true,
                Err(ref e) => {
                    s.errors += 1;
                    error!(worker_id, error = %e, "failed to claim or record job");
                    true
                }
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }

    info!(worker_id, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn periodic_task_runs_and_stops() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        let handle = WorkerHandle::periodic("ticker", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.stats().iterations >= 1);
        handle.shutdown().await;

        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn periodic_errors_are_counted() {
        let handle = WorkerHandle::periodic("failing", Duration::from_millis(5), || async {
            Err::<(), _>("boom")
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stats = handle.stats();
        handle.shutdown().await;
        assert!(stats.errors >= 1);
        assert_eq!(stats.errors, stats.iterations);
    }
}
