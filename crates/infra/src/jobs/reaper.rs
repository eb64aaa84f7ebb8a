use std::sync::Arc;
use std::time::Duration;

use super::queue::JobQueue;
use super::worker::WorkerHandle;

/// Periodically releases claims whose lock expired (crashed or hung workers).
#[derive(Debug)]
pub struct Reaper;

impl Reaper {
    pub fn spawn(queue: Arc<JobQueue>, interval: Duration) -> WorkerHandle {
        WorkerHandle::periodic("job-reaper", interval, move || {
            let queue = queue.clone();
            async move { queue.reap_stuck_jobs().await.map(|_| ()) }
        })
    }
}
