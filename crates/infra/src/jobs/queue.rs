//! Durable provisioning job queue on top of the [`Ledger`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use provisioner_core::{InstallId, JobType, ProvisioningJob};

use crate::ledger::{Ledger, LedgerResult, NewJob};
use crate::provisioning::StepError;

use super::types::{JobOutcome, JobQueueConfig, ReapReport};

/// Executes one claimed job. Must tolerate re-execution of the same step
/// after a reap.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &ProvisioningJob) -> Result<(), StepError>;
}

#[derive(Clone)]
pub struct JobQueue {
    ledger: Arc<dyn Ledger>,
    config: JobQueueConfig,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(ledger: Arc<dyn Ledger>, config: JobQueueConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Insert parameters for a job due after `delay`, using the queue's retry budget.
    pub fn new_job(&self, install_id: InstallId, job_type: JobType, delay: Duration) -> NewJob {
        NewJob {
            install_id,
            job_type,
            max_attempts: self.config.retry.max_attempts,
            run_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
        }
    }

    pub async fn create_job(
        &self,
        install_id: InstallId,
        job_type: JobType,
        delay: Duration,
    ) -> LedgerResult<ProvisioningJob> {
        let job = self
            .ledger
            .create_job(self.new_job(install_id, job_type, delay))
            .await?;
        debug!(job_id = %job.id, install_id = %install_id, job_type = %job_type, "job enqueued");
        Ok(job)
    }

    pub async fn jobs_for_install(&self, install_id: InstallId) -> LedgerResult<Vec<ProvisioningJob>> {
        self.ledger.jobs_for_install(install_id).await
    }

    /// Claim and run at most one job. `false` when nothing was eligible.
    pub async fn process_next_job(
        &self,
        worker_id: &str,
        handler: &dyn JobHandler,
    ) -> LedgerResult<bool> {
        Ok(self.process_next(worker_id, handler).await?.is_some())
    }

    /// Like [`process_next_job`](Self::process_next_job), reporting what happened.
    pub async fn process_next(
        &self,
        worker_id: &str,
        handler: &dyn JobHandler,
    ) -> LedgerResult<Option<JobOutcome>> {
        let now = Utc::now();
        let lock_until =
            now + chrono::Duration::from_std(self.config.lock_duration).unwrap_or_default();

        let Some(job) = self.ledger.claim_next_job(worker_id, now, lock_until).await? else {
            return Ok(None);
        };

        debug!(
            worker_id,
            job_id = %job.id,
            install_id = %job.install_id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "claimed job"
        );

        let outcome = match handler.run(&job).await {
            Ok(()) => {
                if self.ledger.complete_job(job.id, Utc::now()).await? {
                    debug!(job_id = %job.id, "job completed");
                    JobOutcome::Completed
                } else {
                    warn!(job_id = %job.id, "job finished after its lock was released");
                    JobOutcome::LockLost
                }
            }
            Err(err) => self.record_failure(&job, &err.to_string()).await?,
        };
        Ok(Some(outcome))
    }

    async fn record_failure(&self, job: &ProvisioningJob, message: &str) -> LedgerResult<JobOutcome> {
        let now = Utc::now();

        if job.is_exhausted() {
            if !self.ledger.fail_job(job.id, message, now).await? {
                return Ok(JobOutcome::LockLost);
            }
            self.ledger.fail_install(job.install_id, message, now).await?;
            error!(
                job_id = %job.id,
                install_id = %job.install_id,
                job_type = %job.job_type,
                attempts = job.attempts,
                error = %message,
                "job exhausted its attempts; install failed"
            );
            return Ok(JobOutcome::Failed);
        }

        let delay = self.config.retry.delay_for_attempt(job.attempts);
        let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        if !self.ledger.retry_job_later(job.id, message, next_run_at).await? {
            return Ok(JobOutcome::LockLost);
        }
        warn!(
            job_id = %job.id,
            install_id = %job.install_id,
            job_type = %job.job_type,
            attempts = job.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "job step failed; retrying"
        );
        Ok(JobOutcome::Retrying)
    }

    /// Release expired claims and fail the installs of jobs that ran out of attempts.
    pub async fn reap_stuck_jobs(&self) -> LedgerResult<ReapReport> {
        let now = Utc::now();
        let released = self.ledger.reap_expired_jobs(now).await?;

        let mut report = ReapReport::default();
        for job in &released {
            if job.status.is_terminal() {
                let message = job.last_error.as_deref().unwrap_or_default();
                self.ledger.fail_install(job.install_id, message, now).await?;
                report.failed += 1;
            } else {
                report.requeued += 1;
            }
        }

        if !report.is_empty() {
            info!(requeued = report.requeued, failed = report.failed, "reaped expired job locks");
        }
        Ok(report)
    }
}
