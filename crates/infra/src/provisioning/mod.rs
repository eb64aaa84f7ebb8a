//! Provisioning state machine.
//!
//! `pending -> provisioning -> setup_pending -> active`, driven one queued step
//! at a time (`provision`, `configure`, `deploy`) and finished synchronously by
//! the customer's setup link. Each step enqueues the next only on success and
//! is safe to re-run from the start after a reap.

pub mod error;
pub mod setup;
pub mod steps;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use provisioner_core::{Customer, Install, InstallId, JobStatus, JobType, ProvisioningJob};
use provisioner_crypto::EncryptionService;

use crate::external::{DeploymentPlatform, Notifier};
use crate::jobs::{JobHandler, JobQueue};
use crate::ledger::Ledger;

pub use error::{ProvisioningError, SetupError, StepError};
pub use setup::{SetupCompletion, SetupTokenStatus};

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Public base URL of this service; setup links are `{base_url}/setup/{token}`.
    pub base_url: String,
    pub setup_link_expiry: Duration,
    /// Upper bound on waiting for an asynchronous template deploy.
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    /// `APP_ENV` pushed to deployed services.
    pub app_env: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            setup_link_expiry: Duration::from_secs(72 * 60 * 60),
            ready_timeout: Duration::from_secs(600),
            ready_poll_interval: Duration::from_secs(5),
            app_env: "production".to_string(),
        }
    }
}

pub struct Provisioner {
    ledger: Arc<dyn Ledger>,
    queue: Arc<JobQueue>,
    platform: Arc<dyn DeploymentPlatform>,
    crypto: Arc<EncryptionService>,
    notifier: Arc<dyn Notifier>,
    config: ProvisionerConfig,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        queue: Arc<JobQueue>,
        platform: Arc<dyn DeploymentPlatform>,
        crypto: Arc<EncryptionService>,
        notifier: Arc<dyn Notifier>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            ledger,
            queue,
            platform,
            crypto,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Operator retry: `failed -> pending` plus a fresh `provision` job.
    pub async fn retry_install(&self, install_id: InstallId) -> Result<ProvisioningJob, ProvisioningError> {
        let install = self
            .ledger
            .get_install(install_id)
            .await?
            .ok_or(ProvisioningError::NotFound(install_id))?;

        let job = self.queue.new_job(install_id, JobType::Provision, Duration::ZERO);
        match self.ledger.reset_failed_install(install_id, job, Utc::now()).await? {
            Some(job) => {
                info!(install_id = %install_id, job_id = %job.id, "install re-queued for provisioning");
                Ok(job)
            }
            None => Err(ProvisioningError::NotRetryable {
                id: install_id,
                status: install.status,
            }),
        }
    }

    async fn load_install(&self, id: InstallId) -> Result<Install, StepError> {
        self.ledger
            .get_install(id)
            .await?
            .ok_or(StepError::InstallNotFound(id))
    }

    async fn load_customer(&self, install: &Install) -> Result<Customer, StepError> {
        self.ledger
            .get_customer(install.customer_id)
            .await?
            .ok_or_else(|| StepError::Precondition(format!("customer for install {} is missing", install.id)))
    }

    /// Enqueue the step after `after` unless a re-run already left one waiting.
    async fn enqueue_next(&self, install_id: InstallId, after: JobType) -> Result<(), StepError> {
        let Some(job_type) = after.next() else {
            return Ok(());
        };
        let queued = self
            .queue
            .jobs_for_install(install_id)
            .await?
            .into_iter()
            .any(|j| {
                j.job_type == job_type && matches!(j.status, JobStatus::Pending | JobStatus::Processing)
            });
        if !queued {
            self.queue.create_job(install_id, job_type, Duration::ZERO).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for Provisioner {
    async fn run(&self, job: &ProvisioningJob) -> Result<(), StepError> {
        match job.job_type {
            JobType::Provision => self.provision(job.install_id).await,
            JobType::Configure => self.configure(job.install_id).await,
            JobType::Deploy => self.deploy(job.install_id).await,
        }
    }
}
