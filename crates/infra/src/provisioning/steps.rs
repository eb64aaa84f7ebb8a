//! The three queued steps.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use provisioner_core::{Customer, Install, InstallId, InstallStatus, JobType};
use provisioner_crypto::{generate_secure_token, hash_token};

use crate::external::{ProjectTopology, ServiceTarget, SetupLink, WorkflowStatus};
use crate::ledger::NewSetupToken;

use super::{Provisioner, StepError};

/// Bytes of randomness in a setup token (64 hex characters).
pub const SETUP_TOKEN_BYTES: usize = 32;
const SESSION_SECRET_BYTES: usize = 32;
const SLUG_MAX_LEN: usize = 30;

/// Customer-specific project name: a slug of the customer name (or email
/// local part) plus the install's short id.
pub fn project_slug(customer: &Customer, install_id: InstallId) -> String {
    let source = if customer.name.trim().is_empty() {
        customer.email.split('@').next().unwrap_or_default()
    } else {
        customer.name.as_str()
    };

    let mut slug = String::with_capacity(SLUG_MAX_LEN);
    for c in source.chars() {
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');

    if slug.is_empty() {
        format!("install-{}", install_id.short())
    } else {
        format!("{slug}-{}", install_id.short())
    }
}

/// A reaped step can run again after a later step already finished; it then
/// has nothing left to do.
fn handed_over(install: &Install) -> bool {
    let done = matches!(install.status, InstallStatus::SetupPending | InstallStatus::Active);
    if done {
        info!(install_id = %install.id, status = %install.status, "step superseded by a later one; skipping");
    }
    done
}

impl Provisioner {
    /// Deploy the template, wait for it, record the platform ids.
    #[instrument(skip(self), err(Display))]
    pub(crate) async fn provision(&self, install_id: InstallId) -> Result<(), StepError> {
        let mut install = self.load_install(install_id).await?;
        if handed_over(&install) {
            return Ok(());
        }
        install.transition_to(InstallStatus::Provisioning, Utc::now())?;
        self.ledger.update_install(&install).await?;

        let (project_id, workflow_id) = match install.project_id.clone() {
            Some(project_id) => {
                info!(install_id = %install_id, project_id = %project_id, "reusing project from an earlier attempt");
                (project_id, None)
            }
            None => {
                let name = format!("install-{}", install_id.short());
                let deployment = self.platform.deploy_template(&name).await?;
                install.project_id = Some(deployment.project_id.clone());
                install.updated_at = Utc::now();
                self.ledger.update_install(&install).await?;
                info!(install_id = %install_id, project_id = %deployment.project_id, "template deployed");
                (deployment.project_id, deployment.workflow_id)
            }
        };

        let topology = self.wait_until_ready(&project_id, workflow_id.as_deref()).await?;

        let environment = topology
            .primary_environment()
            .ok_or_else(|| StepError::Misconfigured("project has no environment".into()))?;
        let web = topology
            .service_matching("web")
            .ok_or_else(|| StepError::Misconfigured("no service named like \"web\"".into()))?;
        let worker = topology
            .service_matching("worker")
            .ok_or_else(|| StepError::Misconfigured("no service named like \"worker\"".into()))?;
        if web.id == worker.id {
            return Err(StepError::Misconfigured(format!(
                "service {:?} matches both web and worker",
                web.name
            )));
        }

        let customer = self.load_customer(&install).await?;
        self.platform
            .rename_project(&project_id, &project_slug(&customer, install_id))
            .await?;

        install.environment_id = Some(environment.id.clone());
        install.web_service_id = Some(web.id.clone());
        install.worker_service_id = Some(worker.id.clone());
        install.updated_at = Utc::now();
        self.ledger.update_install(&install).await?;

        self.enqueue_next(install_id, JobType::Provision).await
    }

    /// Poll until the project has at least one environment and one service.
    async fn wait_until_ready(
        &self,
        project_id: &str,
        workflow_id: Option<&str>,
    ) -> Result<ProjectTopology, StepError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        let mut workflow = workflow_id;

        loop {
            if let Some(id) = workflow {
                match self.platform.workflow_status(id).await? {
                    WorkflowStatus::Complete => workflow = None,
                    WorkflowStatus::Failed(reason) => {
                        return Err(StepError::Misconfigured(format!("template deploy failed: {reason}")));
                    }
                    WorkflowStatus::Running => {}
                }
            }

            if workflow.is_none() {
                let topology = self.platform.project_topology(project_id).await?;
                if topology.is_ready() {
                    return Ok(topology);
                }
            }

            if Instant::now() >= deadline {
                return Err(StepError::Timeout(format!(
                    "project {project_id} not ready after {}s",
                    self.config.ready_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    /// Domain, variables, session secret and the setup token.
    #[instrument(skip(self), err(Display))]
    pub(crate) async fn configure(&self, install_id: InstallId) -> Result<(), StepError> {
        let mut install = self.load_install(install_id).await?;
        if handed_over(&install) {
            return Ok(());
        }
        install.transition_to(InstallStatus::Provisioning, Utc::now())?;
        let customer = self.load_customer(&install).await?;

        let targets = install
            .deployment_targets()
            .ok_or_else(|| StepError::Precondition("install has no platform resources yet".into()))?;
        let web = ServiceTarget {
            project_id: targets.project_id,
            environment_id: targets.environment_id,
            service_id: targets.web_service_id,
        };
        let worker = ServiceTarget {
            service_id: targets.worker_service_id,
            ..web
        };

        let domain = match self.platform.service_domains(web).await?.into_iter().next() {
            Some(existing) => existing,
            None => self.platform.create_service_domain(web).await?,
        };

        let session_secret = generate_secure_token(SESSION_SECRET_BYTES);
        let mut web_vars = BTreeMap::from([
            ("SESSION_SECRET".to_string(), session_secret.clone()),
            ("PUBLIC_URL".to_string(), format!("https://{domain}")),
            ("INSTALL_ID".to_string(), install_id.to_string()),
            ("APP_ENV".to_string(), self.config.app_env.clone()),
        ]);
        let mut worker_vars = web_vars.clone();
        worker_vars.insert("ENABLE_SCHEDULER".to_string(), "true".to_string());
        web_vars.insert("ENABLE_SCHEDULER".to_string(), "false".to_string());

        self.platform.upsert_variables(web, &web_vars).await?;
        self.platform.upsert_variables(worker, &worker_vars).await?;

        let sealed = self.crypto.encrypt(&session_secret)?;
        let token = generate_secure_token(SETUP_TOKEN_BYTES);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(self.config.setup_link_expiry).unwrap_or_default();
        self.ledger
            .replace_setup_token(
                NewSetupToken {
                    install_id,
                    token_hash: hash_token(&token),
                    encrypted_secret: sealed.ciphertext,
                    secret_nonce: sealed.nonce,
                    expires_at,
                },
                now,
            )
            .await?;

        install.domain = Some(domain.clone());
        install.updated_at = now;
        self.ledger.update_install(&install).await?;

        let link = SetupLink {
            install_id,
            email: customer.email,
            name: customer.name,
            url: format!("{}/setup/{token}", self.config.base_url.trim_end_matches('/')),
            domain,
            expires_at,
        };
        if let Err(e) = self.notifier.send_setup_link(&link).await {
            warn!(install_id = %install_id, error = %e, "setup link delivery failed");
            return Err(e.into());
        }

        // Deploy hands the install over; it must not run before the link is out.
        self.enqueue_next(install_id, JobType::Configure).await
    }

    /// Deploy both services and hand the install over to the customer.
    #[instrument(skip(self), err(Display))]
    pub(crate) async fn deploy(&self, install_id: InstallId) -> Result<(), StepError> {
        let mut install = self.load_install(install_id).await?;
        if install.status == InstallStatus::Active {
            return Ok(());
        }
        let targets = install
            .deployment_targets()
            .ok_or_else(|| StepError::Precondition("install has no platform resources yet".into()))?;
        let web = ServiceTarget {
            project_id: targets.project_id,
            environment_id: targets.environment_id,
            service_id: targets.web_service_id,
        };

        self.platform.deploy_service(web).await?;
        self.platform
            .deploy_service(ServiceTarget {
                service_id: targets.worker_service_id,
                ..web
            })
            .await?;

        install.transition_to(InstallStatus::SetupPending, Utc::now())?;
        self.ledger.update_install(&install).await?;
        info!(install_id = %install_id, "install awaiting customer setup");
        Ok(())
    }
}
