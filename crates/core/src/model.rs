//! Ledger records.
//!
//! Plain data carried between the ledger, the orchestration services and the
//! HTTP layer. Status changes go through the methods here so lifecycle rules are
//! checked in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CustomerId, InstallId, JobId, PurchaseId, SetupTokenId, WebhookEventId};
use crate::status::{InstallStatus, JobStatus, JobType, PurchaseStatus, WebhookEventStatus};

/// A paying party. Email is stored normalised (see [`Customer::normalize_email`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub email: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    /// Emails are unique case-insensitively; store and compare them lower-cased.
    pub fn normalize_email(email: &str) -> DomainResult<String> {
        let email = email.trim().to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
            None => false,
        };
        if !valid || email.chars().any(char::is_whitespace) {
            return Err(DomainError::validation("email address is not valid"));
        }
        Ok(email)
    }
}

/// One payment attempt against the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: PurchaseId,
    pub customer_id: CustomerId,
    pub provider: String,
    pub provider_order_id: String,
    pub status: PurchaseStatus,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub payment_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Idempotency ledger row for one inbound gateway notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub provider: String,
    pub provider_event_id: String,
    pub event_type: String,
    /// Purchase or install the event resolved to, once known.
    pub related_id: Option<uuid::Uuid>,
    pub payload: serde_json::Value,
    pub status: WebhookEventStatus,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One customer-specific deployed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Install {
    pub id: InstallId,
    pub customer_id: CustomerId,
    pub purchase_id: PurchaseId,
    pub status: InstallStatus,
    pub project_id: Option<String>,
    pub environment_id: Option<String>,
    pub web_service_id: Option<String>,
    pub worker_service_id: Option<String>,
    pub domain: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl Install {
    pub fn new(customer_id: CustomerId, purchase_id: PurchaseId, now: DateTime<Utc>) -> Self {
        Self {
            id: InstallId::new(),
            customer_id,
            purchase_id,
            status: InstallStatus::Pending,
            project_id: None,
            environment_id: None,
            web_service_id: None,
            worker_service_id: None,
            domain: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            provisioned_at: None,
            activated_at: None,
        }
    }

    /// Move to `next`, rejecting regressions.
    pub fn transition_to(&mut self, next: InstallStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "install {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        match next {
            InstallStatus::SetupPending => self.provisioned_at = Some(now),
            InstallStatus::Active => self.activated_at = Some(now),
            InstallStatus::Pending => self.error_message = None,
            _ => {}
        }
        Ok(())
    }

    /// Web and worker service ids plus the environment, once `provision` has run.
    pub fn deployment_targets(&self) -> Option<DeploymentTargets<'_>> {
        Some(DeploymentTargets {
            project_id: self.project_id.as_deref()?,
            environment_id: self.environment_id.as_deref()?,
            web_service_id: self.web_service_id.as_deref()?,
            worker_service_id: self.worker_service_id.as_deref()?,
        })
    }
}

/// Borrowed view of an install's platform resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentTargets<'a> {
    pub project_id: &'a str,
    pub environment_id: &'a str,
    pub web_service_id: &'a str,
    pub worker_service_id: &'a str,
}

/// One queued provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningJob {
    pub id: JobId,
    pub install_id: InstallId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProvisioningJob {
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Claimable by a worker at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.next_run_at <= now
            && self.locked_until.is_none_or(|until| until < now)
    }
}

/// One-time credential for finishing setup. Only the token hash is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupToken {
    pub id: SetupTokenId,
    pub install_id: InstallId,
    pub token_hash: String,
    pub encrypted_secret: String,
    pub secret_nonce: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SetupToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
