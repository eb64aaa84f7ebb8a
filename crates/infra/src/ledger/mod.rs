//! Ledger store: the durable source of truth for provisioning.
//!
//! Customers, purchases, webhook events, installs, provisioning jobs and setup
//! tokens all live behind the [`Ledger`] trait. Every operation that other
//! components rely on for correctness under concurrency is a single atomic
//! step here:
//!
//! - webhook event insert-or-fetch (unique `(provider, provider_event_id)`)
//! - conditional `pending | failed -> paid` purchase transition
//! - install + first job creation (one install per purchase)
//! - job claim (`FOR UPDATE SKIP LOCKED`) and expired-lock reaping
//! - setup token replacement (revoke prior unused, insert new), consumption
//!   and release of a failed consumption
//!
//! Implementations:
//! - [`PostgresLedger`]: production store
//! - [`InMemoryLedger`]: tests/dev, same atomicity via a single mutex

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use provisioner_core::{
    Customer, CustomerId, Install, InstallId, JobId, JobType, ProvisioningJob, Purchase,
    PurchaseId, PurchaseStatus, SetupToken, SetupTokenId, WebhookEvent, WebhookEventId,
    WebhookEventStatus,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger operation error.
///
/// Infrastructure failures only; lifecycle rule violations are `DomainError`s
/// raised before the ledger is touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Foreign key or check constraint violation.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A stored row could not be mapped back to a domain record.
    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchase {
    pub customer_id: CustomerId,
    pub provider: String,
    pub provider_order_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookEvent {
    pub provider: String,
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub install_id: InstallId,
    pub job_type: JobType,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSetupToken {
    pub install_id: InstallId,
    pub token_hash: String,
    pub encrypted_secret: String,
    pub secret_nonce: String,
    pub expires_at: DateTime<Utc>,
}

/// Storage boundary for every provisioning record.
#[async_trait]
pub trait Ledger: Send + Sync {
    // Customers

    /// Insert a customer by normalised email, or return the existing one unchanged.
    async fn upsert_customer(&self, email: &str, name: &str) -> LedgerResult<Customer>;

    async fn get_customer(&self, id: CustomerId) -> LedgerResult<Option<Customer>>;

    // Purchases

    async fn create_purchase(&self, new: NewPurchase) -> LedgerResult<Purchase>;

    async fn get_purchase(&self, id: PurchaseId) -> LedgerResult<Option<Purchase>>;

    async fn find_purchase_by_order(
        &self,
        provider: &str,
        provider_order_id: &str,
    ) -> LedgerResult<Option<Purchase>>;

    /// `pending | failed -> paid`. Paid and refunded purchases are left alone.
    /// Returns whether this call made the transition.
    async fn mark_purchase_paid(
        &self,
        id: PurchaseId,
        payment_id: Option<&str>,
        paid_at: DateTime<Utc>,
    ) -> LedgerResult<bool>;

    async fn set_purchase_status(&self, id: PurchaseId, status: PurchaseStatus) -> LedgerResult<()>;

    // Webhook events

    async fn find_webhook_event(
        &self,
        provider: &str,
        provider_event_id: &str,
    ) -> LedgerResult<Option<WebhookEvent>>;

    async fn get_webhook_event(&self, id: WebhookEventId) -> LedgerResult<Option<WebhookEvent>>;

    /// Insert with `received` status, or return the row a concurrent delivery
    /// already inserted. The flag is `true` when this call inserted.
    async fn insert_webhook_event(&self, new: NewWebhookEvent) -> LedgerResult<(WebhookEvent, bool)>;

    async fn finish_webhook_event(
        &self,
        id: WebhookEventId,
        status: WebhookEventStatus,
        related_id: Option<uuid::Uuid>,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Newest first.
    async fn list_webhook_events(
        &self,
        status: Option<WebhookEventStatus>,
        limit: u32,
    ) -> LedgerResult<Vec<WebhookEvent>>;

    // Installs

    /// Insert the install and its first job together. Returns `None` (and
    /// writes nothing) when the purchase already has an install.
    async fn create_install_with_job(
        &self,
        install: &Install,
        job: NewJob,
    ) -> LedgerResult<Option<ProvisioningJob>>;

    async fn get_install(&self, id: InstallId) -> LedgerResult<Option<Install>>;

    async fn find_install_by_purchase(&self, purchase_id: PurchaseId) -> LedgerResult<Option<Install>>;

    /// Overwrite the mutable install fields.
    async fn update_install(&self, install: &Install) -> LedgerResult<()>;

    /// `* -> failed` with the error text, unless the install is already active.
    async fn fail_install(&self, id: InstallId, error: &str, at: DateTime<Utc>) -> LedgerResult<()>;

    /// `failed -> pending` plus a fresh job, atomically. `None` when the
    /// install was not in `failed`.
    async fn reset_failed_install(
        &self,
        id: InstallId,
        job: NewJob,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<ProvisioningJob>>;

    // Jobs

    async fn create_job(&self, new: NewJob) -> LedgerResult<ProvisioningJob>;

    async fn get_job(&self, id: JobId) -> LedgerResult<Option<ProvisioningJob>>;

    /// Oldest first.
    async fn jobs_for_install(&self, install_id: InstallId) -> LedgerResult<Vec<ProvisioningJob>>;

    /// Atomically claim one eligible job: `pending`, due, and not locked.
    /// Ordered by `(next_run_at, id)`; rows locked by other claimers are skipped.
    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> LedgerResult<Option<ProvisioningJob>>;

    /// `processing -> completed`. `false` when the job was no longer processing.
    async fn complete_job(&self, id: JobId, at: DateTime<Utc>) -> LedgerResult<bool>;

    /// `processing -> pending` at `next_run_at`, recording the error.
    async fn retry_job_later(
        &self,
        id: JobId,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> LedgerResult<bool>;

    /// `processing -> failed`, recording the error.
    async fn fail_job(&self, id: JobId, error: &str, at: DateTime<Utc>) -> LedgerResult<bool>;

    /// Release every `processing` job whose lock expired before `now`: back to
    /// `pending`, or `failed` when attempts are exhausted. Returns the released
    /// jobs in their new state.
    async fn reap_expired_jobs(&self, now: DateTime<Utc>) -> LedgerResult<Vec<ProvisioningJob>>;

    // Setup tokens

    /// Revoke any unused token for the install and insert the new one.
    async fn replace_setup_token(
        &self,
        new: NewSetupToken,
        at: DateTime<Utc>,
    ) -> LedgerResult<SetupToken>;

    async fn find_setup_token(&self, token_hash: &str) -> LedgerResult<Option<SetupToken>>;

    /// Mark used if still unused. Returns whether this call consumed it.
    async fn consume_setup_token(&self, id: SetupTokenId, at: DateTime<Utc>) -> LedgerResult<bool>;

    /// Undo a [`Ledger::consume_setup_token`] made at `consumed_at`. A token
    /// revoked by a later replacement carries a different `used_at` and stays
    /// used. Returns whether the token was released.
    async fn release_setup_token(
        &self,
        id: SetupTokenId,
        consumed_at: DateTime<Utc>,
    ) -> LedgerResult<bool>;
}

/// Error text stored on jobs released by the reaper.
pub const LOCK_EXPIRED_ERROR: &str = "lock expired before the worker reported back";
