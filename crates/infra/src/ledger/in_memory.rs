//! In-memory ledger for tests/dev.
//!
//! Each trait call takes the single state mutex once, so claims, conditional
//! updates and insert-or-fetch are atomic exactly like their SQL counterparts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use provisioner_core::{
    Customer, CustomerId, Install, InstallId, InstallStatus, JobId, JobStatus, ProvisioningJob,
    Purchase, PurchaseId, PurchaseStatus, SetupToken, SetupTokenId, WebhookEvent, WebhookEventId,
    WebhookEventStatus,
};

use super::{
    LOCK_EXPIRED_ERROR, Ledger, LedgerError, LedgerResult, NewJob, NewPurchase, NewSetupToken,
    NewWebhookEvent,
};

#[derive(Debug, Default)]
struct State {
    customers: HashMap<CustomerId, Customer>,
    purchases: HashMap<PurchaseId, Purchase>,
    events: Vec<WebhookEvent>,
    installs: HashMap<InstallId, Install>,
    jobs: Vec<ProvisioningJob>,
    tokens: Vec<SetupToken>,
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Test hook: rewrite a job in place (e.g. to simulate an abandoned claim).
    pub fn with_job_mut<F>(&self, id: JobId, f: F) -> LedgerResult<()>
    where
        F: FnOnce(&mut ProvisioningJob),
    {
        let mut state = self.state();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("job {id}")))?;
        f(job);
        Ok(())
    }

    /// Test hook: rewrite a setup token in place (e.g. to expire it).
    pub fn with_setup_token_mut<F>(&self, id: SetupTokenId, f: F) -> LedgerResult<()>
    where
        F: FnOnce(&mut SetupToken),
    {
        let mut state = self.state();
        let token = state
            .tokens
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("setup token {id}")))?;
        f(token);
        Ok(())
    }

    /// Every setup token ever issued for an install, oldest first.
    pub fn setup_tokens_for(&self, install_id: InstallId) -> Vec<SetupToken> {
        self.state()
            .tokens
            .iter()
            .filter(|t| t.install_id == install_id)
            .cloned()
            .collect()
    }

    pub fn webhook_event_count(&self) -> usize {
        self.state().events.len()
    }
}

fn new_job_row(new: NewJob, now: DateTime<Utc>) -> ProvisioningJob {
    ProvisioningJob {
        id: JobId::new(),
        install_id: new.install_id,
        job_type: new.job_type,
        status: JobStatus::Pending,
        attempts: 0,
        max_attempts: new.max_attempts,
        next_run_at: new.run_at,
        locked_until: None,
        locked_by: None,
        last_error: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    }
}

fn processing_job<'a>(state: &'a mut State, id: JobId) -> Option<&'a mut ProvisioningJob> {
    state
        .jobs
        .iter_mut()
        .find(|j| j.id == id && j.status == JobStatus::Processing)
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn upsert_customer(&self, email: &str, name: &str) -> LedgerResult<Customer> {
        let mut state = self.state();
        if let Some(existing) = state.customers.values().find(|c| c.email == email) {
            return Ok(existing.clone());
        }
        let customer = Customer {
            id: CustomerId::new(),
            email: email.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn get_customer(&self, id: CustomerId) -> LedgerResult<Option<Customer>> {
        Ok(self.state().customers.get(&id).cloned())
    }

    async fn create_purchase(&self, new: NewPurchase) -> LedgerResult<Purchase> {
        let mut state = self.state();
        if !state.customers.contains_key(&new.customer_id) {
            return Err(LedgerError::Constraint(format!(
                "customer {} does not exist",
                new.customer_id
            )));
        }
        let duplicate = state
            .purchases
            .values()
            .any(|p| p.provider == new.provider && p.provider_order_id == new.provider_order_id);
        if duplicate {
            return Err(LedgerError::Conflict(format!(
                "purchase for {}:{} already exists",
                new.provider, new.provider_order_id
            )));
        }

        let purchase = Purchase {
            id: PurchaseId::new(),
            customer_id: new.customer_id,
            provider: new.provider,
            provider_order_id: new.provider_order_id,
            status: PurchaseStatus::Pending,
            amount: new.amount,
            currency: new.currency,
            payment_id: None,
            paid_at: None,
            created_at: Utc::now(),
        };
        state.purchases.insert(purchase.id, purchase.clone());
        Ok(purchase)
    }

    async fn get_purchase(&self, id: PurchaseId) -> LedgerResult<Option<Purchase>> {
        Ok(self.state().purchases.get(&id).cloned())
    }

    async fn find_purchase_by_order(
        &self,
        provider: &str,
        provider_order_id: &str,
    ) -> LedgerResult<Option<Purchase>> {
        Ok(self
            .state()
            .purchases
            .values()
            .find(|p| p.provider == provider && p.provider_order_id == provider_order_id)
            .cloned())
    }

    async fn mark_purchase_paid(
        &self,
        id: PurchaseId,
        payment_id: Option<&str>,
        paid_at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut state = self.state();
        let purchase = state
            .purchases
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("purchase {id}")))?;
        if !matches!(purchase.status, PurchaseStatus::Pending | PurchaseStatus::Failed) {
            return Ok(false);
        }
        purchase.status = PurchaseStatus::Paid;
        purchase.payment_id = payment_id.map(str::to_string).or(purchase.payment_id.take());
        purchase.paid_at = Some(paid_at);
        Ok(true)
    }

    async fn set_purchase_status(&self, id: PurchaseId, status: PurchaseStatus) -> LedgerResult<()> {
        let mut state = self.state();
        let purchase = state
            .purchases
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("purchase {id}")))?;
        purchase.status = status;
        Ok(())
    }

    async fn find_webhook_event(
        &self,
        provider: &str,
        provider_event_id: &str,
    ) -> LedgerResult<Option<WebhookEvent>> {
        Ok(self
            .state()
            .events
            .iter()
            .find(|e| e.provider == provider && e.provider_event_id == provider_event_id)
            .cloned())
    }

    async fn get_webhook_event(&self, id: WebhookEventId) -> LedgerResult<Option<WebhookEvent>> {
        Ok(self.state().events.iter().find(|e| e.id == id).cloned())
    }

    async fn insert_webhook_event(&self, new: NewWebhookEvent) -> LedgerResult<(WebhookEvent, bool)> {
        let mut state = self.state();
        if let Some(existing) = state
            .events
            .iter()
            .find(|e| e.provider == new.provider && e.provider_event_id == new.provider_event_id)
        {
            return Ok((existing.clone(), false));
        }

        let event = WebhookEvent {
            id: WebhookEventId::new(),
            provider: new.provider,
            provider_event_id: new.provider_event_id,
            event_type: new.event_type,
            related_id: None,
            payload: new.payload,
            status: WebhookEventStatus::Received,
            error_message: None,
            received_at: Utc::now(),
            processed_at: None,
        };
        state.events.push(event.clone());
        Ok((event, true))
    }

    async fn finish_webhook_event(
        &self,
        id: WebhookEventId,
        status: WebhookEventStatus,
        related_id: Option<uuid::Uuid>,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut state = self.state();
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("webhook event {id}")))?;
        event.status = status;
        event.related_id = related_id.or(event.related_id);
        event.error_message = error_message.map(str::to_string);
        event.processed_at = Some(at);
        Ok(())
    }

    async fn list_webhook_events(
        &self,
        status: Option<WebhookEventStatus>,
        limit: u32,
    ) -> LedgerResult<Vec<WebhookEvent>> {
        Ok(self
            .state()
            .events
            .iter()
            .rev()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn create_install_with_job(
        &self,
        install: &Install,
        job: NewJob,
    ) -> LedgerResult<Option<ProvisioningJob>> {
        let mut state = self.state();
        if state.installs.values().any(|i| i.purchase_id == install.purchase_id) {
            return Ok(None);
        }
        if job.install_id != install.id {
            return Err(LedgerError::Constraint(
                "job does not belong to the install being created".to_string(),
            ));
        }
        state.installs.insert(install.id, install.clone());
        let row = new_job_row(job, Utc::now());
        state.jobs.push(row.clone());
        Ok(Some(row))
    }

    async fn get_install(&self, id: InstallId) -> LedgerResult<Option<Install>> {
        Ok(self.state().installs.get(&id).cloned())
    }

    async fn find_install_by_purchase(&self, purchase_id: PurchaseId) -> LedgerResult<Option<Install>> {
        Ok(self
            .state()
            .installs
            .values()
            .find(|i| i.purchase_id == purchase_id)
            .cloned())
    }

    async fn update_install(&self, install: &Install) -> LedgerResult<()> {
        let mut state = self.state();
        let slot = state
            .installs
            .get_mut(&install.id)
            .ok_or_else(|| LedgerError::NotFound(format!("install {}", install.id)))?;
        *slot = install.clone();
        Ok(())
    }

    async fn fail_install(&self, id: InstallId, error: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        let mut state = self.state();
        let install = state
            .installs
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("install {id}")))?;
        if install.status != InstallStatus::Active {
            install.status = InstallStatus::Failed;
            install.error_message = Some(error.to_string());
            install.updated_at = at;
        }
        Ok(())
    }

    async fn reset_failed_install(
        &self,
        id: InstallId,
        job: NewJob,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<ProvisioningJob>> {
        let mut state = self.state();
        let install = state
            .installs
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("install {id}")))?;
        if install.status != InstallStatus::Failed {
            return Ok(None);
        }
        install.status = InstallStatus::Pending;
        install.error_message = None;
        install.updated_at = at;

        let row = new_job_row(job, at);
        state.jobs.push(row.clone());
        Ok(Some(row))
    }

    async fn create_job(&self, new: NewJob) -> LedgerResult<ProvisioningJob> {
        let mut state = self.state();
        if !state.installs.contains_key(&new.install_id) {
            return Err(LedgerError::Constraint(format!(
                "install {} does not exist",
                new.install_id
            )));
        }
        let row = new_job_row(new, Utc::now());
        state.jobs.push(row.clone());
        Ok(row)
    }

    async fn get_job(&self, id: JobId) -> LedgerResult<Option<ProvisioningJob>> {
        Ok(self.state().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn jobs_for_install(&self, install_id: InstallId) -> LedgerResult<Vec<ProvisioningJob>> {
        Ok(self
            .state()
            .jobs
            .iter()
            .filter(|j| j.install_id == install_id)
            .cloned()
            .collect())
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> LedgerResult<Option<ProvisioningJob>> {
        let mut state = self.state();
        let next = state
            .jobs
            .iter_mut()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| (j.next_run_at, *j.id.as_uuid()));

        Ok(next.map(|job| {
            job.status = JobStatus::Processing;
            job.locked_until = Some(lock_until);
            job.locked_by = Some(worker_id.to_string());
            job.attempts += 1;
            job.started_at.get_or_insert(now);
            job.clone()
        }))
    }

    async fn complete_job(&self, id: JobId, at: DateTime<Utc>) -> LedgerResult<bool> {
        let mut state = self.state();
        Ok(match processing_job(&mut state, id) {
            Some(job) => {
                job.status = JobStatus::Completed;
                job.locked_until = None;
                job.locked_by = None;
                job.completed_at = Some(at);
                true
            }
            None => false,
        })
    }

    async fn retry_job_later(
        &self,
        id: JobId,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut state = self.state();
        Ok(match processing_job(&mut state, id) {
            Some(job) => {
                job.status = JobStatus::Pending;
                job.locked_until = None;
                job.locked_by = None;
                job.last_error = Some(error.to_string());
                job.next_run_at = next_run_at;
                true
            }
            None => false,
        })
    }

    async fn fail_job(&self, id: JobId, error: &str, at: DateTime<Utc>) -> LedgerResult<bool> {
        let mut state = self.state();
        Ok(match processing_job(&mut state, id) {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.locked_until = None;
                job.locked_by = None;
                job.last_error = Some(error.to_string());
                job.completed_at = Some(at);
                true
            }
            None => false,
        })
    }

    async fn reap_expired_jobs(&self, now: DateTime<Utc>) -> LedgerResult<Vec<ProvisioningJob>> {
        let mut state = self.state();
        let mut released = Vec::new();
        for job in state.jobs.iter_mut() {
            let expired = job.status == JobStatus::Processing
                && job.locked_until.is_some_and(|until| until < now);
            if !expired {
                continue;
            }
            if job.is_exhausted() {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            } else {
                job.status = JobStatus::Pending;
            }
            job.locked_until = None;
            job.locked_by = None;
            job.next_run_at = now;
            job.last_error = Some(LOCK_EXPIRED_ERROR.to_string());
            released.push(job.clone());
        }
        Ok(released)
    }

    async fn replace_setup_token(
        &self,
        new: NewSetupToken,
        at: DateTime<Utc>,
    ) -> LedgerResult<SetupToken> {
        let mut state = self.state();
        if state.tokens.iter().any(|t| t.token_hash == new.token_hash) {
            return Err(LedgerError::Conflict("setup token hash already exists".to_string()));
        }
        for token in state
            .tokens
            .iter_mut()
            .filter(|t| t.install_id == new.install_id && !t.used)
        {
            token.used = true;
            token.used_at = Some(at);
        }

        let token = SetupToken {
            id: SetupTokenId::new(),
            install_id: new.install_id,
            token_hash: new.token_hash,
            encrypted_secret: new.encrypted_secret,
            secret_nonce: new.secret_nonce,
            expires_at: new.expires_at,
            used: false,
            used_at: None,
            created_at: at,
        };
        state.tokens.push(token.clone());
        Ok(token)
    }

    async fn find_setup_token(&self, token_hash: &str) -> LedgerResult<Option<SetupToken>> {
        Ok(self
            .state()
            .tokens
            .iter()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn consume_setup_token(&self, id: SetupTokenId, at: DateTime<Utc>) -> LedgerResult<bool> {
        let mut state = self.state();
        let token = state
            .tokens
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("setup token {id}")))?;
        if token.used {
            return Ok(false);
        }
        token.used = true;
        token.used_at = Some(at);
        Ok(true)
    }

    async fn release_setup_token(
        &self,
        id: SetupTokenId,
        consumed_at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut state = self.state();
        let install_id = state
            .tokens
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.install_id)
            .ok_or_else(|| LedgerError::NotFound(format!("setup token {id}")))?;
        if state
            .tokens
            .iter()
            .any(|t| t.install_id == install_id && t.id != id && !t.used)
        {
            return Ok(false);
        }
        let Some(token) = state.tokens.iter_mut().find(|t| t.id == id) else {
            return Ok(false);
        };
        if !token.used || token.used_at != Some(consumed_at) {
            return Ok(false);
        }
        token.used = false;
        token.used_at = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisioner_core::JobType;

    async fn seeded() -> (InMemoryLedger, Install) {
        let ledger = InMemoryLedger::new();
        let customer = ledger.upsert_customer("a@x.com", "A").await.unwrap();
        let purchase = ledger
            .create_purchase(NewPurchase {
                customer_id: customer.id,
                provider: "razorpay".into(),
                provider_order_id: "order_1".into(),
                amount: 100,
                currency: "INR".into(),
            })
            .await
            .unwrap();
        let install = Install::new(customer.id, purchase.id, Utc::now());
        ledger
            .create_install_with_job(&install, provision_job(install.id))
            .await
            .unwrap()
            .unwrap();
        (ledger, install)
    }

    fn provision_job(install_id: InstallId) -> NewJob {
        NewJob {
            install_id,
            job_type: JobType::Provision,
            max_attempts: 3,
            run_at: Utc::now() - chrono::Duration::seconds(1),
        }
    }

    #[tokio::test]
    async fn customers_are_deduplicated_by_email() {
        let ledger = InMemoryLedger::new();
        let a = ledger.upsert_customer("a@x.com", "First").await.unwrap();
        let b = ledger.upsert_customer("a@x.com", "Second").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.name, "First");
    }

    #[tokio::test]
    async fn duplicate_order_ids_conflict() {
        let (ledger, install) = seeded().await;
        let err = ledger
            .create_purchase(NewPurchase {
                customer_id: install.customer_id,
                provider: "razorpay".into(),
                provider_order_id: "order_1".into(),
                amount: 100,
                currency: "INR".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn second_install_for_a_purchase_is_not_created() {
        let (ledger, install) = seeded().await;
        let again = Install::new(install.customer_id, install.purchase_id, Utc::now());
        let created = ledger
            .create_install_with_job(&again, provision_job(again.id))
            .await
            .unwrap();
        assert!(created.is_none());
        assert!(ledger.get_install(again.id).await.unwrap().is_none());
        assert_eq!(ledger.jobs_for_install(install.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn paid_transition_happens_once() {
        let (ledger, install) = seeded().await;
        let now = Utc::now();
        assert!(ledger.mark_purchase_paid(install.purchase_id, Some("pay_1"), now).await.unwrap());
        assert!(!ledger.mark_purchase_paid(install.purchase_id, Some("pay_2"), now).await.unwrap());

        let purchase = ledger.get_purchase(install.purchase_id).await.unwrap().unwrap();
        assert_eq!(purchase.payment_id.as_deref(), Some("pay_1"));
    }

    #[tokio::test]
    async fn refunded_purchase_is_not_marked_paid() {
        let (ledger, install) = seeded().await;
        ledger
            .set_purchase_status(install.purchase_id, PurchaseStatus::Refunded)
            .await
            .unwrap();

        assert!(!ledger.mark_purchase_paid(install.purchase_id, Some("pay_1"), Utc::now()).await.unwrap());
        let purchase = ledger.get_purchase(install.purchase_id).await.unwrap().unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Refunded);
        assert!(purchase.paid_at.is_none());
    }

    #[tokio::test]
    async fn failed_purchase_can_still_be_paid() {
        let (ledger, install) = seeded().await;
        ledger
            .set_purchase_status(install.purchase_id, PurchaseStatus::Failed)
            .await
            .unwrap();
        assert!(ledger.mark_purchase_paid(install.purchase_id, None, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn claim_marks_processing_and_counts_attempts() {
        let (ledger, _install) = seeded().await;
        let now = Utc::now();
        let lock = now + chrono::Duration::minutes(5);

        let job = ledger.claim_next_job("w1", now, lock).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.locked_by.as_deref(), Some("w1"));

        assert!(ledger.claim_next_job("w2", now, lock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_prefers_earliest_due_job() {
        let (ledger, install) = seeded().await;
        let earlier = ledger
            .create_job(NewJob {
                install_id: install.id,
                job_type: JobType::Configure,
                max_attempts: 3,
                run_at: Utc::now() - chrono::Duration::minutes(10),
            })
            .await
            .unwrap();

        let now = Utc::now();
        let claimed = ledger
            .claim_next_job("w1", now, now + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, earlier.id);
    }

    #[tokio::test]
    async fn completion_requires_processing() {
        let (ledger, install) = seeded().await;
        let job = &ledger.jobs_for_install(install.id).await.unwrap()[0];
        assert!(!ledger.complete_job(job.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn replacing_a_token_revokes_the_previous_one() {
        let (ledger, install) = seeded().await;
        let now = Utc::now();
        let token = |hash: &str| NewSetupToken {
            install_id: install.id,
            token_hash: hash.to_string(),
            encrypted_secret: "c".into(),
            secret_nonce: "n".into(),
            expires_at: now + chrono::Duration::hours(1),
        };

        let first = ledger.replace_setup_token(token("h1"), now).await.unwrap();
        let second = ledger.replace_setup_token(token("h2"), now).await.unwrap();

        let first = ledger.find_setup_token(&first.token_hash).await.unwrap().unwrap();
        assert!(first.used);
        assert!(!second.used);
        assert_eq!(
            ledger.setup_tokens_for(install.id).iter().filter(|t| !t.used).count(),
            1
        );
    }

    #[tokio::test]
    async fn tokens_are_consumed_once() {
        let (ledger, install) = seeded().await;
        let now = Utc::now();
        let token = ledger
            .replace_setup_token(
                NewSetupToken {
                    install_id: install.id,
                    token_hash: "h".into(),
                    encrypted_secret: "c".into(),
                    secret_nonce: "n".into(),
                    expires_at: now + chrono::Duration::hours(1),
                },
                now,
            )
            .await
            .unwrap();

        assert!(ledger.consume_setup_token(token.id, now).await.unwrap());
        assert!(!ledger.consume_setup_token(token.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn only_the_matching_consumption_is_released() {
        let (ledger, install) = seeded().await;
        let now = Utc::now();
        let token = |hash: &str| NewSetupToken {
            install_id: install.id,
            token_hash: hash.to_string(),
            encrypted_secret: "c".into(),
            secret_nonce: "n".into(),
            expires_at: now + chrono::Duration::hours(1),
        };

        let first = ledger.replace_setup_token(token("h1"), now).await.unwrap();
        let claimed_at = now + chrono::Duration::seconds(1);
        assert!(ledger.consume_setup_token(first.id, claimed_at).await.unwrap());
        assert!(ledger.release_setup_token(first.id, claimed_at).await.unwrap());
        assert!(!ledger.find_setup_token("h1").await.unwrap().unwrap().used);

        // Revoked by a replacement: a stale release leaves it used.
        let revoked_at = now + chrono::Duration::seconds(2);
        let second = ledger.replace_setup_token(token("h2"), revoked_at).await.unwrap();
        assert!(!ledger.release_setup_token(first.id, claimed_at).await.unwrap());
        assert!(ledger.find_setup_token("h1").await.unwrap().unwrap().used);

        // A newer live token blocks the release.
        let reclaimed_at = now + chrono::Duration::seconds(3);
        assert!(ledger.consume_setup_token(second.id, reclaimed_at).await.unwrap());
        ledger.replace_setup_token(token("h3"), reclaimed_at).await.unwrap();
        assert!(!ledger.release_setup_token(second.id, reclaimed_at).await.unwrap());
    }
}
