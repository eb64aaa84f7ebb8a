//! Postgres-backed ledger.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | LedgerError |
//! |------------|-----------------|-------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (check violation) | `23514` | `Constraint` |
//! | Decode / ColumnDecode | N/A | `Decode` |
//! | anything else | N/A | `Storage` |
//!
//! ## Concurrency
//!
//! Job claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never receive
//! the same row. Insert-or-fetch paths use `ON CONFLICT DO NOTHING RETURNING`
//! followed by a plain select, which is race-free because the unique index
//! has already settled the winner by the time the select runs.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};
use uuid::Uuid;

use provisioner_core::{
    Customer, CustomerId, DomainError, Install, InstallId, JobId, ProvisioningJob, Purchase,
    PurchaseId, PurchaseStatus, SetupToken, SetupTokenId, WebhookEvent, WebhookEventId,
    WebhookEventStatus,
};

use super::{
    LOCK_EXPIRED_ERROR, Ledger, LedgerError, LedgerResult, NewJob, NewPurchase, NewSetupToken,
    NewWebhookEvent,
};

const SCHEMA: &str = include_str!("schema.sql");

const JOB_COLUMNS: &str = "id, install_id, job_type, status, attempts, max_attempts, next_run_at, \
     locked_until, locked_by, last_error, created_at, started_at, completed_at";

const INSTALL_COLUMNS: &str = "id, customer_id, purchase_id, status, project_id, environment_id, \
     web_service_id, worker_service_id, domain, error_message, created_at, updated_at, \
     provisioned_at, activated_at";

const EVENT_COLUMNS: &str = "id, provider, provider_event_id, event_type, related_id, payload, \
     status, error_message, received_at, processed_at";

const PURCHASE_COLUMNS: &str = "id, customer_id, provider, provider_order_id, status, amount, \
     currency, payment_id, paid_at, created_at";

const TOKEN_COLUMNS: &str = "id, install_id, token_hash, encrypted_secret, secret_nonce, \
     expires_at, used, used_at, created_at";

/// Production ledger. Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes that do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn insert_job(
        tx: &mut Transaction<'_, Postgres>,
        new: &NewJob,
        now: DateTime<Utc>,
    ) -> LedgerResult<ProvisioningJob> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO provisioning_jobs (id, install_id, job_type, status, attempts, max_attempts, next_run_at, created_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(JobId::new().as_uuid())
        .bind(new.install_id.as_uuid())
        .bind(new.job_type.as_str())
        .bind(new.max_attempts as i32)
        .bind(new.run_at)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        decode::<JobRow, _>(&row)
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    #[instrument(skip(self, name), err)]
    async fn upsert_customer(&self, email: &str, name: &str) -> LedgerResult<Customer> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO customers (id, email, name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            RETURNING id, email, name, created_at
            "#,
        )
        .bind(CustomerId::new().as_uuid())
        .bind(email)
        .bind(name)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_customer", e))?;

        let row = match inserted {
            Some(row) => row,
            None => sqlx::query("SELECT id, email, name, created_at FROM customers WHERE email = $1")
                .bind(email)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("select_customer", e))?,
        };
        decode::<CustomerRow, _>(&row)
    }

    #[instrument(skip(self), fields(customer_id = %id), err)]
    async fn get_customer(&self, id: CustomerId) -> LedgerResult<Option<Customer>> {
        let row = sqlx::query("SELECT id, email, name, created_at FROM customers WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_customer", e))?;
        row.as_ref().map(decode::<CustomerRow, _>).transpose()
    }

    #[instrument(skip(self, new), fields(provider_order_id = %new.provider_order_id), err)]
    async fn create_purchase(&self, new: NewPurchase) -> LedgerResult<Purchase> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO purchases (id, customer_id, provider, provider_order_id, status, amount, currency, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING {PURCHASE_COLUMNS}
            "#
        ))
        .bind(PurchaseId::new().as_uuid())
        .bind(new.customer_id.as_uuid())
        .bind(&new.provider)
        .bind(&new.provider_order_id)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_purchase", e))?;

        decode::<PurchaseRow, _>(&row)
    }

    #[instrument(skip(self), fields(purchase_id = %id), err)]
    async fn get_purchase(&self, id: PurchaseId) -> LedgerResult<Option<Purchase>> {
        let row = sqlx::query(&format!("SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_purchase", e))?;
        row.as_ref().map(decode::<PurchaseRow, _>).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_purchase_by_order(
        &self,
        provider: &str,
        provider_order_id: &str,
    ) -> LedgerResult<Option<Purchase>> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE provider = $1 AND provider_order_id = $2"
        ))
        .bind(provider)
        .bind(provider_order_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_purchase_by_order", e))?;
        row.as_ref().map(decode::<PurchaseRow, _>).transpose()
    }

    #[instrument(skip(self), fields(purchase_id = %id), err)]
    async fn mark_purchase_paid(
        &self,
        id: PurchaseId,
        payment_id: Option<&str>,
        paid_at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE purchases
            SET status = 'paid', payment_id = COALESCE($2, payment_id), paid_at = $3
            WHERE id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(id.as_uuid())
        .bind(payment_id)
        .bind(paid_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_purchase_paid", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_purchase(id).await? {
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(format!("purchase {id}"))),
        }
    }

    #[instrument(skip(self), fields(purchase_id = %id), err)]
    async fn set_purchase_status(&self, id: PurchaseId, status: PurchaseStatus) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE purchases SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_purchase_status", e))?;
        expect_one(result.rows_affected(), || format!("purchase {id}"))
    }

    #[instrument(skip(self), err)]
    async fn find_webhook_event(
        &self,
        provider: &str,
        provider_event_id: &str,
    ) -> LedgerResult<Option<WebhookEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE provider = $1 AND provider_event_id = $2"
        ))
        .bind(provider)
        .bind(provider_event_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_webhook_event", e))?;
        row.as_ref().map(decode::<WebhookEventRow, _>).transpose()
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get_webhook_event(&self, id: WebhookEventId) -> LedgerResult<Option<WebhookEvent>> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_webhook_event", e))?;
        row.as_ref().map(decode::<WebhookEventRow, _>).transpose()
    }

    #[instrument(
        skip(self, new),
        fields(
            provider = %new.provider,
            provider_event_id = %new.provider_event_id,
            inserted = field::Empty
        ),
        err
    )]
    async fn insert_webhook_event(&self, new: NewWebhookEvent) -> LedgerResult<(WebhookEvent, bool)> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO webhook_events (id, provider, provider_event_id, event_type, payload, status, received_at)
            VALUES ($1, $2, $3, $4, $5, 'received', $6)
            ON CONFLICT (provider, provider_event_id) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(WebhookEventId::new().as_uuid())
        .bind(&new.provider)
        .bind(&new.provider_event_id)
        .bind(&new.event_type)
        .bind(&new.payload)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_webhook_event", e))?;

        Span::current().record("inserted", inserted.is_some());
        if let Some(row) = inserted {
            return Ok((decode::<WebhookEventRow, _>(&row)?, true));
        }

        let existing = self
            .find_webhook_event(&new.provider, &new.provider_event_id)
            .await?
            .ok_or_else(|| {
                LedgerError::Storage("webhook event vanished after insert conflict".to_string())
            })?;
        Ok((existing, false))
    }

    #[instrument(skip(self, error_message), fields(event_id = %id), err)]
    async fn finish_webhook_event(
        &self,
        id: WebhookEventId,
        status: WebhookEventStatus,
        related_id: Option<Uuid>,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, related_id = COALESCE($3, related_id), error_message = $4, processed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(related_id)
        .bind(error_message)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_webhook_event", e))?;
        expect_one(result.rows_affected(), || format!("webhook event {id}"))
    }

    #[instrument(skip(self), err)]
    async fn list_webhook_events(
        &self,
        status: Option<WebhookEventStatus>,
        limit: u32,
    ) -> LedgerResult<Vec<WebhookEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM webhook_events
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY received_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_webhook_events", e))?;

        rows.iter().map(decode::<WebhookEventRow, _>).collect()
    }

    #[instrument(skip(self, install, job), fields(install_id = %install.id), err)]
    async fn create_install_with_job(
        &self,
        install: &Install,
        job: NewJob,
    ) -> LedgerResult<Option<ProvisioningJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO installs (id, customer_id, purchase_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (purchase_id) DO NOTHING
            "#,
        )
        .bind(install.id.as_uuid())
        .bind(install.customer_id.as_uuid())
        .bind(install.purchase_id.as_uuid())
        .bind(install.status.as_str())
        .bind(install.created_at)
        .bind(install.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_install", e))?;

        if inserted.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        }

        let job = Self::insert_job(&mut tx, &job, Utc::now()).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(job))
    }

    #[instrument(skip(self), fields(install_id = %id), err)]
    async fn get_install(&self, id: InstallId) -> LedgerResult<Option<Install>> {
        let row = sqlx::query(&format!("SELECT {INSTALL_COLUMNS} FROM installs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_install", e))?;
        row.as_ref().map(decode::<InstallRow, _>).transpose()
    }

    #[instrument(skip(self), fields(purchase_id = %purchase_id), err)]
    async fn find_install_by_purchase(&self, purchase_id: PurchaseId) -> LedgerResult<Option<Install>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTALL_COLUMNS} FROM installs WHERE purchase_id = $1"
        ))
        .bind(purchase_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_install_by_purchase", e))?;
        row.as_ref().map(decode::<InstallRow, _>).transpose()
    }

    #[instrument(skip(self, install), fields(install_id = %install.id, status = %install.status), err)]
    async fn update_install(&self, install: &Install) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE installs
            SET status = $2,
                project_id = $3,
                environment_id = $4,
                web_service_id = $5,
                worker_service_id = $6,
                domain = $7,
                error_message = $8,
                updated_at = $9,
                provisioned_at = $10,
                activated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(install.id.as_uuid())
        .bind(install.status.as_str())
        .bind(install.project_id.as_deref())
        .bind(install.environment_id.as_deref())
        .bind(install.web_service_id.as_deref())
        .bind(install.worker_service_id.as_deref())
        .bind(install.domain.as_deref())
        .bind(install.error_message.as_deref())
        .bind(install.updated_at)
        .bind(install.provisioned_at)
        .bind(install.activated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_install", e))?;
        expect_one(result.rows_affected(), || format!("install {}", install.id))
    }

    #[instrument(skip(self, error), fields(install_id = %id), err)]
    async fn fail_install(&self, id: InstallId, error: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE installs
            SET status = 'failed', error_message = $2, updated_at = $3
            WHERE id = $1 AND status <> 'active'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_install", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(install_id = %id), err)]
    async fn reset_failed_install(
        &self,
        id: InstallId,
        job: NewJob,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<ProvisioningJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let reset = sqlx::query(
            r#"
            UPDATE installs
            SET status = 'pending', error_message = NULL, updated_at = $2
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reset_failed_install", e))?;

        if reset.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return match self.get_install(id).await? {
                Some(_) => Ok(None),
                None => Err(LedgerError::NotFound(format!("install {id}"))),
            };
        }

        let job = Self::insert_job(&mut tx, &job, at).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(job))
    }

    #[instrument(skip(self, new), fields(install_id = %new.install_id, job_type = %new.job_type), err)]
    async fn create_job(&self, new: NewJob) -> LedgerResult<ProvisioningJob> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let job = Self::insert_job(&mut tx, &new, Utc::now()).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> LedgerResult<Option<ProvisioningJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM provisioning_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(decode::<JobRow, _>).transpose()
    }

    #[instrument(skip(self), fields(install_id = %install_id), err)]
    async fn jobs_for_install(&self, install_id: InstallId) -> LedgerResult<Vec<ProvisioningJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM provisioning_jobs WHERE install_id = $1 ORDER BY created_at, id"
        ))
        .bind(install_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs_for_install", e))?;
        rows.iter().map(decode::<JobRow, _>).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> LedgerResult<Option<ProvisioningJob>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE provisioning_jobs
            SET status = 'processing',
                locked_until = $3,
                locked_by = $1,
                attempts = attempts + 1,
                started_at = COALESCE(started_at, $2)
            WHERE id = (
                SELECT id FROM provisioning_jobs
                WHERE status = 'pending'
                  AND next_run_at <= $2
                  AND (locked_until IS NULL OR locked_until < $2)
                ORDER BY next_run_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now)
        .bind(lock_until)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next_job", e))?;

        row.as_ref().map(decode::<JobRow, _>).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn complete_job(&self, id: JobId, at: DateTime<Utc>) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET status = 'completed', locked_until = NULL, locked_by = NULL, completed_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn retry_job_later(
        &self,
        id: JobId,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET status = 'pending', locked_until = NULL, locked_by = NULL,
                last_error = $2, next_run_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(next_run_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_job_later", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail_job(&self, id: JobId, error: &str, at: DateTime<Utc>) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET status = 'failed', locked_until = NULL, locked_by = NULL,
                last_error = $2, completed_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(released = field::Empty), err)]
    async fn reap_expired_jobs(&self, now: DateTime<Utc>) -> LedgerResult<Vec<ProvisioningJob>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE provisioning_jobs
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempts >= max_attempts THEN $1 ELSE completed_at END,
                locked_until = NULL,
                locked_by = NULL,
                next_run_at = $1,
                last_error = $2
            WHERE status = 'processing' AND locked_until < $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(LOCK_EXPIRED_ERROR)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired_jobs", e))?;

        Span::current().record("released", rows.len());
        rows.iter().map(decode::<JobRow, _>).collect()
    }

    #[instrument(skip(self, new), fields(install_id = %new.install_id), err)]
    async fn replace_setup_token(
        &self,
        new: NewSetupToken,
        at: DateTime<Utc>,
    ) -> LedgerResult<SetupToken> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            "UPDATE setup_tokens SET used = TRUE, used_at = $2 WHERE install_id = $1 AND NOT used",
        )
        .bind(new.install_id.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("revoke_setup_tokens", e))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO setup_tokens (id, install_id, token_hash, encrypted_secret, secret_nonce, expires_at, used, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(SetupTokenId::new().as_uuid())
        .bind(new.install_id.as_uuid())
        .bind(&new.token_hash)
        .bind(&new.encrypted_secret)
        .bind(&new.secret_nonce)
        .bind(new.expires_at)
        .bind(at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_setup_token", e))?;

        let token = decode::<SetupTokenRow, _>(&row)?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(token)
    }

    #[instrument(skip(self, token_hash), err)]
    async fn find_setup_token(&self, token_hash: &str) -> LedgerResult<Option<SetupToken>> {
        let row = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM setup_tokens WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_setup_token", e))?;
        row.as_ref().map(decode::<SetupTokenRow, _>).transpose()
    }

    #[instrument(skip(self), fields(token_id = %id), err)]
    async fn consume_setup_token(&self, id: SetupTokenId, at: DateTime<Utc>) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE setup_tokens SET used = TRUE, used_at = $2 WHERE id = $1 AND NOT used",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("consume_setup_token", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(token_id = %id), err)]
    async fn release_setup_token(
        &self,
        id: SetupTokenId,
        consumed_at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE setup_tokens t
            SET used = FALSE, used_at = NULL
            WHERE t.id = $1 AND t.used AND t.used_at = $2
              AND NOT EXISTS (
                  SELECT 1 FROM setup_tokens o
                  WHERE o.install_id = t.install_id AND NOT o.used AND o.id <> t.id
              )
            "#,
        )
        .bind(id.as_uuid())
        .bind(consumed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_setup_token", e))?;
        Ok(result.rows_affected() == 1)
    }
}

fn expect_one(rows_affected: u64, what: impl FnOnce() -> String) -> LedgerResult<()> {
    if rows_affected == 0 {
        return Err(LedgerError::NotFound(what()));
    }
    Ok(())
}

/// Decode a row into its row type, then into the domain record.
fn decode<R, T>(row: &PgRow) -> LedgerResult<T>
where
    R: for<'r> FromRow<'r, PgRow> + Into<T>,
{
    R::from_row(row)
        .map(Into::into)
        .map_err(|e| LedgerError::Decode(e.to_string()))
}

/// Read a text column holding one of the core string enums.
fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = DomainError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: DomainError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn count_column(row: &PgRow, column: &str) -> Result<u32, sqlx::Error> {
    let raw: i32 = row.try_get(column)?;
    u32::try_from(raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

/// Map SQLx errors to LedgerError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => LedgerError::Conflict(msg),
                Some("23503") | Some("23514") => LedgerError::Constraint(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            LedgerError::NotFound(format!("unexpected row not found in {}", operation))
        }
        e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
            LedgerError::Decode(format!("{} in {}", e, operation))
        }
        _ => LedgerError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

struct CustomerRow(Customer);

impl<'r> FromRow<'r, PgRow> for CustomerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CustomerRow(Customer {
            id: CustomerId::from_uuid(row.try_get("id")?),
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        row.0
    }
}

struct PurchaseRow(Purchase);

impl<'r> FromRow<'r, PgRow> for PurchaseRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PurchaseRow(Purchase {
            id: PurchaseId::from_uuid(row.try_get("id")?),
            customer_id: CustomerId::from_uuid(row.try_get("customer_id")?),
            provider: row.try_get("provider")?,
            provider_order_id: row.try_get("provider_order_id")?,
            status: parse_column(row, "status")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            payment_id: row.try_get("payment_id")?,
            paid_at: row.try_get("paid_at")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<PurchaseRow> for Purchase {
    fn from(row: PurchaseRow) -> Self {
        row.0
    }
}

struct WebhookEventRow(WebhookEvent);

impl<'r> FromRow<'r, PgRow> for WebhookEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(WebhookEventRow(WebhookEvent {
            id: WebhookEventId::from_uuid(row.try_get("id")?),
            provider: row.try_get("provider")?,
            provider_event_id: row.try_get("provider_event_id")?,
            event_type: row.try_get("event_type")?,
            related_id: row.try_get("related_id")?,
            payload: row.try_get("payload")?,
            status: parse_column(row, "status")?,
            error_message: row.try_get("error_message")?,
            received_at: row.try_get("received_at")?,
            processed_at: row.try_get("processed_at")?,
        }))
    }
}

impl From<WebhookEventRow> for WebhookEvent {
    fn from(row: WebhookEventRow) -> Self {
        row.0
    }
}

struct InstallRow(Install);

impl<'r> FromRow<'r, PgRow> for InstallRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InstallRow(Install {
            id: InstallId::from_uuid(row.try_get("id")?),
            customer_id: CustomerId::from_uuid(row.try_get("customer_id")?),
            purchase_id: PurchaseId::from_uuid(row.try_get("purchase_id")?),
            status: parse_column(row, "status")?,
            project_id: row.try_get("project_id")?,
            environment_id: row.try_get("environment_id")?,
            web_service_id: row.try_get("web_service_id")?,
            worker_service_id: row.try_get("worker_service_id")?,
            domain: row.try_get("domain")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            provisioned_at: row.try_get("provisioned_at")?,
            activated_at: row.try_get("activated_at")?,
        }))
    }
}

impl From<InstallRow> for Install {
    fn from(row: InstallRow) -> Self {
        row.0
    }
}

struct JobRow(ProvisioningJob);

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow(ProvisioningJob {
            id: JobId::from_uuid(row.try_get("id")?),
            install_id: InstallId::from_uuid(row.try_get("install_id")?),
            job_type: parse_column(row, "job_type")?,
            status: parse_column(row, "status")?,
            attempts: count_column(row, "attempts")?,
            max_attempts: count_column(row, "max_attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            locked_until: row.try_get("locked_until")?,
            locked_by: row.try_get("locked_by")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        }))
    }
}

impl From<JobRow> for ProvisioningJob {
    fn from(row: JobRow) -> Self {
        row.0
    }
}

struct SetupTokenRow(SetupToken);

impl<'r> FromRow<'r, PgRow> for SetupTokenRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SetupTokenRow(SetupToken {
            id: SetupTokenId::from_uuid(row.try_get("id")?),
            install_id: InstallId::from_uuid(row.try_get("install_id")?),
            token_hash: row.try_get("token_hash")?,
            encrypted_secret: row.try_get("encrypted_secret")?,
            secret_nonce: row.try_get("secret_nonce")?,
            expires_at: row.try_get("expires_at")?,
            used: row.try_get("used")?,
            used_at: row.try_get("used_at")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<SetupTokenRow> for SetupToken {
    fn from(row: SetupTokenRow) -> Self {
        row.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_ledger_table() {
        for table in [
            "customers",
            "purchases",
            "webhook_events",
            "installs",
            "provisioning_jobs",
            "setup_tokens",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing {table}"
            );
        }
    }

    #[test]
    fn schema_enforces_idempotency_keys() {
        assert!(SCHEMA.contains("UNIQUE (provider, provider_event_id)"));
        assert!(SCHEMA.contains("UNIQUE (provider, provider_order_id)"));
        assert!(SCHEMA.contains("purchase_id        UUID NOT NULL UNIQUE"));
        assert!(SCHEMA.contains("ON setup_tokens (install_id) WHERE NOT used"));
    }

    use std::sync::Mutex;

    use tracing::field::{Field, Visit};
    use tracing::span::{Id, Record};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{Layer, Registry};

    use provisioner_core::JobType;

    /// Names of fields recorded on spans after creation.
    #[derive(Clone, Default)]
    struct RecordedFields(Arc<Mutex<Vec<String>>>);

    impl Visit for RecordedFields {
        fn record_debug(&mut self, field: &Field, _value: &dyn std::fmt::Debug) {
            self.0
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(field.name().to_string());
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for RecordedFields {
        fn on_record(&self, _span: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut self.clone());
        }
    }

    /// Ledger against `TEST_DATABASE_URL`; these tests are skipped without one.
    async fn test_ledger() -> Option<PostgresLedger> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let ledger = PostgresLedger::new(PgPool::connect(&url).await.unwrap());
        ledger.migrate().await.unwrap();
        Some(ledger)
    }

    async fn seeded_purchase(ledger: &PostgresLedger) -> Purchase {
        let unique = Uuid::now_v7();
        let customer = ledger
            .upsert_customer(&format!("{unique}@example.com"), "Test")
            .await
            .unwrap();
        ledger
            .create_purchase(NewPurchase {
                customer_id: customer.id,
                provider: "razorpay".into(),
                provider_order_id: format!("order_{unique}"),
                amount: 100,
                currency: "INR".into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn recorded_span_fields_reach_the_subscriber() {
        let Some(ledger) = test_ledger().await else {
            return;
        };
        let recorded = RecordedFields::default();
        let _guard = tracing::subscriber::set_default(Registry::default().with(recorded.clone()));

        ledger
            .insert_webhook_event(NewWebhookEvent {
                provider: "razorpay".into(),
                provider_event_id: format!("evt_{}", Uuid::now_v7()),
                event_type: "payment.captured".into(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();
        ledger.reap_expired_jobs(Utc::now()).await.unwrap();

        let names = recorded.0.lock().unwrap().clone();
        assert!(names.iter().any(|n| n == "inserted"), "recorded: {names:?}");
        assert!(names.iter().any(|n| n == "released"), "recorded: {names:?}");
    }

    #[tokio::test]
    async fn refunded_purchase_stays_refunded() {
        let Some(ledger) = test_ledger().await else {
            return;
        };
        let purchase = seeded_purchase(&ledger).await;
        ledger
            .set_purchase_status(purchase.id, PurchaseStatus::Refunded)
            .await
            .unwrap();

        assert!(!ledger.mark_purchase_paid(purchase.id, Some("pay_1"), Utc::now()).await.unwrap());
        let stored = ledger.get_purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Refunded);
    }

    #[tokio::test]
    async fn consumed_token_can_be_released_once() {
        let Some(ledger) = test_ledger().await else {
            return;
        };
        let purchase = seeded_purchase(&ledger).await;
        let install = Install::new(purchase.customer_id, purchase.id, Utc::now());
        ledger
            .create_install_with_job(
                &install,
                NewJob {
                    install_id: install.id,
                    job_type: JobType::Provision,
                    max_attempts: 3,
                    run_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        // Postgres keeps microseconds.
        let now = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();
        let token = ledger
            .replace_setup_token(
                NewSetupToken {
                    install_id: install.id,
                    token_hash: format!("hash_{}", Uuid::now_v7()),
                    encrypted_secret: "c".into(),
                    secret_nonce: "n".into(),
                    expires_at: now + chrono::Duration::hours(1),
                },
                now,
            )
            .await
            .unwrap();

        assert!(ledger.consume_setup_token(token.id, now).await.unwrap());
        assert!(ledger.release_setup_token(token.id, now).await.unwrap());
        assert!(!ledger.release_setup_token(token.id, now).await.unwrap());
        assert!(ledger.consume_setup_token(token.id, now).await.unwrap());
    }

    #[test]
    fn pool_closed_maps_to_storage() {
        let err = map_sqlx_error("claim_next_job", sqlx::Error::PoolClosed);
        assert!(matches!(err, LedgerError::Storage(msg) if msg.contains("claim_next_job")));
    }
}
