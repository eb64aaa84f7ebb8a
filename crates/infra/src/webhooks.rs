//! Webhook ingestion.
//!
//! Verifies the gateway signature over the raw body, records the event in the
//! idempotency ledger and applies its effect on purchases and installs. Once a
//! signature has been accepted, downstream failures are stored on the event
//! (for operator replay) and acknowledged, so the gateway does not retry-storm.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use provisioner_core::{
    Install, InstallId, JobType, Purchase, PurchaseId, PurchaseStatus, WebhookEvent, WebhookEventId,
    WebhookEventStatus,
};

use crate::external::{GatewayError, NormalizedEvent, PaymentGateway};
use crate::jobs::JobQueue;
use crate::ledger::{Ledger, LedgerError, LedgerResult, NewWebhookEvent};

/// Upper bound for operator listings.
pub const MAX_LIST_LIMIT: u32 = 500;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("missing webhook signature")]
    MissingSignature,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("webhook event {0} carries no order id")]
    MissingOrderId(WebhookEventId),

    #[error("webhook event {0} not found")]
    NotFound(WebhookEventId),

    #[error("webhook event {id} is {status} and cannot be replayed")]
    NotReplayable {
        id: WebhookEventId,
        status: WebhookEventStatus,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn malformed(e: GatewayError) -> IngestError {
    match e {
        GatewayError::MalformedPayload(reason) => IngestError::MalformedPayload(reason),
        other => IngestError::MalformedPayload(other.to_string()),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Processed,
    Ignored,
    Duplicate,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Processed => "processed",
            IngestStatus::Ignored => "ignored",
            IngestStatus::Duplicate => "duplicate",
            IngestStatus::Failed => "failed",
        }
    }
}

/// Acknowledgement returned to the gateway (and to operators on replay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub status: IngestStatus,
    pub event_id: WebhookEventId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_id: Option<PurchaseId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_id: Option<InstallId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IngestOutcome {
    fn new(status: IngestStatus, event: &WebhookEvent) -> Self {
        Self {
            status,
            event_id: event.id,
            purchase_id: event.related_id.map(PurchaseId::from_uuid),
            install_id: None,
            message: None,
        }
    }

    fn purchase(mut self, id: PurchaseId) -> Self {
        self.purchase_id = Some(id);
        self
    }

    fn install(mut self, id: InstallId) -> Self {
        self.install_id = Some(id);
        self
    }

    fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub struct WebhookIngestor {
    ledger: Arc<dyn Ledger>,
    queue: Arc<JobQueue>,
    gateways: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl std::fmt::Debug for WebhookIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookIngestor")
            .field("providers", &self.gateways.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl WebhookIngestor {
    pub fn new(ledger: Arc<dyn Ledger>, queue: Arc<JobQueue>) -> Self {
        Self {
            ledger,
            queue,
            gateways: HashMap::new(),
        }
    }

    /// Register a gateway under its `provider()` name.
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.provider().to_string(), gateway);
        self
    }

    pub fn gateway(&self, provider: &str) -> Result<&Arc<dyn PaymentGateway>, IngestError> {
        self.gateways
            .get(provider)
            .ok_or_else(|| IngestError::UnknownProvider(provider.to_string()))
    }

    /// Handle one delivery. `raw_body` must be the exact bytes received.
    #[instrument(skip(self, signature, raw_body), fields(body_len = raw_body.len()), err(Display))]
    pub async fn ingest(
        &self,
        provider: &str,
        signature: Option<&str>,
        event_id_hint: Option<&str>,
        raw_body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let gateway = self.gateway(provider)?;

        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(IngestError::MissingSignature)?;
        if !gateway.verify_webhook_signature(raw_body, signature) {
            warn!(provider, "webhook signature rejected");
            return Err(IngestError::InvalidSignature);
        }

        let parsed = gateway
            .parse_webhook_payload(raw_body, event_id_hint)
            .map_err(malformed)?;
        if parsed.fallback_id {
            warn!(
                provider,
                event_id = %parsed.event_id,
                "webhook carried no event id; using a derived one"
            );
        }

        if let Some(existing) = self.ledger.find_webhook_event(provider, &parsed.event_id).await? {
            if existing.status.is_settled() {
                info!(provider, event_id = %existing.id, "duplicate webhook acknowledged");
                return Ok(IngestOutcome::new(IngestStatus::Duplicate, &existing));
            }
        }

        let payload: serde_json::Value = serde_json::from_slice(raw_body)
            .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;
        let (event, inserted) = self
            .ledger
            .insert_webhook_event(NewWebhookEvent {
                provider: provider.to_string(),
                provider_event_id: parsed.event_id.clone(),
                event_type: parsed.event_type.clone(),
                payload,
            })
            .await?;
        if !inserted && event.status.is_settled() {
            return Ok(IngestOutcome::new(IngestStatus::Duplicate, &event));
        }

        let outcome = self.dispatch(&event, &parsed).await?;
        info!(
            provider,
            event_type = %parsed.event_type,
            event_id = %outcome.event_id,
            status = outcome.status.as_str(),
            "webhook handled"
        );
        Ok(outcome)
    }

    /// Stored events, newest first.
    pub async fn list_events(
        &self,
        status: Option<WebhookEventStatus>,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, IngestError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        Ok(self.ledger.list_webhook_events(status, limit).await?)
    }

    /// Re-drive a stored `received` or `failed` event. The signature was
    /// verified on first receipt and is not checked again.
    #[instrument(skip(self), err(Display))]
    pub async fn replay(&self, id: WebhookEventId) -> Result<IngestOutcome, IngestError> {
        let event = self
            .ledger
            .get_webhook_event(id)
            .await?
            .ok_or(IngestError::NotFound(id))?;
        if event.status.is_settled() {
            return Err(IngestError::NotReplayable {
                id,
                status: event.status,
            });
        }

        let gateway = self.gateway(&event.provider)?;
        let raw = serde_json::to_vec(&event.payload)
            .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;
        let parsed = gateway
            .parse_webhook_payload(&raw, Some(&event.provider_event_id))
            .map_err(malformed)?;

        let outcome = self.dispatch(&event, &parsed).await?;
        info!(event_id = %id, status = outcome.status.as_str(), "webhook replayed");
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        event: &WebhookEvent,
        parsed: &NormalizedEvent,
    ) -> Result<IngestOutcome, IngestError> {
        match parsed.event_type.as_str() {
            "payment.captured" | "order.paid" => self.on_paid(event, parsed).await,
            "payment.failed" => self.on_payment_failed(event, parsed).await,
            "refund.created" | "refund.processed" => self.on_refund(event, parsed).await,
            other => {
                self.settle(event, WebhookEventStatus::Ignored, None, None).await?;
                Ok(IngestOutcome::new(IngestStatus::Ignored, event)
                    .message(format!("event type {other} is not handled")))
            }
        }
    }

    async fn on_paid(
        &self,
        event: &WebhookEvent,
        parsed: &NormalizedEvent,
    ) -> Result<IngestOutcome, IngestError> {
        let Some(order_id) = parsed.order_id.as_deref() else {
            self.settle(event, WebhookEventStatus::Failed, None, Some("missing order id"))
                .await?;
            return Err(IngestError::MissingOrderId(event.id));
        };
        let Some(purchase) = self.find_purchase(event, order_id).await? else {
            return self.purchase_not_found(event, order_id).await;
        };

        let now = Utc::now();
        let transitioned = self
            .ledger
            .mark_purchase_paid(purchase.id, parsed.payment_id.as_deref(), now)
            .await?;
        if !transitioned {
            let current = self
                .ledger
                .get_purchase(purchase.id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("purchase {}", purchase.id)))?;
            if current.status != PurchaseStatus::Paid {
                warn!(purchase_id = %purchase.id, status = %current.status, "capture for a purchase that cannot be paid");
                self.settle(event, WebhookEventStatus::Ignored, Some(purchase.id), None)
                    .await?;
                return Ok(IngestOutcome::new(IngestStatus::Ignored, event)
                    .purchase(purchase.id)
                    .message(format!("purchase is {}", current.status)));
            }
            if let Some(install) = self.ledger.find_install_by_purchase(purchase.id).await? {
                self.settle(event, WebhookEventStatus::Ignored, Some(purchase.id), None)
                    .await?;
                return Ok(IngestOutcome::new(IngestStatus::Ignored, event)
                    .purchase(purchase.id)
                    .install(install.id)
                    .message("purchase already paid"));
            }
            // Paid by an earlier delivery that failed before the install existed.
            warn!(purchase_id = %purchase.id, "paid purchase has no install; completing");
        }

        let install = Install::new(purchase.customer_id, purchase.id, now);
        let first_job = self.queue.new_job(install.id, JobType::Provision, Duration::ZERO);
        match self.ledger.create_install_with_job(&install, first_job).await {
            Ok(Some(job)) => {
                self.settle(event, WebhookEventStatus::Processed, Some(purchase.id), None)
                    .await?;
                info!(
                    purchase_id = %purchase.id,
                    install_id = %install.id,
                    job_id = %job.id,
                    "purchase paid; provisioning queued"
                );
                Ok(IngestOutcome::new(IngestStatus::Processed, event)
                    .purchase(purchase.id)
                    .install(install.id))
            }
            Ok(None) => {
                let existing = self.ledger.find_install_by_purchase(purchase.id).await?;
                self.settle(event, WebhookEventStatus::Ignored, Some(purchase.id), None)
                    .await?;
                let outcome = IngestOutcome::new(IngestStatus::Ignored, event)
                    .purchase(purchase.id)
                    .message("install already exists");
                Ok(match existing {
                    Some(install) => outcome.install(install.id),
                    None => outcome,
                })
            }
            Err(e) => {
                let message = format!("failed to queue provisioning: {e}");
                warn!(purchase_id = %purchase.id, error = %e, "install creation failed");
                self.settle(event, WebhookEventStatus::Failed, Some(purchase.id), Some(&message))
                    .await?;
                Ok(IngestOutcome::new(IngestStatus::Failed, event)
                    .purchase(purchase.id)
                    .message(message))
            }
        }
    }

    async fn on_payment_failed(
        &self,
        event: &WebhookEvent,
        parsed: &NormalizedEvent,
    ) -> Result<IngestOutcome, IngestError> {
        let Some(order_id) = parsed.order_id.as_deref() else {
            return self.unresolved(event, "missing order id").await;
        };
        let Some(purchase) = self.find_purchase(event, order_id).await? else {
            return self.purchase_not_found(event, order_id).await;
        };

        let outcome = IngestOutcome::new(IngestStatus::Processed, event).purchase(purchase.id);
        let outcome = if matches!(purchase.status, PurchaseStatus::Paid | PurchaseStatus::Refunded) {
            outcome.message(format!("purchase is already {}", purchase.status))
        } else {
            self.ledger
                .set_purchase_status(purchase.id, PurchaseStatus::Failed)
                .await?;
            outcome
        };
        self.settle(event, WebhookEventStatus::Processed, Some(purchase.id), None)
            .await?;
        Ok(outcome)
    }

    async fn on_refund(
        &self,
        event: &WebhookEvent,
        parsed: &NormalizedEvent,
    ) -> Result<IngestOutcome, IngestError> {
        let Some(order_id) = parsed.order_id.as_deref() else {
            return self.unresolved(event, "missing order id").await;
        };
        let Some(purchase) = self.find_purchase(event, order_id).await? else {
            return self.purchase_not_found(event, order_id).await;
        };

        self.ledger
            .set_purchase_status(purchase.id, PurchaseStatus::Refunded)
            .await?;
        self.settle(event, WebhookEventStatus::Processed, Some(purchase.id), None)
            .await?;
        info!(purchase_id = %purchase.id, "purchase refunded");
        Ok(IngestOutcome::new(IngestStatus::Processed, event).purchase(purchase.id))
    }

    async fn find_purchase(&self, event: &WebhookEvent, order_id: &str) -> LedgerResult<Option<Purchase>> {
        self.ledger.find_purchase_by_order(&event.provider, order_id).await
    }

    async fn purchase_not_found(
        &self,
        event: &WebhookEvent,
        order_id: &str,
    ) -> Result<IngestOutcome, IngestError> {
        warn!(order_id, event_id = %event.id, "webhook for unknown order");
        self.unresolved(event, "purchase not found").await
    }

    async fn unresolved(&self, event: &WebhookEvent, reason: &str) -> Result<IngestOutcome, IngestError> {
        self.settle(event, WebhookEventStatus::Failed, None, Some(reason))
            .await?;
        Ok(IngestOutcome::new(IngestStatus::Failed, event).message(reason))
    }

    async fn settle(
        &self,
        event: &WebhookEvent,
        status: WebhookEventStatus,
        purchase_id: Option<PurchaseId>,
        error: Option<&str>,
    ) -> LedgerResult<()> {
        self.ledger
            .finish_webhook_event(
                event.id,
                status,
                purchase_id.map(|id| *id.as_uuid()),
                error,
                Utc::now(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{RazorpayConfig, RazorpayGateway};
    use crate::jobs::JobQueueConfig;
    use crate::ledger::{InMemoryLedger, NewPurchase};
    use provisioner_crypto::hmac_sha256_hex;

    const SECRET: &[u8] = b"whsec";

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        ingestor: WebhookIngestor,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(JobQueue::new(ledger.clone(), JobQueueConfig::default()));
        let gateway = RazorpayGateway::new(
            RazorpayConfig {
                key_id: "rzp_test".into(),
                key_secret: "key-secret".into(),
                webhook_secret: "whsec".into(),
                api_base: "http://127.0.0.1:9".into(),
            },
            reqwest::Client::new(),
        );
        let ingestor = WebhookIngestor::new(ledger.clone(), queue).with_gateway(Arc::new(gateway));
        Fixture { ledger, ingestor }
    }

    async fn purchase(ledger: &InMemoryLedger, order_id: &str) -> Purchase {
        let customer = ledger.upsert_customer("a@x.com", "A").await.unwrap();
        ledger
            .create_purchase(NewPurchase {
                customer_id: customer.id,
                provider: "razorpay".into(),
                provider_order_id: order_id.into(),
                amount: 499900,
                currency: "INR".into(),
            })
            .await
            .unwrap()
    }

    fn event(id: &str, kind: &str, order_id: &str) -> Vec<u8> {
        serde_json::json!({
            "id": id,
            "entity": "event",
            "event": kind,
            "created_at": 1700000000,
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_1",
                        "order_id": order_id,
                        "amount": 499900,
                        "currency": "INR"
                    }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    fn sign(body: &[u8]) -> String {
        hmac_sha256_hex(SECRET, body)
    }

    #[tokio::test]
    async fn unknown_provider_and_bad_signatures_write_nothing() {
        let f = fixture();
        let body = event("evt_1", "payment.captured", "order_1");

        let err = f.ingestor.ingest("stripe", Some("x"), None, &body).await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownProvider(_)));

        let err = f.ingestor.ingest("razorpay", None, None, &body).await.unwrap_err();
        assert!(matches!(err, IngestError::MissingSignature));

        let err = f
            .ingestor
            .ingest("razorpay", Some(&"0".repeat(64)), None, &body)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidSignature));

        assert_eq!(f.ledger.webhook_event_count(), 0);
    }

    #[tokio::test]
    async fn captured_payment_creates_one_install_and_job() {
        let f = fixture();
        let purchase = purchase(&f.ledger, "order_1").await;
        let body = event("evt_1", "payment.captured", "order_1");

        let first = f
            .ingestor
            .ingest("razorpay", Some(&sign(&body)), None, &body)
            .await
            .unwrap();
        assert_eq!(first.status, IngestStatus::Processed);
        assert_eq!(first.purchase_id, Some(purchase.id));
        let install_id = first.install_id.unwrap();

        let second = f
            .ingestor
            .ingest("razorpay", Some(&sign(&body)), None, &body)
            .await
            .unwrap();
        assert_eq!(second.status, IngestStatus::Duplicate);
        assert_eq!(second.event_id, first.event_id);

        let paid = f.ledger.get_purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(paid.status, PurchaseStatus::Paid);
        assert_eq!(paid.payment_id.as_deref(), Some("pay_1"));
        assert_eq!(f.ledger.jobs_for_install(install_id).await.unwrap().len(), 1);
        assert_eq!(f.ledger.webhook_event_count(), 1);
    }

    #[tokio::test]
    async fn second_capture_event_for_paid_purchase_is_ignored() {
        let f = fixture();
        purchase(&f.ledger, "order_1").await;
        let captured = event("evt_1", "payment.captured", "order_1");
        let order_paid = event("evt_2", "order.paid", "order_1");

        let first = f
            .ingestor
            .ingest("razorpay", Some(&sign(&captured)), None, &captured)
            .await
            .unwrap();
        let second = f
            .ingestor
            .ingest("razorpay", Some(&sign(&order_paid)), None, &order_paid)
            .await
            .unwrap();

        assert_eq!(second.status, IngestStatus::Ignored);
        assert_eq!(second.install_id, first.install_id);
    }

    #[tokio::test]
    async fn unknown_order_is_stored_as_failed_and_acknowledged() {
        let f = fixture();
        let body = event("evt_1", "payment.captured", "order_missing");

        let outcome = f
            .ingestor
            .ingest("razorpay", Some(&sign(&body)), None, &body)
            .await
            .unwrap();
        assert_eq!(outcome.status, IngestStatus::Failed);
        assert_eq!(outcome.message.as_deref(), Some("purchase not found"));

        let stored = f.ledger.get_webhook_event(outcome.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WebhookEventStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("purchase not found"));
    }

    #[tokio::test]
    async fn failed_event_can_be_replayed_once_the_purchase_exists() {
        let f = fixture();
        let body = event("evt_1", "payment.captured", "order_late");
        let failed = f
            .ingestor
            .ingest("razorpay", Some(&sign(&body)), None, &body)
            .await
            .unwrap();

        purchase(&f.ledger, "order_late").await;
        let replayed = f.ingestor.replay(failed.event_id).await.unwrap();
        assert_eq!(replayed.status, IngestStatus::Processed);
        assert!(replayed.install_id.is_some());

        let err = f.ingestor.replay(failed.event_id).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::NotReplayable {
                status: WebhookEventStatus::Processed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn payment_failure_does_not_regress_a_paid_purchase() {
        let f = fixture();
        let purchase = purchase(&f.ledger, "order_1").await;
        let captured = event("evt_1", "payment.captured", "order_1");
        let failed = event("evt_2", "payment.failed", "order_1");

        f.ingestor
            .ingest("razorpay", Some(&sign(&captured)), None, &captured)
            .await
            .unwrap();
        let outcome = f
            .ingestor
            .ingest("razorpay", Some(&sign(&failed)), None, &failed)
            .await
            .unwrap();

        assert_eq!(outcome.status, IngestStatus::Processed);
        let stored = f.ledger.get_purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Paid);
    }

    #[tokio::test]
    async fn capture_after_refund_is_ignored() {
        let f = fixture();
        let purchase = purchase(&f.ledger, "order_1").await;
        let refund = event("evt_1", "refund.processed", "order_1");
        let captured = event("evt_2", "payment.captured", "order_1");

        f.ingestor
            .ingest("razorpay", Some(&sign(&refund)), None, &refund)
            .await
            .unwrap();
        let outcome = f
            .ingestor
            .ingest("razorpay", Some(&sign(&captured)), None, &captured)
            .await
            .unwrap();

        assert_eq!(outcome.status, IngestStatus::Ignored);
        assert_eq!(outcome.message.as_deref(), Some("purchase is refunded"));
        assert!(outcome.install_id.is_none());
        let stored = f.ledger.get_purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Refunded);
        assert!(f.ledger.find_install_by_purchase(purchase.id).await.unwrap().is_none());
        let event = f.ledger.get_webhook_event(outcome.event_id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookEventStatus::Ignored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_share_one_event_row() {
        let f = Arc::new(fixture());
        let purchase = purchase(&f.ledger, "order_1").await;
        let body = Arc::new(event("evt_1", "payment.captured", "order_1"));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let f = f.clone();
            let body = body.clone();
            tasks.push(tokio::spawn(async move {
                f.ingestor
                    .ingest("razorpay", Some(&sign(&body)), None, &body)
                    .await
                    .unwrap()
            }));
        }
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        assert_eq!(f.ledger.webhook_event_count(), 1);
        assert!(outcomes.iter().all(|o| o.event_id == outcomes[0].event_id));
        assert_eq!(
            outcomes.iter().filter(|o| o.status == IngestStatus::Processed).count(),
            1
        );
        let install = f.ledger.find_install_by_purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(f.ledger.jobs_for_install(install.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn losing_insert_returns_the_stored_row() {
        let f = fixture();
        let new = || NewWebhookEvent {
            provider: "razorpay".into(),
            provider_event_id: "evt_1".into(),
            event_type: "payment.captured".into(),
            payload: serde_json::json!({}),
        };

        let (first, inserted) = f.ledger.insert_webhook_event(new()).await.unwrap();
        assert!(inserted);
        let (second, inserted) = f.ledger.insert_webhook_event(new()).await.unwrap();
        assert!(!inserted);
        assert_eq!(second.id, first.id);
        assert_eq!(f.ledger.webhook_event_count(), 1);
    }

    #[tokio::test]
    async fn unhandled_types_are_ignored() {
        let f = fixture();
        let body = event("evt_9", "payment.authorized", "order_1");
        let outcome = f
            .ingestor
            .ingest("razorpay", Some(&sign(&body)), None, &body)
            .await
            .unwrap();
        assert_eq!(outcome.status, IngestStatus::Ignored);

        let listed = f
            .ingestor
            .list_events(Some(WebhookEventStatus::Ignored), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn outcome_serialises_camel_case_without_empty_fields() {
        let event_id = WebhookEventId::new();
        let outcome = IngestOutcome {
            status: IngestStatus::Duplicate,
            event_id,
            purchase_id: None,
            install_id: None,
            message: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "duplicate", "eventId": event_id.to_string() })
        );
    }
}
