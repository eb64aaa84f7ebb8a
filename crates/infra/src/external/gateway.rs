//! Payment gateway adapter.
//!
//! Signature checks always run over the exact request bytes the gateway sent;
//! callers must hand over the raw body before any JSON parsing.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use provisioner_crypto::{constant_time_eq, hash_token, hmac_sha256_hex};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(String),

    #[error("gateway returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateOrder {
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    /// Merchant reference shown on the gateway dashboard.
    pub receipt: String,
    pub notes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

/// Provider-agnostic view of a webhook notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub event_type: String,
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    /// The provider sent no event id; `event_id` was synthesised from the payload.
    pub fallback_id: bool,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Path segment and ledger provider name, e.g. `razorpay`.
    fn provider(&self) -> &str;

    /// Public key handed to the checkout page.
    fn key_id(&self) -> &str;

    /// Header carrying the webhook signature.
    fn signature_header(&self) -> &str;

    /// Header carrying the provider's delivery/event id, if the provider sends one.
    fn event_id_header(&self) -> Option<&str> {
        None
    }

    async fn create_order(&self, order: CreateOrder) -> Result<GatewayOrder, GatewayError>;

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool;

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    fn parse_webhook_payload(
        &self,
        raw_body: &[u8],
        event_id_hint: Option<&str>,
    ) -> Result<NormalizedEvent, GatewayError>;
}

#[derive(Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    pub api_base: String,
}

impl std::fmt::Debug for RazorpayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RazorpayConfig")
            .field("key_id", &self.key_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

/// Razorpay Orders API + webhook verification.
#[derive(Debug, Clone)]
pub struct RazorpayGateway {
    http: reqwest::Client,
    cfg: RazorpayConfig,
}

impl RazorpayGateway {
    pub const PROVIDER: &'static str = "razorpay";

    pub fn new(cfg: RazorpayConfig, http: reqwest::Client) -> Self {
        Self { http, cfg }
    }

    /// Build with a dedicated client bounded by the given timeouts.
    pub fn with_timeouts(
        cfg: RazorpayConfig,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self::new(cfg, http))
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    fn key_id(&self) -> &str {
        &self.cfg.key_id
    }

    fn signature_header(&self) -> &str {
        "x-razorpay-signature"
    }

    fn event_id_header(&self) -> Option<&str> {
        Some("x-razorpay-event-id")
    }

    #[instrument(skip(self, order), fields(amount = order.amount, currency = %order.currency), err)]
    async fn create_order(&self, order: CreateOrder) -> Result<GatewayOrder, GatewayError> {
        let url = format!("{}/v1/orders", self.cfg.api_base.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .basic_auth(&self.cfg.key_id, Some(&self.cfg.key_secret))
            .json(&order)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let expected = hmac_sha256_hex(self.cfg.webhook_secret.as_bytes(), raw_body);
        constant_time_eq(expected.as_bytes(), signature.trim().as_bytes())
    }

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        let message = format!("{order_id}|{payment_id}");
        let expected = hmac_sha256_hex(self.cfg.key_secret.as_bytes(), message.as_bytes());
        constant_time_eq(expected.as_bytes(), signature.trim().as_bytes())
    }

    fn parse_webhook_payload(
        &self,
        raw_body: &[u8],
        event_id_hint: Option<&str>,
    ) -> Result<NormalizedEvent, GatewayError> {
        parse_razorpay_payload(raw_body, event_id_hint)
    }
}

fn entity<'a>(root: &'a Value, kind: &str) -> Option<&'a Value> {
    root.get("payload")?.get(kind)?.get("entity")
}

fn text(value: Option<&Value>, field: &str) -> Option<String> {
    value?
        .get(field)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Normalise a Razorpay webhook body.
///
/// Event id precedence: top-level `id`, then the delivery header, then a
/// value derived from the payload itself.
pub fn parse_razorpay_payload(
    raw_body: &[u8],
    event_id_hint: Option<&str>,
) -> Result<NormalizedEvent, GatewayError> {
    let root: Value = serde_json::from_slice(raw_body)
        .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    if !root.is_object() {
        return Err(GatewayError::MalformedPayload("body is not a JSON object".into()));
    }

    let event_type = text(Some(&root), "event")
        .ok_or_else(|| GatewayError::MalformedPayload("missing `event`".into()))?;

    let payment = entity(&root, "payment");
    let order = entity(&root, "order");
    let refund = entity(&root, "refund");

    let order_id = text(payment, "order_id").or_else(|| text(order, "id"));
    let payment_id = text(payment, "id").or_else(|| text(refund, "payment_id"));
    let source = payment.or(order);
    let amount = source.and_then(|e| e.get("amount")).and_then(Value::as_i64);
    let currency = text(source, "currency");

    let explicit = text(Some(&root), "id").or_else(|| {
        event_id_hint
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    });

    let (event_id, fallback_id) = match explicit {
        Some(id) => (id, false),
        None => {
            let entity_id = text(refund, "id").or_else(|| text(payment, "id")).or_else(|| text(order, "id"));
            let created_at = root.get("created_at").and_then(Value::as_i64);
            let id = match (entity_id, created_at) {
                (Some(entity_id), Some(created_at)) => format!("{event_type}:{entity_id}:{created_at}"),
                // Nothing stable to key on: fall back to the body digest.
                _ => format!("{event_type}:sha256:{}", hash_token(&String::from_utf8_lossy(raw_body))),
            };
            (id, true)
        }
    };

    Ok(NormalizedEvent {
        event_id,
        event_type,
        order_id,
        payment_id,
        amount,
        currency,
        fallback_id,
    })
}
