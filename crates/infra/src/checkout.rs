//! Checkout: customer capture and gateway order creation.
//!
//! A purchase only ever becomes `paid` through a verified webhook;
//! [`CheckoutService::verify_payment`] is a client-side confirmation that
//! reports, but never changes, purchase state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use provisioner_core::{Customer, DomainError, PurchaseId, PurchaseStatus};

use crate::external::{CreateOrder, GatewayError, PaymentGateway};
use crate::ledger::{Ledger, LedgerError, NewPurchase};

const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("{0}")]
    Invalid(String),

    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<DomainError> for CheckoutError {
    fn from(e: DomainError) -> Self {
        CheckoutError::Invalid(e.message().to_string())
    }
}

/// What a checkout costs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Price {
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
}

impl Default for Price {
    fn default() -> Self {
        Self {
            amount: 499_900,
            currency: "INR".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prefill {
    pub name: String,
    pub email: String,
}

/// Everything the hosted checkout widget needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub order_id: String,
    pub purchase_id: PurchaseId,
    pub amount: i64,
    pub currency: String,
    pub key_id: String,
    pub prefill: Prefill,
    pub notes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentVerification {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_id: Option<PurchaseId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_status: Option<PurchaseStatus>,
}

pub struct CheckoutService {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PaymentGateway>,
    price: Price,
}

impl std::fmt::Debug for CheckoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutService")
            .field("provider", &self.gateway.provider())
            .field("price", &self.price)
            .finish_non_exhaustive()
    }
}

impl CheckoutService {
    pub fn new(ledger: Arc<dyn Ledger>, gateway: Arc<dyn PaymentGateway>, price: Price) -> Self {
        Self {
            ledger,
            gateway,
            price,
        }
    }

    pub fn provider(&self) -> &str {
        self.gateway.provider()
    }

    /// Upsert the customer, open a gateway order and record a `pending` purchase.
    #[instrument(skip_all, err(Display))]
    pub async fn create_checkout(&self, email: &str, name: &str) -> Result<CheckoutSession, CheckoutError> {
        let email = Customer::normalize_email(email)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CheckoutError::Invalid("name is required".into()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(CheckoutError::Invalid(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }

        let customer = self.ledger.upsert_customer(&email, name).await?;
        let notes = BTreeMap::from([
            ("customer_id".to_string(), customer.id.to_string()),
            ("email".to_string(), customer.email.clone()),
        ]);
        let order = self
            .gateway
            .create_order(CreateOrder {
                amount: self.price.amount,
                currency: self.price.currency.clone(),
                receipt: format!("rcpt_{}_{}", customer.id.short(), Utc::now().timestamp()),
                notes: notes.clone(),
            })
            .await?;

        let purchase = self
            .ledger
            .create_purchase(NewPurchase {
                customer_id: customer.id,
                provider: self.gateway.provider().to_string(),
                provider_order_id: order.id.clone(),
                amount: order.amount,
                currency: order.currency.clone(),
            })
            .await?;
        info!(
            customer_id = %customer.id,
            purchase_id = %purchase.id,
            order_id = %order.id,
            "checkout opened"
        );

        Ok(CheckoutSession {
            order_id: order.id,
            purchase_id: purchase.id,
            amount: order.amount,
            currency: order.currency,
            key_id: self.gateway.key_id().to_string(),
            prefill: Prefill {
                name: customer.name,
                email: customer.email,
            },
            notes,
        })
    }

    /// Check the client-side payment signature and report the purchase state.
    pub async fn verify_payment(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<PaymentVerification, CheckoutError> {
        if order_id.trim().is_empty() || payment_id.trim().is_empty() {
            return Err(CheckoutError::Invalid("orderId and paymentId are required".into()));
        }
        if !self.gateway.verify_payment_signature(order_id, payment_id, signature) {
            warn!(order_id, "payment signature rejected");
            return Ok(PaymentVerification {
                verified: false,
                purchase_id: None,
                purchase_status: None,
            });
        }

        let purchase = self
            .ledger
            .find_purchase_by_order(self.gateway.provider(), order_id)
            .await?;
        Ok(PaymentVerification {
            verified: true,
            purchase_id: purchase.as_ref().map(|p| p.id),
            purchase_status: purchase.map(|p| p.status),
        })
    }
}
