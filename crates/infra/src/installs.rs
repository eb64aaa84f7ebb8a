//! Customer-facing install status lookups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use provisioner_core::{Customer, Install, InstallId, InstallStatus, PurchaseStatus};

use crate::ledger::{Ledger, LedgerResult};

/// Install state without platform identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSummary {
    pub id: InstallId,
    pub status: InstallStatus,
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

impl From<Install> for InstallSummary {
    fn from(install: Install) -> Self {
        Self {
            id: install.id,
            status: install.status,
            domain: install.domain,
            error_message: install.error_message,
            created_at: install.created_at,
            provisioned_at: install.provisioned_at,
            activated_at: install.activated_at,
        }
    }
}

/// Progress of a checkout, polled before the customer has an install id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderProgress {
    pub purchase_status: PurchaseStatus,
    pub install: Option<InstallSummary>,
}

#[derive(Clone)]
pub struct InstallLookup {
    ledger: Arc<dyn Ledger>,
}

impl InstallLookup {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// The install if it exists and belongs to `email`. A mismatch looks the
    /// same as a missing install.
    pub async fn for_customer(&self, id: InstallId, email: &str) -> LedgerResult<Option<InstallSummary>> {
        let Ok(email) = Customer::normalize_email(email) else {
            return Ok(None);
        };
        let Some(install) = self.ledger.get_install(id).await? else {
            return Ok(None);
        };
        let owner = self.ledger.get_customer(install.customer_id).await?;
        Ok(match owner {
            Some(customer) if customer.email == email => Some(install.into()),
            _ => None,
        })
    }

    pub async fn for_order(&self, provider: &str, order_id: &str) -> LedgerResult<Option<OrderProgress>> {
        let Some(purchase) = self.ledger.find_purchase_by_order(provider, order_id).await? else {
            return Ok(None);
        };
        let install = self.ledger.find_install_by_purchase(purchase.id).await?;
        Ok(Some(OrderProgress {
            purchase_status: purchase.status,
            install: install.map(InstallSummary::from),
        }))
    }
}
