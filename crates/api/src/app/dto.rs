//! Request/response bodies. JSON field names are camelCase.

use serde::{Deserialize, Serialize};

use provisioner_core::{ProvisioningJob, WebhookEvent};

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSetupRequest {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm_password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSetupResponse {
    pub success: bool,
    pub domain: String,
    pub message: &'static str,
    pub login_url: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallQuery {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookListQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventView {
    pub id: String,
    pub provider: String,
    pub provider_event_id: String,
    pub event_type: String,
    pub status: String,
    pub error_message: Option<String>,
    pub related_id: Option<String>,
    pub received_at: String,
    pub processed_at: Option<String>,
}

impl From<WebhookEvent> for WebhookEventView {
    fn from(e: WebhookEvent) -> Self {
        Self {
            id: e.id.to_string(),
            provider: e.provider,
            provider_event_id: e.provider_event_id,
            event_type: e.event_type,
            status: e.status.to_string(),
            error_message: e.error_message,
            related_id: e.related_id.map(|id| id.to_string()),
            received_at: e.received_at.to_rfc3339(),
            processed_at: e.processed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: String,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
}

impl From<ProvisioningJob> for JobView {
    fn from(j: ProvisioningJob) -> Self {
        Self {
            id: j.id.to_string(),
            job_type: j.job_type.to_string(),
            status: j.status.to_string(),
            attempts: j.attempts,
            max_attempts: j.max_attempts,
            next_run_at: j.next_run_at.to_rfc3339(),
            locked_by: j.locked_by,
            last_error: j.last_error,
        }
    }
}
