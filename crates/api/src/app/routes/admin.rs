//! Operator endpoints. Mounted behind [`crate::middleware::admin_auth`].

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use provisioner_core::{InstallId, WebhookEventId, WebhookEventStatus};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

const DEFAULT_LIST_LIMIT: u32 = 50;

pub fn router() -> Router {
    Router::new()
        .route("/webhooks", get(list_webhooks))
        .route("/webhooks/:id/replay", post(replay_webhook))
        .route("/installs/:id/retry", post(retry_install))
        .route("/installs/:id/jobs", get(install_jobs))
}

pub async fn list_webhooks(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::WebhookListQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(str::parse::<WebhookEventStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return errors::domain_error_to_response(e),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);

    match services.ingestor.list_events(status, limit).await {
        Ok(events) => {
            let items = events.into_iter().map(dto::WebhookEventView::from).collect::<Vec<_>>();
            (StatusCode::OK, Json(json!({ "items": items }))).into_response()
        }
        Err(e) => errors::ingest_error_to_response(e),
    }
}

pub async fn replay_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: WebhookEventId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    tracing::info!(event_id = %id, "operator replaying webhook event");

    match services.ingestor.replay(id).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::ingest_error_to_response(e),
    }
}

pub async fn retry_install(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: InstallId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.provisioner.retry_install(id).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(json!({ "job": dto::JobView::from(job) }))).into_response(),
        Err(e) => errors::provisioning_error_to_response(e),
    }
}

pub async fn install_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: InstallId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.ledger.get_install(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return errors::not_found("install not found"),
        Err(e) => return errors::ledger_error_to_response(e),
    }
    match services.queue.jobs_for_install(id).await {
        Ok(jobs) => {
            let items = jobs.into_iter().map(dto::JobView::from).collect::<Vec<_>>();
            (StatusCode::OK, Json(json!({ "items": items }))).into_response()
        }
        Err(e) => errors::ledger_error_to_response(e),
    }
}
