//! Inbound gateway notifications.
//!
//! The body is taken as raw bytes: the signature covers exactly what the
//! gateway sent, so nothing may parse or re-encode it first.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:provider", post(receive))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `200` with the outcome for every delivery that passed signature checks,
/// including ones whose processing failed; those are kept for replay.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let gateway = match services.ingestor.gateway(&provider) {
        Ok(gateway) => gateway,
        Err(e) => return errors::ingest_error_to_response(e),
    };
    let signature = header(&headers, gateway.signature_header());
    let event_id = gateway.event_id_header().and_then(|name| header(&headers, name));

    match services.ingestor.ingest(&provider, signature, event_id, &body).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::ingest_error_to_response(e),
    }
}
