use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use provisioner_core::InstallId;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_install))
        .route("/by-purchase/:order_id", get(get_by_order))
}

/// Requires the purchaser's email; a wrong email is indistinguishable from
/// an unknown install.
pub async fn get_install(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::InstallQuery>,
) -> axum::response::Response {
    let id: InstallId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    if query.email.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "email is required");
    }

    match services.installs.for_customer(id, &query.email).await {
        Ok(Some(summary)) => (StatusCode::OK, Json(summary)).into_response(),
        Ok(None) => errors::not_found("install not found"),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

/// Polled by the checkout page until the payment webhook has landed.
pub async fn get_by_order(
    Extension(services): Extension<Arc<AppServices>>,
    Path(order_id): Path<String>,
) -> axum::response::Response {
    match services
        .installs
        .for_order(services.checkout.provider(), &order_id)
        .await
    {
        Ok(Some(progress)) => (StatusCode::OK, Json(progress)).into_response(),
        Ok(None) => errors::not_found("order not found"),
        Err(e) => errors::ledger_error_to_response(e),
    }
}
