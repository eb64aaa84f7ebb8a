use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_checkout))
        .route("/verify", post(verify_payment))
}

pub async fn create_checkout(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CheckoutRequest>,
) -> axum::response::Response {
    match services.checkout.create_checkout(&body.email, &body.name).await {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(e) => errors::checkout_error_to_response(e),
    }
}

/// Client-side confirmation after the hosted checkout closes. Read-only:
/// purchases change state on webhooks alone.
pub async fn verify_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::VerifyPaymentRequest>,
) -> axum::response::Response {
    match services
        .checkout
        .verify_payment(&body.order_id, &body.payment_id, &body.signature)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => errors::checkout_error_to_response(e),
    }
}
