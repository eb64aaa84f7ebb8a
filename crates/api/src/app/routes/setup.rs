use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:token", get(inspect_token).post(complete_setup))
}

/// Always `200`; an unusable link is reported as `{valid: false, error}`.
pub async fn inspect_token(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
) -> axum::response::Response {
    match services.provisioner.inspect_setup_token(&token).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => errors::setup_error_to_response(e),
    }
}

pub async fn complete_setup(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
    Json(body): Json<dto::CompleteSetupRequest>,
) -> axum::response::Response {
    match services
        .provisioner
        .complete_setup(&token, &body.password, &body.confirm_password)
        .await
    {
        Ok(done) => (
            StatusCode::OK,
            Json(dto::CompleteSetupResponse {
                success: true,
                domain: done.domain,
                message: "Admin password set. You can now sign in.",
                login_url: done.login_url,
            }),
        )
            .into_response(),
        Err(e) => errors::setup_error_to_response(e),
    }
}
