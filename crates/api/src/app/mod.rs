//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: adapter and service wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Customer-facing writes and token lookups share one per-client budget.
    let limited = Router::new()
        .nest("/checkout", routes::checkout::router())
        .nest("/setup", routes::setup::router())
        .layer(axum::middleware::from_fn_with_state(
            services.clone(),
            middleware::rate_limit,
        ));

    let admin = routes::admin::router().layer(axum::middleware::from_fn_with_state(
        services.clone(),
        middleware::admin_auth,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhooks", routes::webhooks::router())
        .nest("/install", routes::installs::router())
        .merge(limited)
        .nest("/admin", admin)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(Extension(services)),
        )
}
