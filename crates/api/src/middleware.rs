use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use provisioner_crypto::constant_time_eq;
use provisioner_infra::rate_limit::{ClientKeySource, RateLimitDecision};

use crate::app::errors::json_error;
use crate::app::services::AppServices;

/// Operator endpoints: `Authorization: Bearer <ADMIN_API_TOKEN>`.
/// Without a configured token the endpoints do not exist.
pub async fn admin_auth(
    State(services): State<Arc<AppServices>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = services.admin_token.as_deref() else {
        return json_error(StatusCode::NOT_FOUND, "not_found", "not found");
    };

    match extract_bearer(req.headers()) {
        Ok(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => next.run(req).await,
        _ => json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid bearer token"),
    }
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

/// Derives the rate-limit key for a request.
pub type KeyGenerator = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

pub fn key_generator(source: ClientKeySource) -> KeyGenerator {
    match source {
        ClientKeySource::PeerAddress => Arc::new(peer_address),
        ClientKeySource::ForwardedFor => Arc::new(|req: &Request<Body>| {
            forwarded_for(req).unwrap_or_else(|| peer_address(req))
        }),
    }
}

fn peer_address(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_for(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn set_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Fixed-window limit for the public checkout and setup endpoints.
/// A failing counter store lets requests through.
pub async fn rate_limit(
    State(services): State<Arc<AppServices>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = (services.rate_limit_key)(&req);
    let decision = match services.rate_limiter.check(&key).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!(error = %e, "rate limit check failed; allowing request");
            return next.run(req).await;
        }
    };

    if !decision.allowed {
        tracing::info!(client = %key, "rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "error": "rate_limited",
                "message": services.rate_limiter.config().message,
            })),
        )
            .into_response();
        set_limit_headers(response.headers_mut(), &decision);
        if let Ok(value) = HeaderValue::from_str(&decision.retry_after_secs.to_string()) {
            response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
        }
        return response;
    }

    let mut response = next.run(req).await;
    set_limit_headers(response.headers_mut(), &decision);
    response
}
