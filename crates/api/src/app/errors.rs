use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use provisioner_core::DomainError;
use provisioner_infra::checkout::CheckoutError;
use provisioner_infra::ledger::LedgerError;
use provisioner_infra::provisioning::{ProvisioningError, SetupError};
use provisioner_infra::webhooks::IngestError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Logs the detail; the client only learns that something failed.
pub fn internal_error(err: impl std::fmt::Display) -> axum::response::Response {
    tracing::error!(error = %err, "request failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error",
    )
}

pub fn not_found(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", message)
}

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    match err {
        LedgerError::NotFound(msg) => {
            tracing::debug!(detail = %msg, "ledger record not found");
            not_found("not found")
        }
        LedgerError::Conflict(msg) => {
            tracing::warn!(detail = %msg, "ledger conflict");
            json_error(StatusCode::CONFLICT, "conflict", "request conflicts with existing data")
        }
        other => internal_error(other),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
    }
}

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match err {
        IngestError::UnknownProvider(_) => json_error(StatusCode::NOT_FOUND, "unknown_provider", err.to_string()),
        IngestError::MissingSignature | IngestError::InvalidSignature => {
            json_error(StatusCode::BAD_REQUEST, "invalid_signature", err.to_string())
        }
        IngestError::MalformedPayload(_) => json_error(StatusCode::BAD_REQUEST, "malformed_payload", err.to_string()),
        IngestError::MissingOrderId(_) => json_error(StatusCode::BAD_REQUEST, "missing_order_id", err.to_string()),
        IngestError::NotFound(_) => not_found(err.to_string()),
        IngestError::NotReplayable { .. } => json_error(StatusCode::CONFLICT, "not_replayable", err.to_string()),
        IngestError::Ledger(e) => internal_error(e),
    }
}

pub fn checkout_error_to_response(err: CheckoutError) -> axum::response::Response {
    match err {
        CheckoutError::Invalid(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        CheckoutError::Gateway(e) => {
            tracing::error!(error = %e, "gateway order creation failed");
            json_error(StatusCode::BAD_GATEWAY, "gateway_error", "payment provider is unavailable")
        }
        CheckoutError::Ledger(e) => internal_error(e),
    }
}

pub fn setup_error_to_response(err: SetupError) -> axum::response::Response {
    match err {
        SetupError::NotReady(_) => json_error(StatusCode::CONFLICT, "not_ready", err.to_string()),
        SetupError::InvalidPassword(_) => json_error(StatusCode::BAD_REQUEST, "invalid_password", err.to_string()),
        e if e.is_rejection() => json_error(StatusCode::BAD_REQUEST, "invalid_token", e.to_string()),
        SetupError::Platform(e) => {
            tracing::error!(error = %e, "instance update failed during setup");
            json_error(
                StatusCode::BAD_GATEWAY,
                "platform_error",
                "could not update your instance, please try again",
            )
        }
        other => internal_error(other),
    }
}

pub fn provisioning_error_to_response(err: ProvisioningError) -> axum::response::Response {
    match err {
        ProvisioningError::NotFound(_) => not_found(err.to_string()),
        ProvisioningError::NotRetryable { .. } => json_error(StatusCode::CONFLICT, "not_retryable", err.to_string()),
        ProvisioningError::Ledger(e) => ledger_error_to_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisioner_core::{InstallId, InstallStatus, WebhookEventId, WebhookEventStatus};

    #[test]
    fn boundary_rejections_are_client_errors() {
        assert_eq!(
            ingest_error_to_response(IngestError::InvalidSignature).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ingest_error_to_response(IngestError::UnknownProvider("stripe".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            setup_error_to_response(SetupError::Expired).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            setup_error_to_response(SetupError::NotReady(InstallStatus::Provisioning)).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn operator_conflicts_map_to_409() {
        let replay = IngestError::NotReplayable {
            id: WebhookEventId::new(),
            status: WebhookEventStatus::Processed,
        };
        assert_eq!(ingest_error_to_response(replay).status(), StatusCode::CONFLICT);

        let retry = ProvisioningError::NotRetryable {
            id: InstallId::new(),
            status: InstallStatus::Active,
        };
        assert_eq!(provisioning_error_to_response(retry).status(), StatusCode::CONFLICT);
    }

    async fn body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn storage_detail_stays_out_of_the_response() {
        let err = LedgerError::Storage(
            "database error in claim_next_job: relation \"provisioning_jobs\" does not exist".into(),
        );
        let json = body(internal_error(err)).await;
        assert_eq!(json["error"], "internal_error");
        assert_eq!(json["message"], "internal server error");

        let conflict = LedgerError::Conflict(
            "database error in create_purchase: duplicate key value violates unique constraint".into(),
        );
        let json = body(ledger_error_to_response(conflict)).await;
        assert_eq!(json["error"], "conflict");
        assert!(!json["message"].as_str().unwrap().contains("database"));
    }

    #[test]
    fn storage_failures_are_internal() {
        let err = LedgerError::Storage("connection reset".into());
        assert_eq!(
            ledger_error_to_response(err.clone()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            checkout_error_to_response(CheckoutError::Ledger(err)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
