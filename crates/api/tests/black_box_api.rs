use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::{routing::post, Json, Router};
use reqwest::StatusCode;
use serde_json::{json, Value};

use provisioner_api::app::build_app;
use provisioner_api::app::services::{Adapters, AppServices, Settings};
use provisioner_core::InstallId;
use provisioner_crypto::{hmac_sha256_hex, EncryptionService};
use provisioner_infra::external::{InMemoryPlatform, RazorpayConfig, RazorpayGateway, RecordingNotifier};
use provisioner_infra::ledger::InMemoryLedger;
use provisioner_infra::provisioning::ProvisionerConfig;
use provisioner_infra::rate_limit::{ClientKeySource, InMemoryCounterStore, RateLimitConfig};

const WEBHOOK_SECRET: &str = "whsec_test";
const KEY_SECRET: &str = "key_secret_test";
const ADMIN_TOKEN: &str = "op-token";
const PASSWORD: &str = "Str0ng!Passw0rd";

/// Stand-in for the gateway's Orders API; hands out `order_1`, `order_2`, ...
async fn spawn_order_api() -> (String, tokio::task::JoinHandle<()>) {
    let counter = Arc::new(AtomicU32::new(0));
    let app = Router::new().route(
        "/v1/orders",
        post(move |Json(body): Json<Value>| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Json(json!({
                    "id": format!("order_{n}"),
                    "amount": body["amount"],
                    "currency": body["currency"],
                }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    ledger: Arc<InMemoryLedger>,
    notifier: Arc<RecordingNotifier>,
    client: reqwest::Client,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    async fn spawn(settings: Settings) -> Self {
        let (order_api, order_handle) = spawn_order_api().await;

        let ledger = Arc::new(InMemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let gateway = RazorpayGateway::new(
            RazorpayConfig {
                key_id: "rzp_test_key".into(),
                key_secret: KEY_SECRET.into(),
                webhook_secret: WEBHOOK_SECRET.into(),
                api_base: order_api,
            },
            reqwest::Client::new(),
        );
        let services = Arc::new(AppServices::assemble(
            Adapters {
                ledger: ledger.clone(),
                gateway: Arc::new(gateway),
                platform: Arc::new(InMemoryPlatform::new()),
                notifier: notifier.clone(),
                counters: Arc::new(InMemoryCounterStore::new()),
                crypto: Arc::new(EncryptionService::new([7u8; 32])),
            },
            settings,
        ));

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            services,
            ledger,
            notifier,
            client: reqwest::Client::new(),
            handles: vec![order_handle, server_handle],
        }
    }

    async fn default() -> Self {
        Self::spawn(settings()).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn checkout(&self, email: &str) -> Value {
        let res = self
            .client
            .post(self.url("/checkout"))
            .json(&json!({ "email": email, "name": "Acme Corp" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        res.json().await.unwrap()
    }

    async fn deliver(&self, body: &str, signature: &str) -> reqwest::Response {
        self.client
            .post(self.url("/webhooks/razorpay"))
            .header("content-type", "application/json")
            .header("x-razorpay-signature", signature)
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }

    /// Run queued provisioning steps until none is eligible.
    async fn drain(&self) {
        for _ in 0..50 {
            let ran = self
                .services
                .queue
                .process_next_job("worker-test", self.services.provisioner.as_ref())
                .await
                .unwrap();
            if !ran {
                return;
            }
        }
        panic!("queue did not drain");
    }

    fn setup_token(&self, install_id: InstallId) -> String {
        let link = self.notifier.last_for(install_id).expect("setup link sent");
        link.url.rsplit('/').next().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn settings() -> Settings {
    Settings {
        provisioner: ProvisionerConfig {
            base_url: "https://orders.example.com".into(),
            ready_poll_interval: Duration::from_millis(1),
            ..ProvisionerConfig::default()
        },
        admin_token: Some(ADMIN_TOKEN.into()),
        ..Settings::default()
    }
}

fn captured(event_id: &str, order_id: &str) -> String {
    json!({
        "id": event_id,
        "entity": "event",
        "event": "payment.captured",
        "created_at": 1700000000,
        "payload": {
            "payment": {
                "entity": {
                    "id": format!("pay_{order_id}"),
                    "order_id": order_id,
                    "amount": 499900,
                    "currency": "INR"
                }
            }
        }
    })
    .to_string()
}

fn sign(body: &str) -> String {
    hmac_sha256_hex(WEBHOOK_SECRET.as_bytes(), body.as_bytes())
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::default().await;
    let res = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn checkout_creates_a_pending_order() {
    let srv = TestServer::default().await;

    let session = srv.checkout("  A@X.com ").await;
    assert_eq!(session["orderId"], "order_1");
    assert_eq!(session["amount"], 499900);
    assert_eq!(session["currency"], "INR");
    assert_eq!(session["keyId"], "rzp_test_key");
    assert_eq!(session["prefill"]["email"], "a@x.com");

    let res = srv
        .client
        .get(srv.url("/install/by-purchase/order_1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let progress: Value = res.json().await.unwrap();
    assert_eq!(progress["purchaseStatus"], "pending");
    assert!(progress["install"].is_null());
}

#[tokio::test]
async fn checkout_rejects_an_invalid_email() {
    let srv = TestServer::default().await;
    let res = srv
        .client
        .post(srv.url("/checkout"))
        .json(&json!({ "email": "not-an-email", "name": "Acme" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected_without_side_effects() {
    let srv = TestServer::default().await;
    srv.checkout("a@x.com").await;
    let body = captured("evt_1", "order_1");

    let res = srv.deliver(&body, "deadbeef").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = srv
        .client
        .post(srv.url("/webhooks/razorpay"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    assert_eq!(srv.ledger.webhook_event_count(), 0);
}

#[tokio::test]
async fn webhook_for_unknown_provider_is_404() {
    let srv = TestServer::default().await;
    let body = captured("evt_1", "order_1");
    let res = srv
        .client
        .post(srv.url("/webhooks/stripe"))
        .header("x-razorpay-signature", sign(&body))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn paid_order_is_provisioned_and_activated_through_setup() {
    let srv = TestServer::default().await;
    srv.checkout("a@x.com").await;

    let body = captured("evt_1", "order_1");
    let res = srv.deliver(&body, &sign(&body)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["status"], "processed");
    let install_id: InstallId = outcome["installId"].as_str().unwrap().parse().unwrap();

    // Redelivery is acknowledged without a second event or job.
    let res = srv.deliver(&body, &sign(&body)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["status"], "duplicate");
    assert_eq!(srv.ledger.webhook_event_count(), 1);
    assert_eq!(srv.services.queue.jobs_for_install(install_id).await.unwrap().len(), 1);

    srv.drain().await;

    let status_url = srv.url(&format!("/install/{install_id}?email=A@x.com"));
    let install: Value = srv.client.get(&status_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(install["status"], "setup_pending");
    let domain = install["domain"].as_str().unwrap().to_string();
    assert!(install.get("activatedAt").is_none());

    let res = srv
        .client
        .get(srv.url(&format!("/install/{install_id}?email=someone@else.com")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let token = srv.setup_token(install_id);
    let setup_url = srv.url(&format!("/setup/{token}"));
    let status: Value = srv.client.get(&setup_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["valid"], true);
    assert_eq!(status["domain"], domain.as_str());
    assert!(status["expiresAt"].is_string());

    let res = srv
        .client
        .post(&setup_url)
        .json(&json!({ "password": "short", "confirmPassword": "short" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = srv
        .client
        .post(&setup_url)
        .json(&json!({ "password": PASSWORD, "confirmPassword": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let done: Value = res.json().await.unwrap();
    assert_eq!(done["success"], true);
    assert_eq!(done["domain"], domain.as_str());
    assert_eq!(done["loginUrl"], format!("https://{domain}/login"));

    let status: Value = srv.client.get(&setup_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["valid"], false);
    assert!(status["error"].is_string());

    let res = srv
        .client
        .post(&setup_url)
        .json(&json!({ "password": PASSWORD, "confirmPassword": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let install: Value = srv.client.get(&status_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(install["status"], "active");
    assert!(install["activatedAt"].is_string());
}

#[tokio::test]
async fn malformed_setup_token_reports_invalid() {
    let srv = TestServer::default().await;
    let res = srv.client.get(srv.url("/setup/not-a-token")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let status: Value = res.json().await.unwrap();
    assert_eq!(status["valid"], false);
    assert_eq!(status["error"], "invalid setup link");
}

#[tokio::test]
async fn admin_endpoints_require_the_operator_token() {
    let srv = TestServer::default().await;

    let res = srv.client.get(srv.url("/admin/webhooks")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = srv
        .client
        .get(srv.url("/admin/webhooks"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = srv
        .client
        .get(srv.url("/admin/webhooks?status=failed"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["items"].as_array().unwrap().len(), 0);

    let res = srv
        .client
        .get(srv.url("/admin/webhooks?status=bogus"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_endpoints_are_absent_without_a_configured_token() {
    let srv = TestServer::spawn(Settings {
        admin_token: None,
        ..settings()
    })
    .await;

    let res = srv
        .client
        .get(srv.url("/admin/webhooks"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn operator_can_inspect_jobs_replay_events_and_retry_installs() {
    let srv = TestServer::default().await;
    srv.checkout("a@x.com").await;
    let body = captured("evt_1", "order_1");
    let outcome: Value = srv.deliver(&body, &sign(&body)).await.json().await.unwrap();
    let install_id = outcome["installId"].as_str().unwrap().to_string();
    let event_id = outcome["eventId"].as_str().unwrap().to_string();
    srv.drain().await;

    let jobs: Value = srv
        .client
        .get(srv.url(&format!("/admin/installs/{install_id}/jobs")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let types: Vec<&str> = jobs["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["jobType"].as_str().unwrap())
        .collect();
    assert_eq!(types.len(), 3);
    for expected in ["provision", "configure", "deploy"] {
        assert!(types.contains(&expected), "missing {expected} job");
    }
    assert!(jobs["items"].as_array().unwrap().iter().all(|j| j["status"] == "completed"));

    // Processed events are settled; replaying them is refused.
    let res = srv
        .client
        .post(srv.url(&format!("/admin/webhooks/{event_id}/replay")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // Only failed installs can be retried.
    let res = srv
        .client
        .post(srv.url(&format!("/admin/installs/{install_id}/retry")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = srv
        .client
        .post(srv.url(&format!("/admin/installs/{}/retry", InstallId::new())))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = srv
        .client
        .get(srv.url("/admin/installs/not-a-uuid/jobs"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn client_payment_verification_checks_the_signature() {
    let srv = TestServer::default().await;
    srv.checkout("a@x.com").await;

    let signature = hmac_sha256_hex(KEY_SECRET.as_bytes(), b"order_1|pay_1");
    let res: Value = srv
        .client
        .post(srv.url("/checkout/verify"))
        .json(&json!({ "orderId": "order_1", "paymentId": "pay_1", "signature": signature }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(res["verified"], true);
    assert_eq!(res["purchaseStatus"], "pending");

    let res: Value = srv
        .client
        .post(srv.url("/checkout/verify"))
        .json(&json!({ "orderId": "order_1", "paymentId": "pay_2", "signature": signature }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(res["verified"], false);
}

#[tokio::test]
async fn public_endpoints_are_rate_limited_per_client() {
    let srv = TestServer::spawn(Settings {
        rate_limit: RateLimitConfig {
            max: 2,
            window: Duration::from_secs(60),
            key_source: ClientKeySource::ForwardedFor,
            ..RateLimitConfig::default()
        },
        ..settings()
    })
    .await;

    let verify = |client_ip: &'static str| {
        srv.client
            .post(srv.url("/checkout/verify"))
            .header("x-forwarded-for", client_ip)
            .json(&json!({ "orderId": "order_1", "paymentId": "pay_1", "signature": "00" }))
            .send()
    };

    let first = verify("203.0.113.7").await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-limit"], "2");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

    assert_eq!(verify("203.0.113.7").await.unwrap().status(), StatusCode::OK);

    let limited = verify("203.0.113.7").await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));
    let body: Value = limited.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");

    // Other clients and unlimited routes are unaffected.
    assert_eq!(verify("198.51.100.1").await.unwrap().status(), StatusCode::OK);
    let health = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_header_is_ignored_unless_the_proxy_is_trusted() {
    let srv = TestServer::spawn(Settings {
        rate_limit: RateLimitConfig {
            max: 2,
            window: Duration::from_secs(60),
            ..RateLimitConfig::default()
        },
        ..settings()
    })
    .await;

    let mut statuses = Vec::new();
    for ip in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
        let res = srv
            .client
            .post(srv.url("/checkout/verify"))
            .header("x-forwarded-for", ip)
            .json(&json!({ "orderId": "order_1", "paymentId": "pay_1", "signature": "00" }))
            .send()
            .await
            .unwrap();
        statuses.push(res.status());
    }
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
}
