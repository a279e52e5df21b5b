//! HTTP-level tests for the billing routes, backed by in-memory billing state

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use hmac::{Hmac, Mac};
use saaskit_api::{auth::JwtManager, create_router, AppState, Config};
use saaskit_billing::memory::{InMemoryBillingStore, MockBillingProvider};
use saaskit_billing::{BillingService, BillingStore, StripeConfig};
use saaskit_shared::{BillingInterval, Plan};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

const JWT_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";
const INTERNAL_TOKEN: &str = "test-internal-token-at-least-32-characters";
const WEBHOOK_SECRET: &str = "whsec_routes";

struct TestApp {
    router: Router,
    store: Arc<InMemoryBillingStore>,
    jwt: JwtManager,
    pro_monthly_price: String,
}

async fn app() -> TestApp {
    let provider = Arc::new(MockBillingProvider::new());
    let store = Arc::new(InMemoryBillingStore::new());
    let stripe_config = StripeConfig {
        secret_key: "sk_test_routes".into(),
        webhook_secret: Some(WEBHOOK_SECRET.into()),
        app_base_url: "https://app.example.com".into(),
        billing_return_path: "/settings/billing".into(),
    };
    let billing = BillingService::with_backends(stripe_config, provider, store.clone());

    let plans: Vec<Plan> = serde_json::from_value(json!([
        { "planId": "free", "name": "Free" },
        { "planId": "pro", "name": "Pro", "monthlyPrice": 19 },
        { "planId": "legacy", "name": "Legacy", "isActive": false }
    ]))
    .unwrap();
    let report = billing.catalog_sync.sync(plans).await.unwrap();
    let pro_monthly_price = report.plans[1]
        .price_id_for(BillingInterval::Month)
        .unwrap()
        .to_string();

    let config = Config {
        bind_address: "127.0.0.1:0".into(),
        cors_origin: None,
        database_url: "postgres://unused".into(),
        database_max_connections: 1,
        jwt_secret: JWT_SECRET.into(),
        internal_api_token: INTERNAL_TOKEN.into(),
        enable_billing: true,
    };
    let router = create_router(AppState::new(config, store.clone(), Some(billing)));

    TestApp {
        router,
        store,
        jwt: JwtManager::new(JWT_SECRET),
        pro_monthly_price,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn register_request(token: Option<&str>, user_id: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/hooks/user-registered")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("x-internal-token", token);
    }
    builder
        .body(Body::from(
            json!({ "userId": user_id, "email": "ada@example.com", "displayName": "Ada" }).to_string(),
        ))
        .unwrap()
}

fn authed(app: &TestApp, method: &str, uri: &str, user_id: &str, body: Body) -> Request<Body> {
    let token = app
        .jwt
        .issue(user_id, "ada@example.com", time::Duration::hours(1))
        .unwrap();
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

fn webhook_request(payload: &str, secret: &str) -> Request<Body> {
    let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let signature = format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()));

    Request::builder()
        .method("POST")
        .uri("/api/v1/billing/webhook")
        .header("stripe-signature", signature)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn subscription_payload(customer: &str, price: &str) -> String {
    json!({
        "id": "evt_routes_1",
        "type": "customer.subscription.created",
        "data": { "object": {
            "id": "sub_routes",
            "customer": customer,
            "status": "active",
            "cancel_at_period_end": false,
            "current_period_start": 1_735_689_600,
            "current_period_end": 1_738_368_000,
            "items": { "data": [{ "price": { "id": price, "recurring": { "interval": "month" } } }] }
        } }
    })
    .to_string()
}

async fn register(app: &TestApp, user_id: &str) -> String {
    let (status, body) = send(&app.router, register_request(Some(INTERNAL_TOKEN), user_id)).await;
    assert_eq!(status, StatusCode::CREATED);
    body["stripeCustomerId"].as_str().unwrap().to_string()
}

// ============================================================================
// Public routes
// ============================================================================

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "healthy");
    assert_eq!(body["billing"], "enabled");
}

#[tokio::test]
async fn test_plans_lists_active_plans_in_order() {
    let app = app().await;
    let request = Request::builder().uri("/api/v1/plans").body(Body::empty()).unwrap();

    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["plans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["planId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["free", "pro"]);
}

// ============================================================================
// Registration hook
// ============================================================================

#[tokio::test]
async fn test_registration_hook_requires_internal_token() {
    let app = app().await;

    let (status, _) = send(&app.router, register_request(None, "user-1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app.router, register_request(Some("wrong-token"), "user-1")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert!(app.store.get_profile("user-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_registration_hook_is_idempotent() {
    let app = app().await;
    let customer = register(&app, "user-1").await;

    let (status, body) = send(&app.router, register_request(Some(INTERNAL_TOKEN), "user-1")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], false);
    assert_eq!(body["stripeCustomerId"], customer.as_str());
}

// ============================================================================
// Authenticated billing routes
// ============================================================================

#[tokio::test]
async fn test_subscription_requires_auth() {
    let app = app().await;
    let request = Request::builder()
        .uri("/api/v1/billing/subscription")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_new_user_is_on_free_plan() {
    let app = app().await;
    register(&app, "user-1").await;

    let request = authed(&app, "GET", "/api/v1/billing/subscription", "user-1", Body::empty());
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["effectivePlanId"], "free");
    assert_eq!(body["hasAccess"], true);
    assert_eq!(body["subscription"]["status"], "active");
    assert!(body["subscription"]["stripeSubscriptionId"].is_null());
}

#[tokio::test]
async fn test_portal_rejects_foreign_return_url() {
    let app = app().await;
    register(&app, "user-1").await;

    let body = Body::from(json!({ "returnUrl": "https://evil.example.net/" }).to_string());
    let (status, _) = send(
        &app.router,
        authed(&app, "POST", "/api/v1/billing/portal", "user-1", body),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app.router,
        authed(&app, "POST", "/api/v1/billing/portal", "user-1", Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().unwrap().contains("settings/billing"));
}

#[tokio::test]
async fn test_sync_without_provider_subscription_keeps_free_plan() {
    let app = app().await;
    register(&app, "user-1").await;

    let request = authed(&app, "POST", "/api/v1/billing/sync", "user-1", Body::empty());
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    assert_eq!(body["current"]["effectivePlanId"], "free");
}

// ============================================================================
// Webhook
// ============================================================================

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let app = app().await;
    let payload = subscription_payload("cus_x", "price_x");

    let (status, _) = send(&app.router, webhook_request(&payload, "whsec_other")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.store.webhook_event("evt_routes_1").await.is_none());
}

#[tokio::test]
async fn test_webhook_upgrades_user() {
    let app = app().await;
    let customer = register(&app, "user-1").await;
    let payload = subscription_payload(&customer, &app.pro_monthly_price);

    let (status, body) = send(&app.router, webhook_request(&payload, WEBHOOK_SECRET)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    let stored = app.store.get_subscription("user-1").await.unwrap().unwrap();
    assert_eq!(stored.plan_id, "pro");
    assert_eq!(stored.stripe_subscription_id.as_deref(), Some("sub_routes"));
}

#[tokio::test]
async fn test_webhook_for_unknown_price_is_acknowledged() {
    let app = app().await;
    let customer = register(&app, "user-1").await;
    let payload = subscription_payload(&customer, "price_unknown");

    let (status, body) = send(&app.router, webhook_request(&payload, WEBHOOK_SECRET)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "skipped");
}

#[tokio::test]
async fn test_webhook_store_failure_requests_redelivery() {
    let app = app().await;
    let customer = register(&app, "user-1").await;
    let payload = subscription_payload(&customer, &app.pro_monthly_price);
    app.store.fail_writes(true);

    let (status, _) = send(&app.router, webhook_request(&payload, WEBHOOK_SECRET)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
