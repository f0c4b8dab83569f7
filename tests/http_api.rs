mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use gmail_sync::server::router;

use common::{plain_message, Harness};

async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("route request");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

#[tokio::test]
async fn health_reports_token_counts() {
    let harness = Harness::new();
    harness.seed_token("creator-1", Duration::hours(1));

    let (status, body) = call(router(harness.app_state()), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tokens"][0]["status"], "active");
    assert_eq!(body["tokens"][0]["count"], 1);
}

#[tokio::test]
async fn auth_url_accepts_body_or_header() {
    let harness = Harness::new();

    let (status, body) = call(
        router(harness.app_state()),
        post_json("/gmail/auth-url", json!({ "userId": "creator-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().expect("url").contains("state=creator-1"));

    let request = Request::builder()
        .method("POST")
        .uri("/gmail/auth-url")
        .header("x-user-id", "creator-2")
        .body(Body::empty())
        .expect("build request");
    let (status, body) = call(router(harness.app_state()), request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().expect("url").contains("state=creator-2"));

    let (status, body) = call(
        router(harness.app_state()),
        post_json("/gmail/auth-url", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "userId is required");
}

#[tokio::test]
async fn callback_stores_token_for_state_user() {
    let harness = Harness::new();

    let (status, body) = call(
        router(harness.app_state()),
        get("/auth/gmail/callback?code=abc&state=creator-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "creator@gmail.com");
    assert!(harness
        .db
        .active_token_for_user("creator-1")
        .expect("lookup")
        .is_some());

    let (status, _) = call(
        router(harness.app_state()),
        get("/auth/gmail/callback?state=creator-1"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        router(harness.app_state()),
        get("/auth/gmail/callback?code=bad-code&state=creator-1"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn sync_routes_use_requested_or_default_window() {
    let harness = Harness::new();
    harness.seed_token("creator-1", Duration::hours(1));
    harness
        .mail
        .add(plain_message("msg-1", "brand@x.com", "Hello", "Body"));

    let (status, body) = call(
        router(harness.app_state()),
        post_json("/gmail/sync", json!({ "userId": "creator-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "emailsSynced": 1, "newEmails": 1 })
    );

    let (status, body) = call(
        router(harness.app_state()),
        post_json("/gmail/sync/creator-1?hoursBack=2", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["newEmails"], 0);

    assert_eq!(
        harness.mail.recorded_queries(),
        vec![
            "in:inbox newer_than:24h".to_string(),
            "in:inbox newer_than:2h".to_string()
        ]
    );
}

#[tokio::test]
async fn token_status_and_reauth_listing() {
    let harness = Harness::new();
    harness.seed_token("creator-ok", Duration::hours(1));
    let broken = harness.seed_token("creator-broken", Duration::hours(1));
    harness
        .db
        .mark_token_invalid(broken.id, Utc::now())
        .expect("invalidate");

    let (_, body) = call(
        router(harness.app_state()),
        get("/gmail/token-status/creator-ok"),
    )
    .await;
    assert_eq!(body, json!({ "userId": "creator-ok", "valid": true }));

    let (_, body) = call(
        router(harness.app_state()),
        get("/gmail/token-status/creator-broken"),
    )
    .await;
    assert_eq!(body["valid"], false);

    let (status, body) = call(
        router(harness.app_state()),
        get("/admin/accounts-needing-reauth"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["accounts"][0]["userId"], "creator-broken");
    assert_eq!(body["accounts"][0]["email"], "creator-broken@gmail.com");
}

#[tokio::test]
async fn refresh_route_returns_summary() {
    let harness = Harness::new();
    harness.seed_token("creator-1", Duration::minutes(2));

    let (status, body) = call(
        router(harness.app_state()),
        post_json("/gmail/refresh-tokens", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": 1, "failed": 0, "total": 1 }));
}

#[tokio::test]
async fn inbound_webhook_route() {
    let harness = Harness::new();
    let user = "0b7c7a0e-5a8e-4c61-9a43-3f0d2f7c1a11";

    let (status, body) = call(
        router(harness.app_state()),
        post_json(
            "/inbound-email",
            json!({
                "from": "brand@x.com",
                "to": format!("replies+{user}@mail.example.com"),
                "subject": "Hello",
                "body": "Pushed",
                "messageId": "push-1"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(harness.db.email_exists(user, "push-1").expect("exists"));

    let (status, body) = call(
        router(harness.app_state()),
        post_json(
            "/inbound-email",
            json!({
                "from": "brand@x.com",
                "to": "support@mail.example.com",
                "messageId": "push-2"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
}
