use axum::body::Body;
use axum::http::{Request, StatusCode};
use payments_api::app::{build_app, AppState};
use payments_api::config::{IdempotencySettings, RateLimitSettings};
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn app_state() -> AppState {
    AppState::in_memory(IdempotencySettings::default(), &RateLimitSettings::default())
}

fn pix_request(key: &str) -> Request<Body> {
    let body = json!({
        "productId": "p3",
        "customer": {
            "name": "Bruno Lima",
            "email": "bruno@example.com",
            "cpf": "98765432100",
            "phone": "2133334444"
        }
    });
    Request::builder()
        .method("POST")
        .uri("/payments/pix")
        .header("content-type", "application/json")
        .header("Idempotency-Key", key)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = build_app(app_state());
    let res = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, json!({"ok": true}));
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let app = build_app(app_state());

    let echoed = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/products")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(echoed.headers()["x-request-id"], "req-42");

    let generated = app
        .clone()
        .oneshot(Request::builder().uri("/products").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let id = generated.headers()["x-request-id"].to_str().unwrap();
    assert_eq!(id.len(), 36);
}

#[tokio::test]
async fn metrics_count_idempotency_outcomes() {
    let state = app_state();
    let app = build_app(state.clone());

    for _ in 0..2 {
        let res = app.clone().oneshot(pix_request("m-1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }
    assert_eq!(state.metrics().idempotency_outcome_count("proceed"), 1);
    assert_eq!(state.metrics().idempotency_outcome_count("replay"), 1);

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("idempotency_outcomes_total{outcome=\"replay\"} 1"));
    assert!(text.contains("payments_created_total{method=\"PIX\",status=\"PENDING\"} 1"));
}
