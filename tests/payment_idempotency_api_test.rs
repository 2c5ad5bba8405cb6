use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use payments_api::app::{build_app, AppState};
use payments_api::config::{IdempotencySettings, RateLimitSettings};
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn state() -> AppState {
    AppState::in_memory(
        IdempotencySettings::default(),
        &RateLimitSettings::new(Some(10_000), None),
    )
}

fn customer() -> Value {
    json!({
        "name": "Ana Souza",
        "email": "ana@example.com",
        "cpf": "12345678901",
        "phone": "11987654321"
    })
}

fn card_body(product_id: &str, token: &str) -> Value {
    json!({
        "productId": product_id,
        "customer": customer(),
        "token": token,
        "last4": "4242",
        "brand": "visa",
        "exp": "12/30",
        "holder": "ANA SOUZA",
        "jti": "jti-00000001",
        "iat": 1_700_000_000_000_i64,
        "expAt": chrono::Utc::now().timestamp_millis() + 3_600_000
    })
}

fn post(uri: &str, key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(res: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn replayed(res: &Response<Body>) -> bool {
    res.headers()
        .get("Idempotent-Replayed")
        .map(|value| value == "true")
        .unwrap_or(false)
}

#[tokio::test]
async fn card_payment_replays_and_rejects_key_reuse_with_other_body() {
    let state = state();
    let app = build_app(state.clone());
    let body = card_body("p1", "tok_live_0001");

    let first = app.clone().oneshot(post("/payments/card", Some("abc"), &body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(!replayed(&first));
    let first_json = json_body(first).await;
    assert_eq!(first_json["status"], "APPROVED");
    assert_eq!(first_json["reason"], "OK");
    assert!(first_json["orderId"].is_string());
    assert!(first_json["paymentId"].is_string());

    let retry = app.clone().oneshot(post("/payments/card", Some("abc"), &body)).await.unwrap();
    assert_eq!(retry.status(), StatusCode::CREATED);
    assert!(replayed(&retry));
    assert_eq!(json_body(retry).await, first_json);
    assert_eq!(state.ledger().order_count().await, 1);

    let mut other = body.clone();
    other["productId"] = json!("p2");
    let conflict = app.clone().oneshot(post("/payments/card", Some("abc"), &other)).await.unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(conflict).await["error"], "idempotency_key_conflict");
    assert_eq!(state.ledger().order_count().await, 1);
}

#[tokio::test]
async fn key_order_in_body_does_not_change_the_fingerprint() {
    let state = state();
    let app = build_app(state.clone());
    let body = card_body("p1", "tok_live_0002");

    let first = app.clone().oneshot(post("/payments/card", Some("k-order"), &body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    // Same members, reversed textual order.
    let object = body.as_object().unwrap();
    let reversed = object
        .iter()
        .rev()
        .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
        .collect::<Vec<_>>()
        .join(",");
    let req = Request::builder()
        .method("POST")
        .uri("/payments/card")
        .header("content-type", "application/json")
        .header("Idempotency-Key", "k-order")
        .body(Body::from(format!("{{{reversed}}}")))
        .unwrap();
    let second = app.clone().oneshot(req).await.unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert!(replayed(&second));
    assert_eq!(state.ledger().order_count().await, 1);
}

#[tokio::test]
async fn requests_without_key_execute_every_time() {
    let state = state();
    let app = build_app(state.clone());

    for token in ["tok_plain_0001", "tok_plain_0002"] {
        let res = app
            .clone()
            .oneshot(post("/payments/card", None, &card_body("p3", token)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert!(!replayed(&res));
    }
    assert_eq!(state.ledger().order_count().await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_execute_once() {
    let state = state();
    let app = build_app(state.clone());
    let body = card_body("p1", "tok_race_00001");

    let mut handles = Vec::new();
    for _ in 0..12 {
        let app = app.clone();
        let req = post("/payments/card", Some("race-key"), &body);
        handles.push(tokio::spawn(async move {
            let res = app.oneshot(req).await.unwrap();
            let status = res.status();
            (status, json_body(res).await)
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(state.ledger().order_count().await, 1);
    assert_eq!(state.ledger().payment_count().await, 1);
    let (first_status, first_body) = results[0].clone();
    assert_eq!(first_status, StatusCode::CREATED);
    for (status, body) in &results {
        assert_eq!(*status, first_status);
        assert_eq!(*body, first_body);
    }
}

#[tokio::test]
async fn validation_runs_before_a_key_is_acquired() {
    let state = state();
    let app = build_app(state.clone());
    let mut body = card_body("p1", "short");
    body["last4"] = json!("42");

    let res = app.clone().oneshot(post("/payments/card", Some("bad-1"), &body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let json = json_body(res).await;
    assert_eq!(json["error"], "validation_error");
    assert!(json["issues"].as_array().unwrap().len() >= 2);

    let record = state.coordinator().store().get_by_key("bad-1").await.unwrap();
    assert!(record.is_none());
}

#[tokio::test]
async fn malformed_json_is_rejected_without_a_record() {
    let state = state();
    let app = build_app(state.clone());
    let req = Request::builder()
        .method("POST")
        .uri("/payments/pix")
        .header("content-type", "application/json")
        .header("Idempotency-Key", "broken")
        .body(Body::from("{\"productId\":"))
        .unwrap();

    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["error"], "validation_error");
    assert!(state.coordinator().store().get_by_key("broken").await.unwrap().is_none());
}

#[tokio::test]
async fn domain_rejections_are_cached_and_replayed() {
    let state = state();
    let app = build_app(state.clone());
    let body = card_body("missing-product", "tok_live_0003");

    let first = app.clone().oneshot(post("/payments/card", Some("nf"), &body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(first).await["error"], "product_not_found");

    let second = app.clone().oneshot(post("/payments/card", Some("nf"), &body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    assert!(replayed(&second));
    assert_eq!(json_body(second).await["error"], "product_not_found");
}

#[tokio::test]
async fn reused_and_expired_tokens_are_rejected() {
    let state = state();
    let app = build_app(state.clone());

    let ok = app
        .clone()
        .oneshot(post("/payments/card", Some("t1"), &card_body("p1", "tok_once_0001")))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::CREATED);

    let reused = app
        .clone()
        .oneshot(post("/payments/card", Some("t2"), &card_body("p2", "tok_once_0001")))
        .await
        .unwrap();
    assert_eq!(reused.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(reused).await["error"], "token_already_used");

    let mut expired = card_body("p1", "tok_old_00001");
    expired["expAt"] = json!(1_000);
    let res = app.clone().oneshot(post("/payments/card", Some("t3"), &expired)).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["error"], "token_expired");

    assert_eq!(state.ledger().order_count().await, 1);
}

#[tokio::test]
async fn antifraud_decline_is_reported_with_reason() {
    let app = build_app(state());
    let mut body = card_body("p1", "tok_fraud_0001");
    body["last4"] = json!("0000");

    let res = app.clone().oneshot(post("/payments/card", Some("fraud"), &body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let json = json_body(res).await;
    assert_eq!(json["status"], "DECLINED");
    assert_eq!(json["reason"], "Last4 suspeito");

    let order_id = json["orderId"].as_str().unwrap();
    let status = app
        .clone()
        .oneshot(get(&format!("/orders/{order_id}/status")))
        .await
        .unwrap();
    assert_eq!(json_body(status).await, json!({"status": "DECLINED"}));
}

#[tokio::test]
async fn pix_charge_replays_and_webhook_settles_it() {
    let state = state();
    let app = build_app(state.clone());
    let body = json!({"productId": "p2", "customer": customer()});

    let first = app.clone().oneshot(post("/payments/pix", Some("pix-1"), &body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let charge = json_body(first).await;
    let txid = charge["txid"].as_str().unwrap().to_string();
    assert_eq!(txid.len(), 25);
    assert_eq!(charge["status"], "PENDING");
    assert_eq!(
        charge["copyPaste"],
        format!("BR.GOV.BCB.PIX|txid={txid}|amount=99.00")
    );
    assert!(charge["qrBase64"].as_str().unwrap().starts_with("data:"));

    let again = app.clone().oneshot(post("/payments/pix", Some("pix-1"), &body)).await.unwrap();
    assert!(replayed(&again));
    assert_eq!(json_body(again).await, charge);
    assert_eq!(state.ledger().order_count().await, 1);

    let hook = json!({"txid": txid, "status": "APPROVED"});
    let settled = app
        .clone()
        .oneshot(post("/webhooks/pix/simulate", None, &hook))
        .await
        .unwrap();
    assert_eq!(settled.status(), StatusCode::OK);
    assert_eq!(json_body(settled).await, json!({"ok": true, "status": "APPROVED"}));

    let repeat = app
        .clone()
        .oneshot(post("/webhooks/pix/simulate", None, &json!({"txid": txid, "status": "EXPIRED"})))
        .await
        .unwrap();
    assert_eq!(
        json_body(repeat).await,
        json!({"ok": true, "alreadyFinal": true, "status": "APPROVED"})
    );

    let order_id = charge["orderId"].as_str().unwrap();
    let order = json_body(app.clone().oneshot(get(&format!("/orders/{order_id}"))).await.unwrap()).await;
    assert_eq!(order["status"], "APPROVED");
    assert_eq!(order["method"], "PIX");
    assert_eq!(order["product"]["id"], "p2");
    assert_eq!(order["payments"][0]["txid"], txid);
    assert!(order["payments"][0].get("copyPaste").is_none());
}

#[tokio::test]
async fn webhook_for_unknown_txid_is_not_found() {
    let app = build_app(state());
    let res = app
        .clone()
        .oneshot(post(
            "/webhooks/pix/simulate",
            None,
            &json!({"txid": "0123456789abcdef", "status": "APPROVED"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(res).await["error"], "payment_not_found");
}

#[tokio::test]
async fn catalog_and_order_lookups() {
    let app = build_app(state());

    let products = json_body(app.clone().oneshot(get("/products")).await.unwrap()).await;
    assert_eq!(products.as_array().unwrap().len(), 3);

    let product = json_body(app.clone().oneshot(get("/products/p1")).await.unwrap()).await;
    assert_eq!(product["priceCents"], 19_900);
    assert_eq!(product["seller"], "Santa Group Store");

    let missing = app.clone().oneshot(get("/products/nope")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let order = app.clone().oneshot(get("/orders/unknown")).await.unwrap();
    assert_eq!(order.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(order).await["error"], "order_not_found");

    let blank = app.clone().oneshot(get("/orders/%20/status")).await.unwrap();
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(blank).await["error"], "invalid_id");
}
