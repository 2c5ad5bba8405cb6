//! Payment creation endpoints and the PIX webhook simulator.
//!
//! Card and PIX creation run under the idempotency coordinator. Validation
//! happens before a key is acquired, so malformed requests never create
//! records.

use crate::antifraud::{evaluate_card_risk, CardRiskInput};
use crate::app::AppState;
use crate::canonical::{body_hash, canonical_route};
use crate::coordinator::{DeferredWrites, Outcome, Prepared};
use crate::errors::ApiError;
use crate::idempotency::{RequestFingerprint, StoredResponse};
use crate::ledger::StagedWrites;
use crate::metrics::Metrics;
use crate::model::{
    CardPaymentRequest, Customer, Order, Payment, PaymentMethod, PaymentStatus, PixCreateRequest,
    PixWebhookRequest, Product, Validate,
};
use crate::pix::{copy_paste_code, new_txid};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

pub async fn create_card_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let raw = parse_json(&body)?;
    let request = CardPaymentRequest::from_json(&raw)?;
    let key = idempotency_key(&headers)?;
    let fingerprint = RequestFingerprint::new(
        "POST",
        &canonical_route("/payments", "/card"),
        &body_hash(Some(&raw)),
    );

    let handler_state = state.clone();
    let outcome = state
        .coordinator
        .execute(key, fingerprint, move || async move {
            charge_card(&handler_state, &request, Utc::now()).await
        })
        .await?;
    Ok(respond(outcome))
}

pub async fn create_pix_charge(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let raw = parse_json(&body)?;
    let request = PixCreateRequest::from_json(&raw)?;
    let key = idempotency_key(&headers)?;
    let fingerprint = RequestFingerprint::new(
        "POST",
        &canonical_route("/payments", "/pix"),
        &body_hash(Some(&raw)),
    );

    let handler_state = state.clone();
    let outcome = state
        .coordinator
        .execute(key, fingerprint, move || async move {
            open_pix_charge(&handler_state, &request, Utc::now()).await
        })
        .await?;
    Ok(respond(outcome))
}

/// Settles a pending PIX payment. Repeated deliveries are harmless.
pub async fn simulate_pix_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let raw = parse_json(&body)?;
    let request = PixWebhookRequest::from_json(&raw)?;
    let target = request.target_status().ok_or_else(|| {
        ApiError::validation(vec!["status: must be APPROVED or EXPIRED".to_string()])
    })?;
    let now = Utc::now();

    let body = state.ledger.transaction(|tx| -> Result<Value, ApiError> {
        let mut payment = tx
            .find_payment(|p| {
                p.method == PaymentMethod::Pix && p.txid.as_deref() == Some(request.txid.as_str())
            })
            .ok_or(ApiError::NotFound {
                code: "payment_not_found",
            })?;
        if payment.status != PaymentStatus::Pending {
            return Ok(json!({ "ok": true, "alreadyFinal": true, "status": payment.status }));
        }

        let mut order = tx.order(&payment.order_id).ok_or_else(|| {
            ApiError::Internal(format!("payment {} has no order", payment.id))
        })?;
        payment.status = target;
        order.status = target;
        order.updated_at = now;
        tx.put_payment(payment);
        tx.put_order(order);
        Ok(json!({ "ok": true, "status": target }))
    })
    .await?;

    info!(txid = %request.txid, status = target.as_str(), "pix webhook processed");
    Ok(Json(body))
}

/// Order and payment rows of one creation, applied once the response is cached.
struct PaymentWrites {
    staged: StagedWrites,
    metrics: Arc<Metrics>,
    method: PaymentMethod,
    status: PaymentStatus,
}

impl DeferredWrites for PaymentWrites {
    fn apply(self: Box<Self>) {
        let PaymentWrites {
            staged,
            metrics,
            method,
            status,
        } = *self;
        staged.apply();
        metrics.payment_created(method.as_str(), status.as_str());
    }
}

async fn charge_card(
    state: &AppState,
    request: &CardPaymentRequest,
    now: DateTime<Utc>,
) -> Result<Prepared, ApiError> {
    let ((order, payment, reason), staged) = state.ledger.stage(|tx| -> Result<_, ApiError> {
        let product = tx.product(&request.product_id).ok_or(ApiError::NotFound {
            code: "product_not_found",
        })?;
        if tx
            .find_payment(|p| p.token.as_deref() == Some(request.token.as_str()))
            .is_some()
        {
            return Err(ApiError::BadRequest {
                code: "token_already_used",
            });
        }
        if now.timestamp_millis() > request.exp_at {
            return Err(ApiError::BadRequest {
                code: "token_expired",
            });
        }

        let mut order = new_order(&product, request.customer.clone(), PaymentMethod::Card, now);
        tx.put_order(order.clone());

        let risk = evaluate_card_risk(&CardRiskInput {
            amount_cents: product.price_cents,
            cpf: &request.customer.cpf,
            email: &request.customer.email,
            last4: &request.last4,
            brand: &request.brand,
        });
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            method: PaymentMethod::Card,
            status: risk.decision,
            last4: Some(request.last4.clone()),
            brand: Some(request.brand.clone()),
            token: Some(request.token.clone()),
            txid: None,
            qr_base64: None,
            copy_paste: None,
            created_at: now,
        };
        tx.put_payment(payment.clone());

        order.status = risk.decision;
        order.updated_at = now;
        tx.put_order(order.clone());
        Ok((order, payment, risk.reason))
    })
    .await?;

    info!(order_id = %order.id, status = payment.status.as_str(), reason, "card payment processed");
    let response = StoredResponse {
        status_code: StatusCode::CREATED.as_u16(),
        body: json!({
            "orderId": order.id,
            "paymentId": payment.id,
            "status": payment.status,
            "reason": reason,
        }),
    };
    Ok(Prepared::with_writes(
        response,
        PaymentWrites {
            staged,
            metrics: Arc::clone(&state.metrics),
            method: PaymentMethod::Card,
            status: payment.status,
        },
    ))
}

async fn open_pix_charge(
    state: &AppState,
    request: &PixCreateRequest,
    now: DateTime<Utc>,
) -> Result<Prepared, ApiError> {
    let txid = new_txid();
    let (payment, staged) = state.ledger.stage(|tx| -> Result<Payment, ApiError> {
        let product = tx.product(&request.product_id).ok_or(ApiError::NotFound {
            code: "product_not_found",
        })?;
        let copy_paste = copy_paste_code(&txid, product.price_cents);
        let qr = state
            .qr_renderer
            .render(&copy_paste)
            .map_err(|reason| ApiError::Internal(format!("qr rendering failed: {reason}")))?;

        let order = new_order(&product, request.customer.clone(), PaymentMethod::Pix, now);
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            method: PaymentMethod::Pix,
            status: PaymentStatus::Pending,
            last4: None,
            brand: None,
            token: None,
            txid: Some(txid.clone()),
            qr_base64: Some(qr),
            copy_paste: Some(copy_paste),
            created_at: now,
        };
        tx.put_order(order);
        tx.put_payment(payment.clone());
        Ok(payment)
    })
    .await?;

    info!(order_id = %payment.order_id, txid = %txid, "pix charge opened");
    let response = StoredResponse {
        status_code: StatusCode::CREATED.as_u16(),
        body: json!({
            "orderId": payment.order_id,
            "paymentId": payment.id,
            "txid": txid,
            "qrBase64": payment.qr_base64,
            "copyPaste": payment.copy_paste,
            "status": payment.status,
        }),
    };
    Ok(Prepared::with_writes(
        response,
        PaymentWrites {
            staged,
            metrics: Arc::clone(&state.metrics),
            method: PaymentMethod::Pix,
            status: payment.status,
        },
    ))
}

fn new_order(
    product: &Product,
    customer: Customer,
    method: PaymentMethod,
    now: DateTime<Utc>,
) -> Order {
    Order {
        id: Uuid::new_v4().to_string(),
        product_id: product.id.clone(),
        amount_cents: product.price_cents,
        method,
        status: PaymentStatus::Pending,
        customer,
        created_at: now,
        updated_at: now,
    }
}

fn parse_json(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::validation(vec![format!("body: invalid JSON ({err})")]))
}

/// A blank header counts as no key.
fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| {
        ApiError::validation(vec!["Idempotency-Key: must be visible ASCII".to_string()])
    })?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

fn respond(outcome: Outcome) -> Response {
    let status =
        StatusCode::from_u16(outcome.response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(outcome.response.body)).into_response();
    if outcome.replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}
