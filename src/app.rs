use crate::config::{IdempotencySettings, RateLimitSettings};
use crate::coordinator::IdempotencyCoordinator;
use crate::errors::ApiError;
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::model::Product;
use crate::payments::{create_card_payment, create_pix_charge, simulate_pix_webhook};
use crate::pix::{QrRenderer, TextQrRenderer};
use crate::rate_limiter::{client_id, RateLimiter};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) coordinator: IdempotencyCoordinator,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) qr_renderer: Arc<dyn QrRenderer>,
}

impl AppState {
    pub fn new(
        ledger: Arc<Ledger>,
        store: Arc<dyn IdempotencyStore>,
        idempotency: IdempotencySettings,
        rate_limit: &RateLimitSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ledger,
            coordinator: IdempotencyCoordinator::new(store, idempotency, Arc::clone(&metrics)),
            metrics,
            rate_limiter: Arc::new(RateLimiter::new(rate_limit)),
            qr_renderer: Arc::new(TextQrRenderer),
        }
    }

    /// Seeded catalog and in-memory idempotency store.
    pub fn in_memory(idempotency: IdempotencySettings, rate_limit: &RateLimitSettings) -> Self {
        Self::new(
            Arc::new(Ledger::seeded(Utc::now())),
            Arc::new(InMemoryIdempotencyStore::new()),
            idempotency,
            rate_limit,
            Arc::new(Metrics::new()),
        )
    }

    pub fn with_qr_renderer(mut self, renderer: Arc<dyn QrRenderer>) -> Self {
        self.qr_renderer = renderer;
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &IdempotencyCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Health and metrics bypass the rate limiter; every route gets request tracing.
pub fn build_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/products", get(list_products))
        .route("/products/{id}", get(get_product))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/status", get(get_order_status))
        .route("/payments/card", post(create_card_payment))
        .route("/payments/pix", post(create_pix_charge))
        .route("/webhooks/pix/simulate", post(simulate_pix_webhook))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus))
        .merge(api)
        .layer(middleware::from_fn(trace_requests))
        .with_state(state)
}

async fn trace_requests(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = client_id(
        request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok()),
    );
    match state.rate_limiter.try_acquire_at(&client, now_millis()) {
        Ok(()) => next.run(request).await,
        Err(wait_millis) => {
            warn!(client = %client, "rate limit exceeded");
            ApiError::RateLimited {
                retry_after_secs: wait_millis.div_ceil(1000),
            }
            .into_response()
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn prometheus(State(state): State<AppState>) -> Result<Response, ApiError> {
    let text = state
        .metrics
        .render()
        .map_err(|err| ApiError::Internal(format!("metrics encoding failed: {err}")))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
        text,
    )
        .into_response())
}

async fn list_products(State(state): State<AppState>) -> Json<Vec<Product>> {
    Json(state.ledger.list_products().await)
}

async fn get_product(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Product>, ApiError> {
    state.ledger.product(&id).await.map(Json).ok_or(ApiError::NotFound {
        code: "product_not_found",
    })
}

async fn get_order(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let id = require_id(&id)?;
    let order = state.ledger.order(id).await.ok_or(ApiError::NotFound {
        code: "order_not_found",
    })?;
    let product = state.ledger.product(&order.product_id).await.map(|product| {
        json!({
            "id": product.id,
            "name": product.name,
            "priceCents": product.price_cents,
            "seller": product.seller,
        })
    });
    let payments = state.ledger.payments_for_order(&order.id).await;

    Ok(Json(json!({
        "id": order.id,
        "status": order.status,
        "amountCents": order.amount_cents,
        "method": order.method,
        "product": product,
        "customer": order.customer,
        "payments": payments,
        "createdAt": order.created_at,
        "updatedAt": order.updated_at,
    })))
}

async fn get_order_status(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let id = require_id(&id)?;
    let order = state.ledger.order(id).await.ok_or(ApiError::NotFound {
        code: "order_not_found",
    })?;
    Ok(Json(json!({ "status": order.status })))
}

fn require_id(id: &str) -> Result<&str, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest { code: "invalid_id" });
    }
    Ok(id)
}

/// Wall-clock milliseconds; instants before the epoch clamp to zero.
fn now_millis() -> u64 {
    epoch_millis(Utc::now())
}

fn epoch_millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}
