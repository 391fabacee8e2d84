// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer) for the order and payment routes.
//
// LEARNING NOTES:
// - Handlers are async functions that receive requests and return responses
// - Axum uses "extractors" to parse request data (path params, JSON body, etc.)
// - Body and path extractors are taken as `Result<_, Rejection>` so malformed
//   input becomes our own 400 JSON error instead of axum's plain-text 422
// =============================================================================

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{AppError, AppResult};
use crate::gateway::WebhookOutcome;
use crate::metrics;
use crate::models::*;
use crate::orders::OrderManager;
use crate::AppState;

/// TTL of cached order details (seconds)
const ORDER_CACHE_TTL: u64 = 300;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe - Is the service running?
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "boutique-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe - Are PostgreSQL and Redis reachable?
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics in text exposition format
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// ORDER ENDPOINTS
// =============================================================================

// -----------------------------------------------------------------------------
// CREATE ORDER
// -----------------------------------------------------------------------------
/// Place an order, reserving stock for every line
///
/// POST /commandes
///
/// # Request Body
/// ```json
/// {
///   "id_client": 1,
///   "mode_paiement": "Carte",
///   "adresse_livraison": "Libreville",
///   "produits": [{ "id_produit": 1, "quantité": 5 }, { "id_produit": 2, "quantité": 2 }]
/// }
/// ```
///
/// # Response
/// - 201 Created: `{ message, id_commande, montant_total }`
/// - 400 Bad Request: invalid input or insufficient stock
/// - 404 Not Found: unknown product
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<CreateOrderResponse>)> {
    let start = Instant::now();

    let result = async {
        let Json(request) = body?;
        let order = OrderManager::validate(request)?;
        state.orders.place_order(&order).await
    }
    .await;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_order_placement(result.is_ok());
    metrics::record_db_query("place_order", duration);
    record(&result, "POST", "/commandes", StatusCode::CREATED, duration);

    let placed = result?;

    for level in &placed.stock_levels {
        metrics::set_stock_level(level.product_id, level.stock);
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            message: "Commande créée avec succès".to_string(),
            id_commande: placed.order_id,
            montant_total: placed.total,
        }),
    ))
}

// -----------------------------------------------------------------------------
// LIST ORDERS
// -----------------------------------------------------------------------------
/// Every order with its client's name. Not cached.
///
/// GET /commandes
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<OrderSummary>>> {
    let start = Instant::now();

    let result = state.orders.list_orders().await;
    let duration = start.elapsed().as_secs_f64();
    metrics::record_db_query("list_orders", duration);
    record(&result, "GET", "/commandes", StatusCode::OK, duration);

    Ok(Json(result?))
}

// -----------------------------------------------------------------------------
// GET ORDER
// -----------------------------------------------------------------------------
/// Order with its lines, read through the Redis cache
///
/// GET /commandes/:id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> AppResult<Json<OrderDetails>> {
    let start = Instant::now();
    let Path(order_id) = id?;

    let cache_key = order_cache_key(order_id);
    if let Some(details) = cache_get::<OrderDetails>(&state, &cache_key).await {
        let duration = start.elapsed().as_secs_f64();
        metrics::record_http_request("GET", "/commandes/:id", 200, duration);
        return Ok(Json(details));
    }

    let result = state.orders.get_order(order_id).await;
    let duration = start.elapsed().as_secs_f64();
    metrics::record_db_query("get_order", duration);
    record(&result, "GET", "/commandes/:id", StatusCode::OK, duration);

    let details = result?;
    cache_put(&state, &cache_key, &details).await;

    // A DELETE or PUT that committed after our read may already have
    // invalidated the key; drop what we just cached if it is now stale.
    if cache_entry_is_stale(&details, state.orders.current_status(order_id).await) {
        cache_invalidate(&state, &cache_key).await;
    }

    Ok(Json(details))
}

/// A failed re-check counts as stale.
fn cache_entry_is_stale(details: &OrderDetails, current: AppResult<Option<String>>) -> bool {
    !matches!(current, Ok(Some(status)) if status == details.order.status)
}

// -----------------------------------------------------------------------------
// UPDATE ORDER STATUS
// -----------------------------------------------------------------------------
/// PUT /commandes/:id
///
/// # Request Body
/// ```json
/// { "statut_commande": "validée" }
/// ```
pub async fn update_order_status(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let start = Instant::now();
    let Path(order_id) = id?;

    let result = async {
        let Json(request) = body?;
        let status = request
            .statut_commande
            .as_deref()
            .and_then(OrderStatus::parse)
            .ok_or_else(|| {
                AppError::BadRequest(format!(
                    "Invalid 'statut_commande'. Accepted: {}",
                    OrderStatus::accepted_values()
                ))
            })?;
        state.orders.update_status(order_id, status).await
    }
    .await;

    let duration = start.elapsed().as_secs_f64();
    record(&result, "PUT", "/commandes/:id", StatusCode::OK, duration);
    result?;

    cache_invalidate(&state, &order_cache_key(order_id)).await;

    Ok(Json(MessageResponse::new("Statut de la commande mis à jour")))
}

// -----------------------------------------------------------------------------
// DELETE ORDER
// -----------------------------------------------------------------------------
/// Delete an order and restore the stock of its lines
///
/// DELETE /commandes/:id
pub async fn delete_order(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> AppResult<Json<MessageResponse>> {
    let start = Instant::now();
    let Path(order_id) = id?;

    let result = state.orders.cancel_order(order_id).await;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_db_query("cancel_order", duration);
    record(&result, "DELETE", "/commandes/:id", StatusCode::OK, duration);

    let restored = result?;
    metrics::record_order_cancellation();
    cache_invalidate(&state, &order_cache_key(order_id)).await;

    tracing::debug!(order_id, lines = restored.len(), "Stock restored");

    Ok(Json(MessageResponse::new(
        "Commande supprimée et stock restauré",
    )))
}

// =============================================================================
// PAYMENT ENDPOINTS
// =============================================================================

/// Start a direct payment and wait for its webhook
///
/// POST /api/rest-transaction
///
/// # Response
/// - 200 OK: transaction completed (the webhook arrived)
/// - 400 Bad Request: missing amount / customer_account_number
/// - 408 Request Timeout: no webhook in time; `reference` lets the client poll
/// - 500: provider error, with the provider payload in `details`
pub async fn rest_transaction(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DirectPaymentRequest>, JsonRejection>,
) -> AppResult<Json<PaymentResponse>> {
    let start = Instant::now();

    let result = async {
        let Json(request) = body?;
        state.gateway.initiate_direct_payment(request).await
    }
    .await;

    let duration = start.elapsed().as_secs_f64();
    record(&result, "POST", "/api/rest-transaction", StatusCode::OK, duration);

    Ok(Json(PaymentResponse {
        success: true,
        message: "Transaction completed".to_string(),
        data: result?,
    }))
}

/// Generate a hosted payment link and wait for its webhook
///
/// POST /api/payment/generate-link
///
/// # Request Body
/// ```json
/// {
///   "amount": 5000,
///   "customer_account_number": "074000000",
///   "service": "VISA_MASTERCARD"
/// }
/// ```
pub async fn generate_payment_link(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PaymentLinkRequest>, JsonRejection>,
) -> AppResult<Json<PaymentResponse>> {
    let start = Instant::now();

    let result = async {
        let Json(request) = body?;
        state.gateway.initiate_payment_link(request).await
    }
    .await;

    let duration = start.elapsed().as_secs_f64();
    record(&result, "POST", "/api/payment/generate-link", StatusCode::OK, duration);

    Ok(Json(PaymentResponse {
        success: true,
        message: "Payment link generated and transaction completed".to_string(),
        data: result?,
    }))
}

/// Transaction notification from the provider
///
/// POST /api/payment-webhook
///
/// Answers 200 whether or not a payment request was waiting on the
/// reference; 500 only when the record could not be stored.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WebhookNotification>, JsonRejection>,
) -> Response {
    let start = Instant::now();

    let Json(notification) = match body {
        Ok(body) => body,
        Err(rejection) => return AppError::from(rejection).into_response(),
    };

    let code = notification.code.clone();
    let transaction_id = notification.transaction_id.clone();
    let result = state.gateway.handle_webhook(notification).await;

    let duration = start.elapsed().as_secs_f64();
    record(&result, "POST", "/api/payment-webhook", StatusCode::OK, duration);

    webhook_response(result, code, transaction_id)
}

/// Ack in the provider's shape: echo its `code`, or 500 with a message
fn webhook_response(
    result: AppResult<WebhookOutcome>,
    code: Option<serde_json::Value>,
    transaction_id: Option<String>,
) -> Response {
    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(WebhookAck {
                response_code: code.unwrap_or_else(|| serde_json::json!(200)),
                transaction_id: outcome.record.transaction_id.or(transaction_id),
                message: None,
            }),
        )
            .into_response(),

        Err(err @ AppError::BadRequest(_)) => err.into_response(),

        Err(err) => {
            tracing::error!(error = %err, "Webhook could not be persisted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookAck {
                    response_code: serde_json::json!(500),
                    transaction_id,
                    message: Some("Failed to record the transaction".to_string()),
                }),
            )
                .into_response()
        }
    }
}

/// The provider pushes a renewed secret key
///
/// POST /api/payment/secret-callback
pub async fn secret_callback(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SecretCallbackRequest>, JsonRejection>,
) -> AppResult<Json<SecretCallbackAck>> {
    let Json(request) = body?;

    let key = request
        .secret_key
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("secret_key is required".to_string()))?;

    state.gateway.on_secret_pushed(key);

    Ok(Json(SecretCallbackAck {
        response_code: 200,
        message: "Secret key updated".to_string(),
    }))
}

/// Current state of a payment, e.g. after a 408
///
/// GET /api/transactions/:reference
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> AppResult<Json<TransactionRecord>> {
    let start = Instant::now();

    let result = state.gateway.find_transaction(&reference).await;

    let duration = start.elapsed().as_secs_f64();
    record(&result, "GET", "/api/transactions/:reference", StatusCode::OK, duration);

    Ok(Json(result?))
}

// =============================================================================
// HELPERS
// =============================================================================

/// Count the request under the status it is about to be answered with
fn record<T>(result: &AppResult<T>, method: &str, endpoint: &str, ok: StatusCode, duration: f64) {
    let status = match result {
        Ok(_) => ok,
        Err(err) => err.status_code(),
    };
    metrics::record_http_request(method, endpoint, status.as_u16(), duration);
}

fn order_cache_key(order_id: i64) -> String {
    format!("commande:{}", order_id)
}

// Cache failures are logged and otherwise ignored: PostgreSQL is the source
// of truth and every path still works with Redis down.

async fn cache_get<T: DeserializeOwned>(state: &AppState, key: &str) -> Option<T> {
    let start = Instant::now();
    let cached: Option<String> = redis::cmd("GET")
        .arg(key)
        .query_async(&mut state.redis.clone())
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, key, "Cache read failed");
            None
        });
    metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

    cached.and_then(|json| serde_json::from_str(&json).ok())
}

async fn cache_put<T: Serialize>(state: &AppState, key: &str, value: &T) {
    let Ok(json) = serde_json::to_string(value) else {
        return;
    };

    let start = Instant::now();
    let written: Result<(), _> = redis::cmd("SETEX")
        .arg(key)
        .arg(ORDER_CACHE_TTL)
        .arg(&json)
        .query_async(&mut state.redis.clone())
        .await;
    metrics::record_redis_operation("set", start.elapsed().as_secs_f64());

    if let Err(err) = written {
        tracing::warn!(error = %err, key, "Cache write failed");
    }
}

async fn cache_invalidate(state: &AppState, key: &str) {
    let start = Instant::now();
    let deleted: Result<(), _> = redis::cmd("DEL")
        .arg(key)
        .query_async(&mut state.redis.clone())
        .await;
    metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());

    if let Err(err) = deleted {
        tracing::warn!(error = %err, key, "Cache invalidation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn outcome(transaction_id: Option<&str>) -> WebhookOutcome {
        let now = Utc::now();
        WebhookOutcome {
            record: TransactionRecord {
                id: Uuid::new_v4(),
                transaction_id: transaction_id.map(str::to_string),
                reference: "REFHANDLER001".into(),
                amount: None,
                status: "SUCCESS".into(),
                customer_account_number: None,
                fees: None,
                total_amount: None,
                charge_owner: None,
                free_info: None,
                transaction_operation: "PAYMENT".into(),
                operator: None,
                created_at: now,
                updated_at: now,
            },
            waiter_notified: false,
        }
    }

    fn details(status: &str) -> OrderDetails {
        OrderDetails {
            order: Order {
                id: 4,
                client_id: 1,
                payment_mode: "Carte".into(),
                total_amount: rust_decimal::Decimal::from(10),
                paid_at: None,
                delivery_address: "Libreville".into(),
                status: status.into(),
                created_at: Utc::now(),
            },
            lines: vec![],
        }
    }

    #[test]
    fn test_cached_order_survives_only_if_unchanged() {
        let cached = details("en_attente");

        assert!(!cache_entry_is_stale(&cached, Ok(Some("en_attente".into()))));
        // deleted after our read
        assert!(cache_entry_is_stale(&cached, Ok(None)));
        // status moved after our read
        assert!(cache_entry_is_stale(&cached, Ok(Some("validée".into()))));
        assert!(cache_entry_is_stale(
            &cached,
            Err(AppError::Internal("pool closed".into()))
        ));
    }

    async fn body_of(response: Response) -> (StatusCode, serde_json::Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_webhook_ack_echoes_provider_code_without_waiter() {
        let response = webhook_response(
            Ok(outcome(Some("PVIT-77"))),
            Some(serde_json::json!(200)),
            Some("PVIT-77".into()),
        );

        let (status, body) = body_of(response).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["responseCode"], 200);
        assert_eq!(body["transactionId"], "PVIT-77");
        assert!(body.get("message").is_none());
    }

    #[tokio::test]
    async fn test_webhook_persistence_failure_is_500() {
        let response = webhook_response(
            Err(AppError::Internal("pool closed".into())),
            Some(serde_json::json!(200)),
            Some("PVIT-78".into()),
        );

        let (status, body) = body_of(response).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["responseCode"], 500);
        assert_eq!(body["transactionId"], "PVIT-78");
        // internals stay in the logs
        assert!(!body["message"].as_str().unwrap().contains("pool"));
    }

    #[tokio::test]
    async fn test_webhook_without_reference_is_400() {
        let response = webhook_response(
            Err(AppError::BadRequest("merchantReferenceId is required".into())),
            None,
            None,
        );

        let (status, _) = body_of(response).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_order_cache_key() {
        assert_eq!(order_cache_key(42), "commande:42");
    }
}
