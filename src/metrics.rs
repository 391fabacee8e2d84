// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the order and payment paths.
//
// LEARNING NOTES:
// - Prometheus uses a "pull" model - it scrapes the /metrics endpoint
// - Counter: only goes up (requests, webhooks). Resets on restart.
// - Gauge: can go up or down (stock level, suspended payment callers).
// - Histogram: distribution of values in buckets (latency percentiles).
//
// The macros are no-ops until a recorder is installed, so unit tests can
// call the helpers freely.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES (Constants)
// =============================================================================
// snake_case, unit in the suffix, _total for counters.

/// HTTP request counter
/// Labels: method, endpoint (route template, e.g. /commandes/:id), status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Product stock gauge, updated after every committed mutation
/// Labels: product_id
pub const PRODUCT_STOCK_LEVEL: &str = "product_stock_level";

/// Order placement attempts
/// Labels: status (success/failed)
pub const ORDER_PLACEMENTS_TOTAL: &str = "order_placements_total";

/// Orders cancelled with their stock handed back
pub const ORDER_CANCELLATIONS_TOTAL: &str = "order_cancellations_total";

/// Payment attempts by flow and outcome
/// Labels: flow (direct/link), outcome (completed/timeout/rejected/error)
pub const PAYMENT_ATTEMPTS_TOTAL: &str = "payment_attempts_total";

/// Provider webhooks received
/// Labels: waiter (notified/none)
pub const PAYMENT_WEBHOOKS_TOTAL: &str = "payment_webhooks_total";

/// Payment requests currently suspended waiting for their webhook
pub const PAYMENT_PENDING_CALLBACKS: &str = "payment_pending_callbacks";

/// Secret key renewals
/// Labels: outcome (pushed/kept/failed)
pub const SECRET_RENEWALS_TOTAL: &str = "secret_renewals_total";

/// Database query duration histogram
/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the Prometheus recorder globally and describe every metric.
///
/// # Returns
/// * `PrometheusHandle` - renders the text exposition format for `/metrics`
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s for HTTP, database and Redis; payment routes can sit near
    // the callback timeout, so they get their own wider buckets.
    let latency_buckets = &[
        0.001, // 1ms
        0.005, // 5ms
        0.01,  // 10ms
        0.025, // 25ms
        0.05,  // 50ms
        0.1,   // 100ms
        0.25,  // 250ms
        0.5,   // 500ms
        1.0,   // 1 second
        2.5,   // 2.5 seconds
        5.0,   // 5 seconds
        10.0,  // 10 seconds
        30.0,  // callback timeout
        60.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            &latency_buckets[..12],
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            &latency_buckets[..12],
        )?
        .install_recorder()?;

    // -------------------------------------------------------------------------
    // METRIC DESCRIPTIONS
    // -------------------------------------------------------------------------
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_gauge!(PRODUCT_STOCK_LEVEL, "Stock of a product after the last committed change");
    describe_counter!(ORDER_PLACEMENTS_TOTAL, "Order placement attempts");
    describe_counter!(ORDER_CANCELLATIONS_TOTAL, "Orders cancelled with stock restored");
    describe_counter!(PAYMENT_ATTEMPTS_TOTAL, "Payment attempts by flow and outcome");
    describe_counter!(PAYMENT_WEBHOOKS_TOTAL, "Transaction webhooks received from the provider");
    describe_gauge!(
        PAYMENT_PENDING_CALLBACKS,
        "Payment requests waiting for their provider webhook"
    );
    describe_counter!(SECRET_RENEWALS_TOTAL, "Provider secret key renewals");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (GET, POST, etc.)
/// * `endpoint` - Route template, so ids do not explode cardinality
/// * `status` - Response status code
/// * `duration_secs` - Request duration in seconds
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn set_stock_level(product_id: i64, level: i32) {
    gauge!(PRODUCT_STOCK_LEVEL, "product_id" => product_id.to_string()).set(level as f64);
}

pub fn record_order_placement(success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(ORDER_PLACEMENTS_TOTAL, "status" => status).increment(1);
}

pub fn record_order_cancellation() {
    counter!(ORDER_CANCELLATIONS_TOTAL).increment(1);
}

/// Record how a payment attempt ended
///
/// # Arguments
/// * `flow` - `direct` or `link`
/// * `outcome` - `completed`, `timeout`, `rejected` (validation) or `error`
pub fn record_payment_attempt(flow: &'static str, outcome: &'static str) {
    counter!(PAYMENT_ATTEMPTS_TOTAL, "flow" => flow, "outcome" => outcome).increment(1);
}

pub fn record_webhook(waiter_notified: bool) {
    let waiter = if waiter_notified { "notified" } else { "none" };
    counter!(PAYMENT_WEBHOOKS_TOTAL, "waiter" => waiter).increment(1);
}

pub fn set_pending_callbacks(count: usize) {
    gauge!(PAYMENT_PENDING_CALLBACKS).set(count as f64);
}

/// # Arguments
/// * `outcome` - `pushed` (fresh key received), `kept` (no push, cached key
///   reused) or `failed`
pub fn record_secret_renewal(outcome: &'static str) {
    counter!(SECRET_RENEWALS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record database query duration
///
/// # Arguments
/// * `operation` - Logical operation (place_order, cancel_order, ...)
/// * `duration_secs` - Query duration in seconds
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record Redis operation duration
///
/// # Arguments
/// * `operation` - Type of operation (get, set, delete)
/// * `duration_secs` - Operation duration in seconds
pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
