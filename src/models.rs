// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the order and payment paths.
//
// The HTTP contract of the order routes keeps the French field names the
// storefront already sends (id_client, mode_paiement, quantité, ...); the
// Rust side uses English names and serde renames at the boundary.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// ORDER ENUMS
// =============================================================================

/// Accepted payment modes for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMode {
    #[serde(rename = "Carte")]
    Card,
    #[serde(rename = "PayPal")]
    PayPal,
    #[serde(rename = "Espèces")]
    Cash,
    #[serde(rename = "Mobile Money")]
    MobileMoney,
}

impl PaymentMode {
    pub const ALL: [PaymentMode; 4] = [
        PaymentMode::Card,
        PaymentMode::PayPal,
        PaymentMode::Cash,
        PaymentMode::MobileMoney,
    ];

    /// Wire/database spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Card => "Carte",
            PaymentMode::PayPal => "PayPal",
            PaymentMode::Cash => "Espèces",
            PaymentMode::MobileMoney => "Mobile Money",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == value)
    }
}

/// Order lifecycle status.
///
/// Stored as text; the table carries a CHECK constraint with the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "en_attente")]
    Pending,
    #[serde(rename = "validée")]
    Validated,
    #[serde(rename = "expédiée")]
    Shipped,
    #[serde(rename = "livrée")]
    Delivered,
    #[serde(rename = "annulée")]
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Pending,
        OrderStatus::Validated,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "en_attente",
            OrderStatus::Validated => "validée",
            OrderStatus::Shipped => "expédiée",
            OrderStatus::Delivered => "livrée",
            OrderStatus::Cancelled => "annulée",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// Comma separated list used in validation messages
    pub fn accepted_values() -> String {
        Self::ALL
            .iter()
            .map(|status| status.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// =============================================================================
// ORDER RECORDS (database rows)
// =============================================================================

/// A persisted order, as returned by `GET /commandes/:id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    #[serde(rename = "id_commande")]
    pub id: i64,

    #[serde(rename = "id_client")]
    pub client_id: i64,

    #[serde(rename = "mode_paiement")]
    pub payment_mode: String,

    /// Always computed server side from price snapshots
    #[serde(rename = "montant", with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,

    #[serde(rename = "date_paiement")]
    pub paid_at: Option<DateTime<Utc>>,

    #[serde(rename = "adresse_livraison")]
    pub delivery_address: String,

    #[serde(rename = "statut_commande")]
    pub status: String,

    #[serde(rename = "date_creation")]
    pub created_at: DateTime<Utc>,
}

/// One order line joined with its product name.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderLineDetail {
    #[serde(rename = "id_produit")]
    pub product_id: i64,

    #[serde(rename = "nom_produit")]
    pub product_name: String,

    #[serde(rename = "quantite")]
    pub quantity: i32,

    /// Price captured when the order was placed
    #[serde(rename = "prix_unitaire", with = "rust_decimal::serde::float")]
    pub unit_price: Decimal,
}

/// Row of `GET /commandes`: the order with its client's name.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderSummary {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub order: Order,

    #[serde(rename = "nom_client")]
    pub client_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(rename = "commande")]
    pub order: Order,

    #[serde(rename = "details_produits")]
    pub lines: Vec<OrderLineDetail>,
}

// =============================================================================
// ORDER API REQUESTS / RESPONSES
// =============================================================================

/// Request body for `POST /commandes`.
///
/// Every field is optional at the serde level so that a missing field is
/// reported as a 400 with a readable message instead of a bare rejection.
///
/// # Example JSON
/// ```json
/// {
///   "id_client": 1,
///   "mode_paiement": "Mobile Money",
///   "adresse_livraison": "Libreville, Quartier Louis",
///   "produits": [{ "id_produit": 3, "quantité": 2 }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateOrderRequest {
    pub id_client: Option<i64>,
    pub mode_paiement: Option<String>,
    pub adresse_livraison: Option<String>,
    pub produits: Option<Vec<OrderItemRequest>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderItemRequest {
    pub id_produit: Option<i64>,

    #[serde(rename = "quantité", alias = "quantite")]
    pub quantity: Option<i64>,
}

/// A validated order line, ready for reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderLineInput {
    pub product_id: i64,
    pub quantity: i32,
}

/// A validated order, ready for the transaction manager.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub client_id: i64,
    pub delivery_address: String,
    pub payment_mode: PaymentMode,
    pub lines: Vec<OrderLineInput>,
}

/// Stock of a product after a committed reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevel {
    pub product_id: i64,
    pub stock: i32,
}

/// Result of a committed order placement.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: i64,
    pub total: Decimal,
    pub stock_levels: Vec<StockLevel>,
}

/// Stock handed back by a cancelled order, per product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct RestoredLine {
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub message: String,
    pub id_commande: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub montant_total: Decimal,
}

/// Request body for `PUT /commandes/:id`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateStatusRequest {
    pub statut_commande: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// =============================================================================
// PAYMENT TRANSACTIONS
// =============================================================================

/// A payment transaction row, keyed by its merchant reference.
///
/// Field names follow the snake_case keys the storefront reads back in the
/// `data` object of payment responses.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct TransactionRecord {
    #[serde(skip)]
    pub id: Uuid,

    /// Provider side id; absent until the provider reports one
    pub transaction_id: Option<String>,

    /// Merchant reference, unique per payment attempt
    pub reference: String,

    #[serde(with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,

    /// Provider defined status string; PENDING until the webhook lands
    pub status: String,

    pub customer_account_number: Option<String>,

    #[serde(with = "rust_decimal::serde::float_option")]
    pub fees: Option<Decimal>,

    #[serde(with = "rust_decimal::serde::float_option")]
    pub total_amount: Option<Decimal>,

    pub charge_owner: Option<String>,
    pub free_info: Option<String>,
    pub transaction_operation: String,
    pub operator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A write against the transaction store.
///
/// `None` means "no opinion": on insert the column default applies, on
/// update the stored value is kept. Only `transaction_id`, `status`, `fees`,
/// `total_amount`, `charge_owner` and `operator` are mutable after insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionWrite {
    pub reference: String,
    pub transaction_id: Option<String>,
    pub status: Option<String>,
    pub amount: Option<Decimal>,
    pub customer_account_number: Option<String>,
    pub fees: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub charge_owner: Option<String>,
    pub free_info: Option<String>,
    pub transaction_operation: Option<String>,
    pub operator: Option<String>,
}

impl TransactionWrite {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// PAYMENT API REQUESTS / RESPONSES
// =============================================================================

/// Request body for `POST /api/rest-transaction`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectPaymentRequest {
    pub amount: Option<Decimal>,
    pub product: Option<String>,
    pub customer_account_number: Option<String>,
    pub free_info: Option<String>,
    pub owner_charge: Option<String>,
    pub owner_charge_operator: Option<String>,
}

/// Request body for `POST /api/payment/generate-link`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentLinkRequest {
    pub amount: Option<Decimal>,
    pub customer_account_number: Option<String>,
    pub service: Option<String>,
    pub agent: Option<String>,
    pub product: Option<String>,
    pub free_info: Option<String>,
    pub owner_charge: Option<String>,
    pub operator_owner_charge: Option<String>,
}

/// Notification posted by the provider on `POST /api/payment-webhook`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    #[serde(default, deserialize_with = "string_or_number")]
    pub transaction_id: Option<String>,
    pub merchant_reference_id: Option<String>,
    pub status: Option<String>,
    pub amount: Option<Decimal>,
    #[serde(rename = "customerID", default, deserialize_with = "string_or_number")]
    pub customer_id: Option<String>,
    pub fees: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub charge_owner: Option<String>,
    pub free_info: Option<String>,
    pub transaction_operation: Option<String>,
    pub code: Option<serde_json::Value>,
    pub operator: Option<String>,
}

impl WebhookNotification {
    /// Maps the provider's camelCase payload onto a store write.
    pub fn to_write(&self, reference: &str) -> TransactionWrite {
        TransactionWrite {
            reference: reference.to_string(),
            transaction_id: self.transaction_id.clone(),
            status: self.status.clone(),
            amount: self.amount,
            customer_account_number: self.customer_id.clone(),
            fees: self.fees,
            total_amount: self.total_amount,
            charge_owner: self.charge_owner.clone(),
            free_info: self.free_info.clone(),
            transaction_operation: self.transaction_operation.clone(),
            operator: self.operator.clone(),
        }
    }
}

/// Identifiers arrive as strings or bare numbers depending on the operator.
/// Any other JSON type reads as absent so the notification is still stored.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(value)) => Some(value),
        Some(serde_json::Value::Number(value)) => Some(value.to_string()),
        _ => None,
    })
}

/// Acknowledgement returned to the provider
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub response_code: serde_json::Value,
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Request body for `POST /api/payment/secret-callback`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretCallbackRequest {
    pub secret_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretCallbackAck {
    pub response_code: u16,
    pub message: String,
}

/// Reconciled outcome of a payment attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_link: Option<String>,

    #[serde(flatten)]
    pub transaction: TransactionRecord,
}

/// Success envelope of the payment routes
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub success: bool,
    pub message: String,
    pub data: PaymentOutcome,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
///
/// `success` is always false so that payment clients can branch on the same
/// field for both outcomes.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,

    /// Stable machine readable code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Merchant reference of the payment attempt, when one was generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Optional additional details (provider payloads, never internals)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            message: message.into(),
            reference: None,
            details: None,
        }
    }

    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_details(mut self, details: Option<serde_json::Value>) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_mode_round_trips_wire_spelling() {
        assert_eq!(PaymentMode::parse("Mobile Money"), Some(PaymentMode::MobileMoney));
        assert_eq!(PaymentMode::parse("Espèces"), Some(PaymentMode::Cash));
        assert_eq!(PaymentMode::parse("Bitcoin"), None);
        assert_eq!(PaymentMode::Card.as_str(), "Carte");
    }

    #[test]
    fn test_order_status_parse_rejects_unknown() {
        assert_eq!(OrderStatus::parse("validée"), Some(OrderStatus::Validated));
        assert_eq!(OrderStatus::parse("validee"), None);
        assert!(OrderStatus::accepted_values().starts_with("en_attente, validée"));
    }

    #[test]
    fn test_order_item_accepts_accented_and_plain_quantity() {
        let accented: OrderItemRequest =
            serde_json::from_str(r#"{"id_produit": 4, "quantité": 2}"#).unwrap();
        let plain: OrderItemRequest =
            serde_json::from_str(r#"{"id_produit": 4, "quantite": 3}"#).unwrap();

        assert_eq!(accented.quantity, Some(2));
        assert_eq!(plain.quantity, Some(3));
    }

    #[test]
    fn test_webhook_notification_reads_provider_keys() {
        let payload = r#"{
            "transactionId": "TX-991",
            "merchantReferenceId": "REFABC1234567",
            "status": "SUCCESS",
            "amount": 5000,
            "customerID": "074000000",
            "fees": "25.5",
            "totalAmount": 5025.5,
            "chargeOwner": "MERCHANT",
            "freeInfo": "Transaction1",
            "transactionOperation": "PAYMENT",
            "code": 200,
            "operator": "AIRTEL"
        }"#;

        let notification: WebhookNotification = serde_json::from_str(payload).unwrap();
        let write = notification.to_write("REFABC1234567");

        assert_eq!(write.transaction_id.as_deref(), Some("TX-991"));
        assert_eq!(write.status.as_deref(), Some("SUCCESS"));
        assert_eq!(write.amount, Some(Decimal::from(5000)));
        assert_eq!(write.fees, Some(Decimal::new(255, 1)));
        assert_eq!(write.customer_account_number.as_deref(), Some("074000000"));
        assert_eq!(notification.code, Some(serde_json::json!(200)));
    }

    #[test]
    fn test_webhook_notification_accepts_numeric_identifiers() {
        let payload = r#"{
            "transactionId": 987654,
            "merchantReferenceId": "REFABC1234567",
            "status": "SUCCESS",
            "customerID": 74000000
        }"#;

        let notification: WebhookNotification = serde_json::from_str(payload).unwrap();
        let write = notification.to_write("REFABC1234567");

        assert_eq!(write.transaction_id.as_deref(), Some("987654"));
        assert_eq!(write.customer_account_number.as_deref(), Some("74000000"));
    }

    #[test]
    fn test_webhook_notification_tolerates_null_and_odd_identifiers() {
        let notification: WebhookNotification = serde_json::from_str(
            r#"{"transactionId": null, "merchantReferenceId": "REFABC1234567", "customerID": true}"#,
        )
        .unwrap();

        assert!(notification.transaction_id.is_none());
        assert!(notification.customer_id.is_none());
        assert_eq!(notification.merchant_reference_id.as_deref(), Some("REFABC1234567"));
    }

    #[test]
    fn test_order_summary_flattens_order_fields() {
        let summary = OrderSummary {
            order: Order {
                id: 9,
                client_id: 2,
                payment_mode: "Carte".into(),
                total_amount: Decimal::new(1999, 2),
                paid_at: None,
                delivery_address: "Libreville".into(),
                status: "en_attente".into(),
                created_at: Utc::now(),
            },
            client_name: "Awa".into(),
        };

        let body = serde_json::to_value(&summary).unwrap();

        assert_eq!(body["id_commande"], 9);
        assert_eq!(body["montant"], 19.99);
        assert_eq!(body["nom_client"], "Awa");
    }

    #[test]
    fn test_error_response_omits_empty_optionals() {
        let body = serde_json::to_value(ErrorResponse::new("NOT_FOUND", "gone")).unwrap();

        assert_eq!(body["success"], false);
        assert!(body.get("reference").is_none());
        assert!(body.get("details").is_none());
    }
}
