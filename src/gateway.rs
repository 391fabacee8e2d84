// =============================================================================
// PAYMENT GATEWAY
// =============================================================================
// Payment flows against the PVit provider and reconciliation of its webhooks.
//
// FLOW (direct payment and payment link):
// 1. validate the request (nothing is sent or generated for a bad request)
// 2. make sure a secret key is available
// 3. generate a merchant reference and register a waiter for it
// 4. send the provider request
// 5. write the local PENDING record
// 6. wait for the webhook, bounded by the callback timeout
//
// The waiter is registered before step 4, so a webhook racing the provider's
// HTTP response still finds it. The PENDING write and the webhook merge
// through the same upsert, in either order.
// =============================================================================

use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::callbacks::{CallbackRegistry, PendingCallback};
use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    DirectPaymentRequest, PaymentLinkRequest, PaymentOutcome, TransactionRecord,
    TransactionWrite, WebhookNotification,
};
use crate::provider::{
    truncate, PaymentLinkPayload, ProviderClient, RestTransactionPayload, AGENT_MAX_LEN,
    CUSTOMER_ACCOUNT_MAX_LEN, FREE_INFO_MAX_LEN, PRODUCT_MAX_LEN, REFERENCE_MAX_LEN,
};
use crate::secret::{self, SecretKeyCache, SecretRenewer};
use crate::store::TransactionStore;

const REFERENCE_PREFIX: &str = "REF";
const REFERENCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const REFERENCE_RANDOM_LEN: usize = 10;

/// Fresh references tried when one is already held by a waiter
const REFERENCE_ATTEMPTS: usize = 3;

/// Payment links must be strictly above this amount
pub const MIN_LINK_AMOUNT: Decimal = Decimal::from_parts(150, 0, 0, false, 0);

/// Services a payment link can be generated for
pub const LINK_SERVICES: [&str; 3] = ["VISA_MASTERCARD", "WEB", "RESTLINK"];

const TRANSACTION_TYPE: &str = "PAYMENT";
const REST_SERVICE: &str = "RESTFUL";
const DEFAULT_FREE_INFO: &str = "Transaction1";
const DEFAULT_LINK_PRODUCT: &str = "PRODUIT-1";

/// `REF` followed by 10 characters from `[A-Z0-9]`.
pub fn generate_reference() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..REFERENCE_RANDOM_LEN)
        .map(|_| REFERENCE_CHARSET[rng.gen_range(0..REFERENCE_CHARSET.len())] as char)
        .collect();
    format!("{}{}", REFERENCE_PREFIX, suffix)
}

/// Result of processing one webhook
#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub record: TransactionRecord,
    /// Whether a suspended payment request was woken up
    pub waiter_notified: bool,
}

pub struct PaymentGateway {
    provider: Arc<ProviderClient>,
    secrets: Arc<SecretKeyCache>,
    callbacks: Arc<CallbackRegistry<TransactionRecord>>,
    store: Arc<dyn TransactionStore>,
    config: ProviderConfig,
}

impl PaymentGateway {
    pub fn new(config: ProviderConfig, store: Arc<dyn TransactionStore>) -> AppResult<Self> {
        Ok(Self {
            provider: Arc::new(ProviderClient::new(config.clone())?),
            secrets: Arc::new(SecretKeyCache::new(
                secret::RENEWAL_INTERVAL,
                config.secret_grace_period,
            )),
            callbacks: Arc::new(CallbackRegistry::observed(metrics::set_pending_callbacks)),
            store,
            config,
        })
    }

    /// Renew the secret key every minute when it is missing or stale.
    pub fn spawn_secret_refresh(&self) -> JoinHandle<()> {
        let renewer: Arc<dyn SecretRenewer> = self.provider.clone();
        secret::spawn_refresh_task(self.secrets.clone(), renewer, secret::REFRESH_PERIOD)
    }

    // =========================================================================
    // DIRECT PAYMENT
    // =========================================================================
    pub async fn initiate_direct_payment(
        &self,
        request: DirectPaymentRequest,
    ) -> AppResult<PaymentOutcome> {
        let result = self.direct_payment(request).await;
        record_attempt("direct", &result);
        result
    }

    async fn direct_payment(&self, request: DirectPaymentRequest) -> AppResult<PaymentOutcome> {
        let (amount, account) = match (
            request.amount.filter(|amount| *amount > Decimal::ZERO),
            non_blank(request.customer_account_number),
        ) {
            (Some(amount), Some(account)) => (amount, account),
            _ => {
                return Err(AppError::BadRequest(
                    "amount and customer_account_number are required".to_string(),
                ))
            }
        };

        let secret = self.secrets.ensure_valid(self.provider.as_ref()).await?;
        let pending = self.register_waiter()?;
        let reference = pending.reference().to_string();

        let owner_charge = request.owner_charge.unwrap_or_else(|| "MERCHANT".to_string());
        let free_info = request.free_info.filter(|info| !info.is_empty());

        let payload = RestTransactionPayload {
            agent: truncate(&self.config.agent, AGENT_MAX_LEN),
            amount,
            product: request
                .product
                .as_deref()
                .map(|product| truncate(product, PRODUCT_MAX_LEN)),
            reference: truncate(&reference, REFERENCE_MAX_LEN),
            service: REST_SERVICE,
            callback_url_code: self.config.callback_code.clone(),
            customer_account_number: truncate(&account, CUSTOMER_ACCOUNT_MAX_LEN),
            merchant_operation_account_code: self.config.account_id.clone(),
            transaction_type: TRANSACTION_TYPE,
            owner_charge: owner_charge.clone(),
            owner_charge_operator: request
                .owner_charge_operator
                .unwrap_or_else(|| "MERCHANT".to_string()),
            free_info: truncate(
                free_info.as_deref().unwrap_or(DEFAULT_FREE_INFO),
                FREE_INFO_MAX_LEN,
            ),
        };

        let response = self
            .provider
            .send_rest(&secret, &payload)
            .await
            .map_err(|err| err.with_reference(&reference))?;

        self.store
            .upsert_by_reference(&TransactionWrite {
                transaction_id: response.transaction_id(),
                amount: Some(amount),
                customer_account_number: Some(account),
                charge_owner: Some(owner_charge),
                free_info,
                transaction_operation: Some(TRANSACTION_TYPE.to_string()),
                ..TransactionWrite::new(reference.as_str())
            })
            .await?;

        tracing::info!(reference = %reference, "Direct payment sent, waiting for the webhook");

        let transaction = pending.wait(self.config.callback_timeout).await?;

        Ok(PaymentOutcome {
            payment_link: None,
            transaction,
        })
    }

    // =========================================================================
    // PAYMENT LINK
    // =========================================================================
    pub async fn initiate_payment_link(
        &self,
        request: PaymentLinkRequest,
    ) -> AppResult<PaymentOutcome> {
        let result = self.payment_link(request).await;
        record_attempt("link", &result);
        result
    }

    async fn payment_link(&self, request: PaymentLinkRequest) -> AppResult<PaymentOutcome> {
        let (amount, account, service) = match (
            request.amount.filter(|amount| *amount > Decimal::ZERO),
            non_blank(request.customer_account_number),
            non_blank(request.service),
        ) {
            (Some(amount), Some(account), Some(service)) => (amount, account, service),
            _ => {
                return Err(AppError::BadRequest(
                    "amount, customer_account_number and service are required".to_string(),
                ))
            }
        };

        if amount <= MIN_LINK_AMOUNT {
            return Err(AppError::BadRequest(format!(
                "amount must be greater than {}",
                MIN_LINK_AMOUNT
            )));
        }

        if !LINK_SERVICES.contains(&service.as_str()) {
            return Err(AppError::BadRequest(format!(
                "service must be one of {}",
                LINK_SERVICES.join(", ")
            )));
        }

        let Some((success_code, failed_code)) = self.config.redirect_codes() else {
            return Err(AppError::BadRequest(
                "payment link redirect codes are not configured".to_string(),
            ));
        };

        let secret = self.secrets.ensure_valid(self.provider.as_ref()).await?;
        let pending = self.register_waiter()?;
        let reference = pending.reference().to_string();

        let free_info = request
            .free_info
            .as_deref()
            .filter(|info| !info.is_empty())
            .map(|info| truncate(info, FREE_INFO_MAX_LEN));
        let owner_charge = request.owner_charge.unwrap_or_else(|| "CUSTOMER".to_string());

        let payload = PaymentLinkPayload {
            agent: truncate(
                request.agent.as_deref().unwrap_or(self.config.agent.as_str()),
                AGENT_MAX_LEN,
            ),
            amount,
            product: truncate(
                request.product.as_deref().unwrap_or(DEFAULT_LINK_PRODUCT),
                PRODUCT_MAX_LEN,
            ),
            reference: truncate(&reference, REFERENCE_MAX_LEN),
            service: service.clone(),
            callback_url_code: self.config.callback_code.clone(),
            customer_account_number: truncate(&account, CUSTOMER_ACCOUNT_MAX_LEN),
            merchant_operation_account_code: self.config.account_id.clone(),
            transaction_type: TRANSACTION_TYPE,
            owner_charge: owner_charge.clone(),
            operator_owner_charge: request
                .operator_owner_charge
                .unwrap_or_else(|| "CUSTOMER".to_string()),
            free_info: free_info.clone(),
            failed_redirection_url_code: failed_code.to_string(),
            success_redirection_url_code: success_code.to_string(),
        };

        let response = self
            .provider
            .send_link(&secret, &payload)
            .await
            .map_err(|err| err.with_reference(&reference))?;

        self.store
            .upsert_by_reference(&TransactionWrite {
                transaction_id: response.transaction_id(),
                amount: Some(amount),
                customer_account_number: Some(account),
                charge_owner: Some(owner_charge),
                free_info,
                transaction_operation: Some(TRANSACTION_TYPE.to_string()),
                operator: (service == "VISA_MASTERCARD").then(|| "VISA".to_string()),
                ..TransactionWrite::new(reference.as_str())
            })
            .await?;

        tracing::info!(
            reference = %reference,
            service = %service,
            "Payment link generated, waiting for the webhook"
        );

        let transaction = pending.wait(self.config.callback_timeout).await?;

        Ok(PaymentOutcome {
            payment_link: response.payment_link,
            transaction,
        })
    }

    // =========================================================================
    // INBOUND CALLBACKS
    // =========================================================================

    /// Persist the provider's view of a transaction, then wake its waiter.
    ///
    /// A webhook nobody waits for (late, or never awaited) is still stored.
    pub async fn handle_webhook(&self, notification: WebhookNotification) -> AppResult<WebhookOutcome> {
        let Some(reference) = non_blank(notification.merchant_reference_id.clone()) else {
            return Err(AppError::BadRequest(
                "merchantReferenceId is required".to_string(),
            ));
        };

        let record = self
            .store
            .upsert_by_reference(&notification.to_write(&reference))
            .await?;

        let waiter_notified = self.callbacks.resolve(&reference, record.clone());

        metrics::record_webhook(waiter_notified);
        tracing::info!(
            reference = %reference,
            status = %record.status,
            waiter_notified,
            "Transaction webhook processed"
        );

        Ok(WebhookOutcome {
            record,
            waiter_notified,
        })
    }

    pub fn on_secret_pushed(&self, key: String) {
        self.secrets.on_secret_pushed(key);
    }

    /// Lets a client poll a reference after a callback timeout.
    pub async fn find_transaction(&self, reference: &str) -> AppResult<TransactionRecord> {
        self.store
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transaction {} not found", reference)))
    }

    fn register_waiter(&self) -> AppResult<PendingCallback<TransactionRecord>> {
        let mut last_err = None;

        for _ in 0..REFERENCE_ATTEMPTS {
            match self.callbacks.register(&generate_reference()) {
                Ok(pending) => return Ok(pending),
                Err(err @ AppError::DuplicateWaiter(_)) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| AppError::Internal("no reference attempted".to_string())))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn record_attempt(flow: &'static str, result: &AppResult<PaymentOutcome>) {
    let outcome = match result {
        Ok(_) => "completed",
        Err(AppError::CallbackTimeout { .. }) => "timeout",
        Err(AppError::BadRequest(_)) => "rejected",
        Err(_) => "error",
    };
    metrics::record_payment_attempt(flow, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryTransactionStore;
    use crate::test_support;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REST: &str = "/FH9WCKEIPITSHCY0/rest";
    const LINK: &str = "/ZRS0VFCPA0YJUCFV/link";
    const RENEW: &str = "/WPORYY2HIGCKDZWX/renew-secret";

    struct Fixture {
        server: MockServer,
        store: Arc<MemoryTransactionStore>,
        gateway: Arc<PaymentGateway>,
    }

    async fn fixture(adjust: impl FnOnce(&mut ProviderConfig)) -> Fixture {
        let server = MockServer::start().await;
        let mut config = test_support::provider_config(&server.uri());
        adjust(&mut config);

        let store = Arc::new(MemoryTransactionStore::default());
        let gateway = PaymentGateway::new(config, store.clone()).unwrap();
        gateway.on_secret_pushed("KEY-1".into());

        Fixture {
            server,
            store,
            gateway: Arc::new(gateway),
        }
    }

    async fn provider_accepts(server: &MockServer, route: &str, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    /// Plays the provider: waits for the in-flight reference, then posts the
    /// webhook for it.
    async fn deliver_webhook(gateway: &PaymentGateway, status: &str) -> WebhookOutcome {
        let reference = loop {
            if let Some(reference) = gateway.callbacks.references().pop() {
                break reference;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };

        gateway
            .handle_webhook(notification(&reference, status))
            .await
            .unwrap()
    }

    fn notification(reference: &str, status: &str) -> WebhookNotification {
        WebhookNotification {
            transaction_id: Some("PVIT-77".into()),
            merchant_reference_id: Some(reference.to_string()),
            status: Some(status.to_string()),
            amount: Some(dec!(5000)),
            customer_id: Some("074000000".into()),
            fees: Some(dec!(50)),
            total_amount: Some(dec!(5050)),
            operator: Some("AIRTEL".into()),
            ..Default::default()
        }
    }

    fn direct_request() -> DirectPaymentRequest {
        DirectPaymentRequest {
            amount: Some(dec!(5000)),
            customer_account_number: Some("074000000".into()),
            ..Default::default()
        }
    }

    fn link_request(amount: Decimal, service: &str) -> PaymentLinkRequest {
        PaymentLinkRequest {
            amount: Some(amount),
            customer_account_number: Some("074000000".into()),
            service: Some(service.to_string()),
            ..Default::default()
        }
    }

    async fn provider_requests(server: &MockServer) -> usize {
        server.received_requests().await.unwrap_or_default().len()
    }

    #[test]
    fn test_reference_format() {
        for _ in 0..100 {
            let reference = generate_reference();
            assert_eq!(reference.len(), 13);
            assert!(reference.starts_with("REF"));
            assert!(reference[3..]
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_direct_payment_completes_on_webhook() {
        let fx = fixture(|_| {}).await;
        provider_accepts(&fx.server, REST, json!({"transaction_id": "PVIT-77"})).await;

        let payment = {
            let gateway = fx.gateway.clone();
            tokio::spawn(async move { gateway.initiate_direct_payment(direct_request()).await })
        };
        let webhook = deliver_webhook(&fx.gateway, "SUCCESS").await;
        let outcome = payment.await.unwrap().unwrap();

        assert!(webhook.waiter_notified);
        assert_eq!(outcome.transaction.status, "SUCCESS");
        assert_eq!(outcome.transaction.reference, webhook.record.reference);
        assert!(outcome.payment_link.is_none());
        assert!(fx.gateway.callbacks.is_empty());

        // whichever of webhook and local write landed last, the row is final
        let stored = fx
            .store
            .find_by_reference(&webhook.record.reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "SUCCESS");
        assert_eq!(stored.charge_owner.as_deref(), Some("MERCHANT"));
    }

    #[tokio::test]
    async fn test_timeout_reports_reference_and_late_webhook_is_persisted() {
        let fx = fixture(|config| config.callback_timeout = Duration::from_millis(100)).await;
        provider_accepts(&fx.server, REST, json!({})).await;

        let err = fx
            .gateway
            .initiate_direct_payment(direct_request())
            .await
            .unwrap_err();

        let reference = match err {
            AppError::CallbackTimeout { reference } => reference,
            other => panic!("expected a callback timeout, got {:?}", other),
        };
        assert!(fx.gateway.callbacks.is_empty());

        let pending = fx.gateway.find_transaction(&reference).await.unwrap();
        assert_eq!(pending.status, "PENDING");

        let late = fx
            .gateway
            .handle_webhook(notification(&reference, "SUCCESS"))
            .await
            .unwrap();

        assert!(!late.waiter_notified);
        let stored = fx.gateway.find_transaction(&reference).await.unwrap();
        assert_eq!(stored.status, "SUCCESS");
        assert_eq!(stored.transaction_id.as_deref(), Some("PVIT-77"));
    }

    #[tokio::test]
    async fn test_direct_payment_requires_amount_and_account() {
        let fx = fixture(|_| {}).await;

        let err = fx
            .gateway
            .initiate_direct_payment(DirectPaymentRequest {
                customer_account_number: None,
                ..direct_request()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(provider_requests(&fx.server).await, 0);
    }

    #[tokio::test]
    async fn test_provider_rejection_carries_detail_and_reference() {
        let fx = fixture(|_| {}).await;
        Mock::given(method("POST"))
            .and(path(REST))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"message": "invalid account"})),
            )
            .mount(&fx.server)
            .await;

        let err = fx
            .gateway
            .initiate_direct_payment(direct_request())
            .await
            .unwrap_err();

        match err {
            AppError::Gateway {
                detail, reference, ..
            } => {
                assert_eq!(detail, Some(json!({"message": "invalid account"})));
                assert!(reference.unwrap().starts_with("REF"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // the waiter went away with the failed attempt
        assert!(fx.gateway.callbacks.is_empty());
    }

    #[tokio::test]
    async fn test_link_below_minimum_never_reaches_provider() {
        let fx = fixture(|_| {}).await;

        let err = fx
            .gateway
            .initiate_payment_link(link_request(dec!(100), "WEB"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(msg) if msg.contains("150")));
        assert_eq!(provider_requests(&fx.server).await, 0);
        assert!(fx.gateway.callbacks.is_empty());
    }

    #[tokio::test]
    async fn test_link_amount_of_exactly_150_is_rejected() {
        let fx = fixture(|_| {}).await;

        let err = fx
            .gateway
            .initiate_payment_link(link_request(dec!(150), "WEB"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_link_with_unknown_service_is_rejected() {
        let fx = fixture(|_| {}).await;

        let err = fx
            .gateway
            .initiate_payment_link(link_request(dec!(5000), "PAYPAL"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(msg) if msg.contains("VISA_MASTERCARD")));
        assert_eq!(provider_requests(&fx.server).await, 0);
    }

    #[tokio::test]
    async fn test_link_without_redirect_codes_is_rejected() {
        let fx = fixture(|config| config.redirect_failed_code = None).await;

        let err = fx
            .gateway
            .initiate_payment_link(link_request(dec!(5000), "WEB"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(msg) if msg.contains("redirect")));
        assert_eq!(provider_requests(&fx.server).await, 0);
    }

    #[tokio::test]
    async fn test_card_link_returns_link_and_records_visa_operator() {
        let fx = fixture(|_| {}).await;
        provider_accepts(
            &fx.server,
            LINK,
            json!({"payment_link": "https://pay.test/abc", "transaction_id": "PVIT-78"}),
        )
        .await;

        let payment = {
            let gateway = fx.gateway.clone();
            tokio::spawn(async move {
                gateway
                    .initiate_payment_link(link_request(dec!(5000), "VISA_MASTERCARD"))
                    .await
            })
        };
        let webhook = deliver_webhook(&fx.gateway, "SUCCESS").await;
        let outcome = payment.await.unwrap().unwrap();

        assert_eq!(outcome.payment_link.as_deref(), Some("https://pay.test/abc"));
        assert_eq!(outcome.transaction.status, "SUCCESS");

        let stored = fx
            .store
            .find_by_reference(&webhook.record.reference)
            .await
            .unwrap()
            .unwrap();
        // the webhook's operator wins over the locally inferred one
        assert_eq!(stored.operator.as_deref(), Some("AIRTEL"));
        assert_eq!(stored.charge_owner.as_deref(), Some("CUSTOMER"));
    }

    #[tokio::test]
    async fn test_missing_secret_without_push_fails_before_provider_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RENEW))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryTransactionStore::default());
        let gateway =
            PaymentGateway::new(test_support::provider_config(&server.uri()), store).unwrap();

        let err = gateway
            .initiate_direct_payment(direct_request())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::SecretRenewalFailed(_)));
        // only the renewal request went out
        assert_eq!(provider_requests(&server).await, 1);
    }

    #[tokio::test]
    async fn test_webhook_without_reference_is_rejected() {
        let fx = fixture(|_| {}).await;

        let err = fx
            .gateway
            .handle_webhook(WebhookNotification {
                merchant_reference_id: None,
                ..notification("", "SUCCESS")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_unsolicited_webhook_is_stored() {
        let fx = fixture(|_| {}).await;

        let outcome = fx
            .gateway
            .handle_webhook(notification("REFUNKNOWN001", "FAILED"))
            .await
            .unwrap();

        assert!(!outcome.waiter_notified);
        let stored = fx.gateway.find_transaction("REFUNKNOWN001").await.unwrap();
        assert_eq!(stored.status, "FAILED");
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let fx = fixture(|_| {}).await;

        let err = fx.gateway.find_transaction("REFNOPE000000").await.unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
    }
}
