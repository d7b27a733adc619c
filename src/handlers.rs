//! HTTP surface of the gateway.
//!
//! Two groups of endpoints share one router:
//!
//! - The tenant API (`/payments/initiate/`, `/payments/`,
//!   `/payments/{reference}/`, `/payments/{reference}/refund/`), guarded by
//!   the bearer-key middleware. Every lookup is scoped to the
//!   authenticated tenant; a foreign payment yields 404, never 403.
//! - The processor-facing callbacks (`/payments/verify/` for the user
//!   redirect, `/payments/webhook/` for server-to-server notifications).
//!   The webhook endpoint bypasses tenant auth entirely; its only guard is
//!   the HMAC-SHA512 signature over the raw body.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::auth::{self, CurrentTenant, RateLimiter};
use crate::config::Config;
use crate::engine::{EngineError, InitiateInput, InitiateOutcome, PaymentEngine};
use crate::model::Payment;
use crate::processor::InboundEvent;
use crate::repository::{PageRequest, PaymentFilter, Repository};
use crate::signature::verify_sha512_hex;

pub const PROCESSOR_SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub engine: Arc<PaymentEngine>,
    pub limiter: Arc<RateLimiter>,
}

/// Errors surfaced by the API handlers.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    InvalidJson,
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        ApiError::Engine(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidJson => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid JSON body" })),
            )
                .into_response(),
            ApiError::Engine(error) => match error {
                EngineError::Validation(details) => (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Validation failed", "details": details })),
                )
                    .into_response(),
                EngineError::NotFound => (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "Payment not found" })),
                )
                    .into_response(),
                EngineError::NotRefundable => (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Payment is not refundable" })),
                )
                    .into_response(),
                EngineError::InvalidRefundAmount(message) => (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": message })),
                )
                    .into_response(),
                EngineError::Upstream(message) => (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "status": false, "message": message })),
                )
                    .into_response(),
                EngineError::Repo(error) => {
                    tracing::error!("Repository failure: {error}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "Internal server error" })),
                    )
                        .into_response()
                }
            },
        }
    }
}

/// Assemble the full router. Tenant-API routes get the auth middleware;
/// callback routes stay open.
pub fn routes(state: AppState) -> Router {
    let api = Router::new()
        .route("/payments/initiate/", post(initiate_payment))
        .route("/payments/", get(list_payments))
        .route("/payments/{reference}/", get(payment_status))
        .route("/payments/{reference}/refund/", post(refund_payment))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_tenant,
        ));

    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/payments/verify/", get(verify_payment))
        .route("/payments/webhook/", post(processor_webhook))
        .merge(api)
        .with_state(state)
}

/// `GET /`: greeting, mostly useful as a liveness hint for humans.
#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

#[instrument(skip_all)]
async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct InitiateBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    service_reference: String,
    #[serde(default)]
    callback_url: String,
    #[serde(default)]
    idempotency_key: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

fn default_currency() -> String {
    "KES".to_string()
}

/// `POST /payments/initiate/`: start a payment and hand back the
/// processor's authorization URL.
#[instrument(skip_all)]
async fn initiate_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<CurrentTenant>,
    body: Result<Json<InitiateBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body.map_err(|_| ApiError::InvalidJson)?;
    let input = InitiateInput {
        email: body.email.trim().to_string(),
        name: body.name.trim().to_string(),
        amount: body.amount,
        currency: body.currency.trim().to_string(),
        description: body.description.trim().to_string(),
        service_reference: body.service_reference.trim().to_string(),
        callback_url: body.callback_url.trim().to_string(),
        idempotency_key: body.idempotency_key.trim().to_string(),
        metadata: body.metadata,
        client_ip: Some(auth.client_ip.clone()),
    };

    match state.engine.initiate(&auth.tenant, input).await? {
        InitiateOutcome::Created(payment) => Ok(Json(json!({
            "status": true,
            "message": "Payment initiated",
            "data": {
                "reference": payment.reference,
                "authorization_url": payment.authorization_url,
                "callback_url": payment.callback_url,
            },
        }))),
        InitiateOutcome::Existing(payment) => Ok(Json(json!({
            "status": true,
            "message": "Payment already exists (idempotent)",
            "data": {
                "reference": payment.reference,
                "authorization_url": payment.authorization_url,
                "status": payment.status,
            },
        }))),
    }
}

fn payment_data_block(payment: &Payment) -> serde_json::Value {
    json!({
        "reference": payment.reference,
        "service_reference": payment.service_reference,
        "email": payment.email,
        "name": payment.name,
        "amount": payment.amount.to_string(),
        "currency": payment.currency,
        "description": payment.description,
        "status": payment.status,
        "channel": payment.channel,
        "fees": payment.fees.to_string(),
        "net_amount": payment.net_amount().to_string(),
        "refund_status": payment.refund_status,
        "refunded_amount": payment.refunded_amount.to_string(),
        "created_at": payment.created_at.to_rfc3339(),
        "updated_at": payment.updated_at.to_rfc3339(),
    })
}

/// `GET /payments/{reference}/`: one payment's state, tenant-scoped.
#[instrument(skip_all)]
async fn payment_status(
    State(state): State<AppState>,
    Extension(auth): Extension<CurrentTenant>,
    Path(reference): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let payment = state.engine.payment_status(&auth.tenant, &reference).await?;
    Ok(Json(json!({
        "status": true,
        "data": payment_data_block(&payment),
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    email: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

/// `GET /payments/`: paginated listing of the tenant's payments. Unknown
/// status filters are ignored rather than rejected.
#[instrument(skip_all)]
async fn list_payments(
    State(state): State<AppState>,
    Extension(auth): Extension<CurrentTenant>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = PaymentFilter {
        status: query.status.as_deref().and_then(|s| s.parse().ok()),
        email: query.email,
    };
    let page = PageRequest::clamped(query.page, query.per_page);
    let result = state.engine.list_payments(&auth.tenant, &filter, page).await?;

    let data: Vec<serde_json::Value> = result
        .data
        .iter()
        .map(|payment| {
            json!({
                "reference": payment.reference,
                "service_reference": payment.service_reference,
                "email": payment.email,
                "amount": payment.amount.to_string(),
                "currency": payment.currency,
                "status": payment.status,
                "refund_status": payment.refund_status,
                "created_at": payment.created_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(json!({
        "status": true,
        "data": data,
        "meta": {
            "total": result.total,
            "page": result.page,
            "per_page": result.per_page,
            "pages": result.pages,
        },
    })))
}

#[derive(Debug, Default, Deserialize)]
struct RefundBody {
    amount: Option<Decimal>,
    #[serde(default)]
    reason: String,
}

/// `POST /payments/{reference}/refund/`: full refund when no amount is
/// given, partial otherwise.
#[instrument(skip_all)]
async fn refund_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<CurrentTenant>,
    Path(reference): Path<String>,
    body: Result<Json<RefundBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // An absent or unparseable body means a full refund.
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let reason = Some(body.reason.trim().to_string()).filter(|r| !r.is_empty());

    let payment = state
        .engine
        .refund(&auth.tenant, &reference, body.amount, reason)
        .await?;
    Ok(Json(json!({
        "status": true,
        "message": "Refund initiated",
        "data": {
            "reference": payment.reference,
            "refund_status": payment.refund_status,
            "refunded_amount": payment.refunded_amount.to_string(),
            "refundable_amount": payment.refundable_amount().to_string(),
        },
    })))
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(default)]
    reference: String,
}

/// `GET /payments/verify/`: the processor redirects the user's browser here
/// after the hosted page. Verifies against the processor, then forwards the
/// user to the payment's callback URL (or the public pay page).
#[instrument(skip_all)]
async fn verify_payment(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    if query.reference.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No payment reference provided" })),
        )
            .into_response();
    }

    let payment = match state.engine.verify_by_reference(&query.reference).await {
        Ok(payment) => payment,
        Err(EngineError::NotFound) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Payment not found" })),
            )
                .into_response();
        }
        Err(error) => return ApiError::from(error).into_response(),
    };

    if !payment.callback_url.is_empty() {
        let separator = if payment.callback_url.contains('?') {
            '&'
        } else {
            '?'
        };
        let target = format!(
            "{}{}reference={}&status={}",
            payment.callback_url, separator, payment.reference, payment.status
        );
        return Redirect::to(&target).into_response();
    }

    let pay_page = state
        .config
        .site_url
        .join("/payments/pay/")
        .map(|url| url.to_string())
        .unwrap_or_else(|_| "/".to_string());
    Redirect::to(&pay_page).into_response()
}

/// `POST /payments/webhook/`: the processor's server-to-server channel.
///
/// The raw body bytes are verified before any parsing. After a valid
/// signature the endpoint always acknowledges with 200, even when the event
/// resolves to nothing, so the processor does not retry on business-logic
/// gaps.
#[instrument(skip_all)]
async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(PROCESSOR_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let secret = &state.config.processor.secret_key;
    if secret.is_empty() || !verify_sha512_hex(&body, secret, signature) {
        tracing::warn!("Invalid processor webhook signature");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid signature" })),
        )
            .into_response();
    }

    match InboundEvent::parse(&body) {
        Ok(event) => state.engine.handle_inbound_event(event).await,
        Err(error) => {
            if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid JSON" })),
                )
                    .into_response();
            }
            // A known event with unusable data; acknowledge so the
            // processor does not retry.
            tracing::warn!("Unprocessable webhook payload: {error}");
        }
    }

    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessorConfig, RateLimitConfig, WebhookConfig};
    use crate::dispatcher::WebhookDispatcher;
    use crate::model::Tenant;
    use crate::processor::{
        InitializeData, InitializeRequest, Processor, ProcessorEnvelope, RefundData,
        TransactionData,
    };
    use crate::repository::InMemoryRepository;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
    use axum::http::{Method, Request};
    use hmac::{Hmac, Mac};
    use sha2::Sha512;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;
    use url::Url;

    const UPSTREAM_SECRET: &str = "sk_upstream_secret";

    #[derive(Default)]
    struct ScriptedProcessor {
        initialize_calls: AtomicUsize,
        fail_initialize: AtomicBool,
        verify_response: Mutex<Option<ProcessorEnvelope<TransactionData>>>,
        refund_response: Mutex<Option<ProcessorEnvelope<RefundData>>>,
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        async fn initialize(
            &self,
            request: &InitializeRequest,
        ) -> ProcessorEnvelope<InitializeData> {
            self.initialize_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_initialize.load(Ordering::SeqCst) {
                return ProcessorEnvelope::failure("The processor is down");
            }
            ProcessorEnvelope {
                status: true,
                message: String::new(),
                data: Some(InitializeData {
                    authorization_url: "https://p/abc".to_string(),
                    access_code: String::new(),
                    reference: request.reference.clone(),
                }),
            }
        }

        async fn verify(&self, _reference: &str) -> ProcessorEnvelope<TransactionData> {
            self.verify_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| ProcessorEnvelope::failure("not scripted"))
        }

        async fn refund(
            &self,
            _reference: &str,
            _amount_minor: Option<i64>,
            _reason: Option<&str>,
        ) -> ProcessorEnvelope<RefundData> {
            self.refund_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| ProcessorEnvelope::failure("not scripted"))
        }

        async fn fetch(&self, _transaction_id: &str) -> ProcessorEnvelope<TransactionData> {
            ProcessorEnvelope::failure("not scripted")
        }
    }

    struct Fixture {
        router: Router,
        repo: Arc<InMemoryRepository>,
        processor: Arc<ScriptedProcessor>,
    }

    fn test_config(rate_max: usize) -> Config {
        Config {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            site_url: Url::parse("https://pay.acoruss.com").unwrap(),
            processor: ProcessorConfig {
                secret_key: UPSTREAM_SECRET.to_string(),
                public_key: String::new(),
                base_url: Url::parse("https://api.paystack.co").unwrap(),
                timeout: Duration::from_secs(5),
            },
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: rate_max,
            },
            webhooks: WebhookConfig {
                max_attempts: 3,
                retry_delays: vec![Duration::ZERO, Duration::ZERO],
                timeout: Duration::from_secs(5),
            },
        }
    }

    fn fixture_with(rate_max: usize) -> Fixture {
        let config = Arc::new(test_config(rate_max));
        let repo = Arc::new(InMemoryRepository::new());
        let processor = Arc::new(ScriptedProcessor::default());
        let dispatcher = WebhookDispatcher::new(repo.clone(), config.webhooks.clone());
        let engine = Arc::new(PaymentEngine::new(
            repo.clone(),
            processor.clone(),
            dispatcher,
            &config.site_url,
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let state = AppState {
            config,
            repo: repo.clone(),
            engine,
            limiter,
        };
        Fixture {
            router: routes(state),
            repo,
            processor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(60)
    }

    async fn seed_tenant(fixture: &Fixture, slug: &str) -> Tenant {
        let tenant = Tenant::new(slug, slug.to_string());
        fixture.repo.insert_tenant(tenant.clone()).await.unwrap();
        tenant
    }

    fn request(
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
        }
        match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(
        fixture: &Fixture,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = fixture.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn initiate_body() -> serde_json::Value {
        json!({
            "email": "u@x.com",
            "name": "U",
            "amount": 2000,
            "currency": "KES",
            "service_reference": "o-1",
        })
    }

    fn sign_inbound(payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha512>::new_from_slice(UPSTREAM_SECRET.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    async fn initiate(fixture: &Fixture, tenant: &Tenant) -> String {
        let (status, body) = send(
            fixture,
            request(
                Method::POST,
                "/payments/initiate/",
                Some(&tenant.api_key),
                Some(initiate_body()),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "initiate failed: {body}");
        body["data"]["reference"].as_str().unwrap().to_string()
    }

    // --- Authentication ---

    #[tokio::test]
    async fn test_missing_authorization_header() {
        let fx = fixture();
        let (status, body) =
            send(&fx, request(Method::GET, "/payments/", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            body["error"],
            "Missing or invalid Authorization header. Use: Bearer <api_key>"
        );
    }

    #[tokio::test]
    async fn test_unknown_api_key() {
        let fx = fixture();
        let (status, body) = send(
            &fx,
            request(Method::GET, "/payments/", Some("ak_nope"), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid API key");
    }

    #[tokio::test]
    async fn test_deactivated_tenant_is_rejected() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let (status, _) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&tenant.api_key), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        fx.repo.set_tenant_active("alpha", false).await.unwrap();
        let (status, body) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&tenant.api_key), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid API key");
    }

    #[tokio::test]
    async fn test_regenerated_credentials_reject_old_key() {
        let fx = fixture();
        let mut tenant = seed_tenant(&fx, "alpha").await;
        let old_key = tenant.api_key.clone();
        let (new_key, new_secret) = tenant.regenerate_credentials();
        fx.repo
            .replace_tenant_credentials("alpha", new_key.clone(), new_secret)
            .await
            .unwrap();

        let (status, _) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&old_key), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&new_key), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ip_allowlist() {
        let fx = fixture();
        let mut tenant = Tenant::new("alpha", "Alpha");
        tenant.allowed_ips = vec!["203.0.113.9".to_string()];
        fx.repo.insert_tenant(tenant.clone()).await.unwrap();

        let (status, body) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&tenant.api_key), None),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "IP address not allowed");

        let mut allowed =
            request(Method::GET, "/payments/", Some(&tenant.api_key), None);
        allowed
            .headers_mut()
            .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        let (status, _) = send(&fx, allowed).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_kicks_in() {
        let fx = fixture_with(2);
        let tenant = seed_tenant(&fx, "alpha").await;
        for _ in 0..2 {
            let (status, _) = send(
                &fx,
                request(Method::GET, "/payments/", Some(&tenant.api_key), None),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&tenant.api_key), None),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Rate limit exceeded. Try again later.");
    }

    // --- Initiate ---

    #[tokio::test]
    async fn test_initiate_returns_reference_and_authorization_url() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let (status, body) = send(
            &fx,
            request(
                Method::POST,
                "/payments/initiate/",
                Some(&tenant.api_key),
                Some(initiate_body()),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], true);
        let reference = body["data"]["reference"].as_str().unwrap();
        assert!(regex::Regex::new(r"^acoruss-[0-9a-f]{12}$")
            .unwrap()
            .is_match(reference));
        assert_eq!(body["data"]["authorization_url"], "https://p/abc");
    }

    #[tokio::test]
    async fn test_initiate_validation_failure() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let (status, body) = send(
            &fx,
            request(
                Method::POST,
                "/payments/initiate/",
                Some(&tenant.api_key),
                Some(json!({ "email": "", "amount": -1, "currency": "GBP" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Validation failed");
        assert_eq!(body["details"]["email"], "Required");
        assert!(body["details"]["amount"].is_string());
        assert!(body["details"]["currency"].is_string());
    }

    #[tokio::test]
    async fn test_initiate_invalid_json_body() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/payments/initiate/")
            .header(AUTHORIZATION, format!("Bearer {}", tenant.api_key))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&fx, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid JSON body");
    }

    #[tokio::test]
    async fn test_initiate_upstream_failure_returns_502() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        fx.processor.fail_initialize.store(true, Ordering::SeqCst);
        let (status, body) = send(
            &fx,
            request(
                Method::POST,
                "/payments/initiate/",
                Some(&tenant.api_key),
                Some(initiate_body()),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["status"], false);
        assert_eq!(body["message"], "The processor is down");
    }

    #[tokio::test]
    async fn test_idempotent_initiate_over_http() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let mut body = initiate_body();
        body["idempotency_key"] = json!("abc");

        let mut references = Vec::new();
        for _ in 0..3 {
            let (status, response) = send(
                &fx,
                request(
                    Method::POST,
                    "/payments/initiate/",
                    Some(&tenant.api_key),
                    Some(body.clone()),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            references.push(response["data"]["reference"].as_str().unwrap().to_string());
        }
        assert_eq!(references[0], references[1]);
        assert_eq!(references[1], references[2]);
        assert_eq!(fx.processor.initialize_calls.load(Ordering::SeqCst), 1);
    }

    // --- Tenant isolation ---

    #[tokio::test]
    async fn test_cross_tenant_reads_yield_404_and_empty_list() {
        let fx = fixture();
        let alpha = seed_tenant(&fx, "alpha").await;
        let beta = seed_tenant(&fx, "beta").await;
        let reference = initiate(&fx, &alpha).await;

        let (status, _) = send(
            &fx,
            request(
                Method::GET,
                &format!("/payments/{reference}/"),
                Some(&alpha.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &fx,
            request(
                Method::GET,
                &format!("/payments/{reference}/"),
                Some(&beta.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Payment not found");

        let (status, body) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&beta.api_key), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 0);

        let (_, body) = send(
            &fx,
            request(Method::GET, "/payments/", Some(&alpha.api_key), None),
        )
        .await;
        assert_eq!(body["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_meta() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        for _ in 0..3 {
            initiate(&fx, &tenant).await;
        }

        let (status, body) = send(
            &fx,
            request(
                Method::GET,
                "/payments/?status=pending&per_page=2",
                Some(&tenant.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 3);
        assert_eq!(body["meta"]["pages"], 2);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (_, body) = send(
            &fx,
            request(
                Method::GET,
                "/payments/?status=success",
                Some(&tenant.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(body["meta"]["total"], 0);

        // An unknown status filter is ignored.
        let (_, body) = send(
            &fx,
            request(
                Method::GET,
                "/payments/?status=bogus",
                Some(&tenant.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(body["meta"]["total"], 3);
    }

    // --- Inbound webhook + status ---

    #[tokio::test]
    async fn test_inbound_webhook_signature_rejection() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let reference = initiate(&fx, &tenant).await;

        let payload = json!({
            "event": "charge.success",
            "data": { "reference": reference, "id": 99 }
        })
        .to_string();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/payments/webhook/")
            .header(PROCESSOR_SIGNATURE_HEADER, "deadbeef")
            .body(Body::from(payload))
            .unwrap();
        let (status, body) = send(&fx, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid signature");

        // Nothing changed.
        let stored = fx
            .repo
            .payment_by_reference(&reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, crate::types::PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_inbound_webhook_applies_charge_success() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let reference = initiate(&fx, &tenant).await;

        let payload = json!({
            "event": "charge.success",
            "data": {
                "reference": reference,
                "id": 99,
                "channel": "mobile_money",
                "fees": 3500
            }
        })
        .to_string();
        let signature = sign_inbound(payload.as_bytes());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/payments/webhook/")
            .header(PROCESSOR_SIGNATURE_HEADER, signature)
            .body(Body::from(payload))
            .unwrap();
        let (status, body) = send(&fx, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (_, body) = send(
            &fx,
            request(
                Method::GET,
                &format!("/payments/{reference}/"),
                Some(&tenant.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(body["data"]["status"], "success");
        assert_eq!(body["data"]["channel"], "mobile_money");
        assert_eq!(body["data"]["fees"], "35.00");
        assert_eq!(body["data"]["net_amount"], "1965.00");
    }

    #[tokio::test]
    async fn test_inbound_webhook_acknowledges_unknown_events() {
        let fx = fixture();
        let payload = json!({ "event": "transfer.success", "data": {} }).to_string();
        let signature = sign_inbound(payload.as_bytes());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/payments/webhook/")
            .header(PROCESSOR_SIGNATURE_HEADER, signature)
            .body(Body::from(payload))
            .unwrap();
        let (status, body) = send(&fx, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_inbound_webhook_invalid_json() {
        let fx = fixture();
        let payload = b"{not json".to_vec();
        let signature = sign_inbound(&payload);
        let req = Request::builder()
            .method(Method::POST)
            .uri("/payments/webhook/")
            .header(PROCESSOR_SIGNATURE_HEADER, signature)
            .body(Body::from(payload))
            .unwrap();
        let (status, body) = send(&fx, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid JSON");
    }

    // --- Refund ---

    #[tokio::test]
    async fn test_refund_endpoint_partial_then_not_refundable() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let reference = initiate(&fx, &tenant).await;
        fx.repo
            .complete_success(&reference, "tx99", "card", "35.00".parse().unwrap())
            .await
            .unwrap();

        *fx.processor.refund_response.lock().unwrap() = Some(ProcessorEnvelope {
            status: true,
            message: String::new(),
            data: Some(RefundData {
                id: 7001,
                amount: 50_000,
                status: "pending".to_string(),
            }),
        });
        let (status, body) = send(
            &fx,
            request(
                Method::POST,
                &format!("/payments/{reference}/refund/"),
                Some(&tenant.api_key),
                Some(json!({ "amount": 500, "reason": "duplicate order" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["refund_status"], "partial");
        assert_eq!(body["data"]["refunded_amount"], "500.00");
        assert_eq!(body["data"]["refundable_amount"], "1500.00");

        // Pending payments are not refundable.
        let pending = initiate(&fx, &tenant).await;
        let (status, body) = send(
            &fx,
            request(
                Method::POST,
                &format!("/payments/{pending}/refund/"),
                Some(&tenant.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Payment is not refundable");
    }

    #[tokio::test]
    async fn test_refund_upstream_failure_returns_502() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let reference = initiate(&fx, &tenant).await;
        fx.repo
            .complete_success(&reference, "tx99", "card", "0".parse().unwrap())
            .await
            .unwrap();

        let (status, body) = send(
            &fx,
            request(
                Method::POST,
                &format!("/payments/{reference}/refund/"),
                Some(&tenant.api_key),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["status"], false);
    }

    // --- Verify callback ---

    #[tokio::test]
    async fn test_verify_redirects_to_callback_with_outcome() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let mut body = initiate_body();
        body["callback_url"] = json!("https://svc.example/done");
        let (_, response) = send(
            &fx,
            request(
                Method::POST,
                "/payments/initiate/",
                Some(&tenant.api_key),
                Some(body),
            ),
        )
        .await;
        let reference = response["data"]["reference"].as_str().unwrap().to_string();

        *fx.processor.verify_response.lock().unwrap() = Some(ProcessorEnvelope {
            status: true,
            message: String::new(),
            data: Some(TransactionData {
                id: 99,
                status: "success".to_string(),
                channel: "card".to_string(),
                fees: Some(3500),
                amount: None,
                currency: "KES".to_string(),
                gateway_response: None,
            }),
        });

        let response = fx
            .router
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/payments/verify/?reference={reference}"),
                None,
                None,
            ))
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        let location = response.headers().get(LOCATION).unwrap().to_str().unwrap();
        assert_eq!(
            location,
            format!("https://svc.example/done?reference={reference}&status=success")
        );
    }

    #[tokio::test]
    async fn test_verify_without_callback_redirects_to_pay_page() {
        let fx = fixture();
        let tenant = seed_tenant(&fx, "alpha").await;
        let reference = initiate(&fx, &tenant).await;

        // Upstream reports abandoned; no callback URL on the payment.
        *fx.processor.verify_response.lock().unwrap() = Some(ProcessorEnvelope {
            status: true,
            message: String::new(),
            data: Some(TransactionData {
                id: 99,
                status: "abandoned".to_string(),
                channel: String::new(),
                fees: None,
                amount: None,
                currency: String::new(),
                gateway_response: None,
            }),
        });

        let response = fx
            .router
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/payments/verify/?reference={reference}"),
                None,
                None,
            ))
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        let location = response.headers().get(LOCATION).unwrap().to_str().unwrap();
        assert_eq!(location, "https://pay.acoruss.com/payments/pay/");

        let stored = fx
            .repo
            .payment_by_reference(&reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, crate::types::PaymentStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_verify_rejects_missing_or_unknown_reference() {
        let fx = fixture();
        let (status, body) = send(
            &fx,
            request(Method::GET, "/payments/verify/", None, None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No payment reference provided");

        let (status, body) = send(
            &fx,
            request(
                Method::GET,
                "/payments/verify/?reference=acoruss-000000000000",
                None,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Payment not found");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let fx = fixture();
        let (status, body) = send(&fx, request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
