//! Typed client for the upstream card/mobile-money processor.
//!
//! The wire protocol is Paystack's: every endpoint answers an envelope of
//! `{"status": bool, "message": str, "data": {...}}`. Non-2xx responses are
//! not errors at this layer; their body is surfaced in the same envelope
//! shape so the payment engine can decide policy. Network and parse
//! failures fold into a failure envelope with a generic message — this
//! client never panics and never throws.
//!
//! Inbound server-to-server notifications share the processor's data
//! shapes, so their DTOs live here too.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::ProcessorConfig;

/// The processor's uniform response envelope.
///
/// `status: false` means the processor rejected the call or the call never
/// completed; `message` is then human-readable. `data` is only trusted when
/// `status` is true.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ProcessorEnvelope<T> {
    pub status: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> ProcessorEnvelope<T> {
    pub fn failure(message: impl Into<String>) -> Self {
        ProcessorEnvelope {
            status: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Payload for `POST /transaction/initialize`.
#[derive(Debug, Clone)]
pub struct InitializeRequest {
    pub email: String,
    pub amount_minor: i64,
    pub reference: String,
    pub currency: String,
    /// Redirect-back target; always the gateway's own verify endpoint.
    pub callback_url: String,
    pub metadata: serde_json::Value,
}

/// Fields of a successful `transaction/initialize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeData {
    pub authorization_url: String,
    #[serde(default)]
    pub access_code: String,
    pub reference: String,
}

/// Fields of `transaction/verify` and `transaction/{id}` responses. Unknown
/// fields are tolerated; anything the engine needs to act on is typed.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionData {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub channel: String,
    /// Processor fees in minor units.
    #[serde(default)]
    pub fees: Option<i64>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub gateway_response: Option<String>,
}

/// Fields of a successful `POST /refund` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundData {
    pub id: i64,
    /// Refunded amount in minor units.
    pub amount: i64,
    #[serde(default)]
    pub status: String,
}

/// Narrow façade over the four processor endpoints the gateway uses.
///
/// The engine programs against this trait; the HTTP implementation below is
/// swapped for a scripted double in tests.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn initialize(&self, request: &InitializeRequest) -> ProcessorEnvelope<InitializeData>;
    async fn verify(&self, reference: &str) -> ProcessorEnvelope<TransactionData>;
    async fn refund(
        &self,
        reference: &str,
        amount_minor: Option<i64>,
        reason: Option<&str>,
    ) -> ProcessorEnvelope<RefundData>;
    async fn fetch(&self, transaction_id: &str) -> ProcessorEnvelope<TransactionData>;
}

/// HTTP client for a Paystack-compatible processor.
pub struct PaystackClient {
    http: reqwest::Client,
    base_url: Url,
    secret_key: String,
}

impl PaystackClient {
    pub fn new(config: &ProcessorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        PaystackClient {
            http,
            base_url: config.base_url.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProcessorEnvelope<T> {
        if self.secret_key.is_empty() {
            tracing::warn!("Processor secret key not configured");
            return ProcessorEnvelope::failure("Payment processor not configured");
        }

        let url = self.endpoint(path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.secret_key);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%method, %url, "Processor request failed: {error}");
                return ProcessorEnvelope::failure("Payment processor unreachable");
            }
        };

        let http_status = response.status();
        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(%method, %url, "Failed to read processor response: {error}");
                return ProcessorEnvelope::failure("Payment processor unreachable");
            }
        };

        // Error bodies usually carry the same envelope; surface them as-is
        // and only synthesise a message when the body is not an envelope.
        match serde_json::from_str::<ProcessorEnvelope<T>>(&raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                let snippet: String = raw.chars().take(200).collect();
                tracing::warn!(
                    %method, %url, http_status = %http_status,
                    "Unparseable processor response: {error}"
                );
                ProcessorEnvelope::failure(format!(
                    "Processor error {}: {}",
                    http_status.as_u16(),
                    snippet
                ))
            }
        }
    }
}

#[async_trait]
impl Processor for PaystackClient {
    async fn initialize(&self, request: &InitializeRequest) -> ProcessorEnvelope<InitializeData> {
        let mut payload = serde_json::json!({
            "email": request.email,
            "amount": request.amount_minor,
            "reference": request.reference,
            "currency": request.currency,
        });
        if !request.callback_url.is_empty() {
            payload["callback_url"] = serde_json::json!(request.callback_url);
        }
        if !request.metadata.is_null() {
            payload["metadata"] = request.metadata.clone();
        }
        self.request(Method::POST, "/transaction/initialize", Some(payload))
            .await
    }

    async fn verify(&self, reference: &str) -> ProcessorEnvelope<TransactionData> {
        self.request(
            Method::GET,
            &format!("/transaction/verify/{}", reference),
            None,
        )
        .await
    }

    async fn refund(
        &self,
        reference: &str,
        amount_minor: Option<i64>,
        reason: Option<&str>,
    ) -> ProcessorEnvelope<RefundData> {
        let mut payload = serde_json::json!({ "transaction": reference });
        if let Some(amount) = amount_minor {
            payload["amount"] = serde_json::json!(amount);
        }
        if let Some(reason) = reason.filter(|r| !r.is_empty()) {
            payload["customer_note"] = serde_json::json!(reason);
        }
        self.request(Method::POST, "/refund", Some(payload)).await
    }

    async fn fetch(&self, transaction_id: &str) -> ProcessorEnvelope<TransactionData> {
        self.request(
            Method::GET,
            &format!("/transaction/{}", transaction_id),
            None,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Inbound server-to-server notifications
// ---------------------------------------------------------------------------

/// Raw inbound notification envelope, parsed after signature verification.
#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Payload of a `charge.success` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeSuccessData {
    pub reference: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub channel: String,
    /// Processor fees in minor units.
    #[serde(default)]
    pub fees: Option<i64>,
}

/// Payload of a `refund.processed` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundProcessedData {
    pub id: i64,
    /// Cumulative refunded amount in minor units.
    pub amount: i64,
    pub transaction: RefundedTransaction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundedTransaction {
    pub reference: String,
}

/// A parsed inbound notification. Events the gateway does not act on are
/// preserved by name so the handler can acknowledge them.
#[derive(Debug)]
pub enum InboundEvent {
    ChargeSuccess(ChargeSuccessData),
    RefundProcessed(RefundProcessedData),
    Other(String),
}

impl InboundEvent {
    /// Parse a verified notification body. Fails when the body is not JSON
    /// or a handled event's data is missing required fields.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: InboundEnvelope = serde_json::from_slice(payload)?;
        match envelope.event.as_str() {
            "charge.success" => {
                let data: ChargeSuccessData = serde_json::from_value(envelope.data)?;
                Ok(InboundEvent::ChargeSuccess(data))
            }
            "refund.processed" => {
                let data: RefundProcessedData = serde_json::from_value(envelope.data)?;
                Ok(InboundEvent::RefundProcessed(data))
            }
            _ => Ok(InboundEvent::Other(envelope.event)),
        }
    }
}
