//! Outbound webhook dispatcher.
//!
//! Delivers signed event notifications to a tenant's configured webhook URL
//! with bounded retries. Every attempt is recorded as a
//! [`WebhookDeliveryLog`] row before it runs and patched with the outcome
//! afterwards; the log is the operator's source of truth. Delivery is
//! fire-and-forget for the request that produced the event: the spawned
//! task runs its full retry budget even after that request has completed,
//! and the server drains in-flight deliveries on shutdown.

use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::task::TaskTracker;

use crate::config::WebhookConfig;
use crate::model::{Payment, Tenant, WebhookDeliveryLog};
use crate::repository::{Repository, WebhookLogPatch};
use crate::signature::sign_sha256_hex;
use crate::types::WebhookEvent;

pub const SIGNATURE_HEADER: &str = "X-Acoruss-Signature";
pub const EVENT_HEADER: &str = "X-Acoruss-Event";
pub const USER_AGENT_VALUE: &str = "Acoruss-Payments/1.0";

const MAX_RESPONSE_BODY_CHARS: usize = 2_000;
const MAX_ERROR_CHARS: usize = 500;

/// Notification body POSTed to the tenant. Monetary values are serialised
/// as decimal strings to preserve precision.
#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub data: WebhookPaymentData,
}

#[derive(Debug, Serialize)]
pub struct WebhookPaymentData {
    pub reference: String,
    pub service_reference: String,
    pub email: String,
    pub name: String,
    pub amount: String,
    pub currency: crate::types::Currency,
    pub status: crate::types::PaymentStatus,
    pub channel: String,
    pub fees: String,
    pub description: String,
    pub refund_status: crate::types::RefundStatus,
    pub refunded_amount: String,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

impl WebhookPayload {
    pub fn new(event: WebhookEvent, payment: &Payment) -> Self {
        WebhookPayload {
            event,
            data: WebhookPaymentData {
                reference: payment.reference.clone(),
                service_reference: payment.service_reference.clone(),
                email: payment.email.clone(),
                name: payment.name.clone(),
                amount: payment.amount.to_string(),
                currency: payment.currency,
                status: payment.status,
                channel: payment.channel.clone(),
                fees: payment.fees.to_string(),
                description: payment.description.clone(),
                refund_status: payment.refund_status,
                refunded_amount: payment.refunded_amount.to_string(),
                metadata: payment.metadata.clone(),
                created_at: payment.created_at.to_rfc3339(),
            },
        }
    }
}

/// Cheaply cloneable handle; all clones share one HTTP client and task
/// tracker.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    repo: Arc<dyn Repository>,
    http: reqwest::Client,
    config: WebhookConfig,
    tracker: TaskTracker,
}

impl WebhookDispatcher {
    pub fn new(repo: Arc<dyn Repository>, config: WebhookConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        WebhookDispatcher {
            inner: Arc::new(DispatcherInner {
                repo,
                http,
                config,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Queue a delivery without waiting for it. The caller's request can
    /// complete while the retry sequence is still running.
    pub fn dispatch(&self, tenant: Tenant, payment: Payment, event: WebhookEvent) {
        let dispatcher = self.clone();
        self.inner.tracker.spawn(async move {
            dispatcher.deliver(&tenant, &payment, event).await;
        });
    }

    /// Wait for all in-flight deliveries to finish their retry budgets.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Run one full delivery sequence. Returns whether any attempt landed a
    /// 2xx response.
    pub async fn deliver(&self, tenant: &Tenant, payment: &Payment, event: WebhookEvent) -> bool {
        if tenant.webhook_url.is_empty() {
            tracing::info!(tenant = %tenant.slug, "No webhook URL configured, skipping dispatch");
            return false;
        }

        let payload = WebhookPayload::new(event, payment);
        let payload_bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(reference = %payment.reference, "Failed to encode webhook payload: {error}");
                return false;
            }
        };
        let request_body =
            serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null);
        let signature = sign_sha256_hex(&payload_bytes, &tenant.api_secret);

        let headers: BTreeMap<String, String> = BTreeMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            (SIGNATURE_HEADER.to_string(), signature.clone()),
            (EVENT_HEADER.to_string(), event.as_str().to_string()),
            ("User-Agent".to_string(), USER_AGENT_VALUE.to_string()),
        ]);

        for attempt in 1..=self.inner.config.max_attempts {
            let log_id = self
                .inner
                .repo
                .append_webhook_log(WebhookDeliveryLog {
                    id: 0,
                    tenant: tenant.slug.clone(),
                    payment_reference: payment.reference.clone(),
                    url: tenant.webhook_url.clone(),
                    event,
                    request_headers: headers.clone(),
                    request_body: request_body.clone(),
                    response_status: None,
                    response_body: String::new(),
                    attempt,
                    success: false,
                    error_message: String::new(),
                    duration_ms: None,
                    created_at: Utc::now(),
                })
                .await;
            let log_id = match log_id {
                Ok(id) => Some(id),
                Err(error) => {
                    tracing::error!(reference = %payment.reference, "Failed to record webhook attempt: {error}");
                    None
                }
            };

            let started = Instant::now();
            let result = self
                .inner
                .http
                .post(&tenant.webhook_url)
                .header(CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, signature.as_str())
                .header(EVENT_HEADER, event.as_str())
                .header(USER_AGENT, USER_AGENT_VALUE)
                .body(payload_bytes.clone())
                .send()
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    let status = response.status();
                    let body: String = response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(MAX_RESPONSE_BODY_CHARS)
                        .collect();
                    let success = status.is_success();
                    self.patch_log(
                        log_id,
                        WebhookLogPatch {
                            response_status: Some(status.as_u16()),
                            response_body: Some(body),
                            success: Some(success),
                            duration_ms: Some(duration_ms),
                            ..Default::default()
                        },
                    )
                    .await;

                    if success {
                        if let Err(error) = self
                            .inner
                            .repo
                            .mark_webhook_delivered(&payment.reference, Utc::now())
                            .await
                        {
                            tracing::warn!(reference = %payment.reference, "Failed to mark webhook delivered: {error}");
                        }
                        tracing::info!(
                            reference = %payment.reference,
                            tenant = %tenant.slug,
                            attempt,
                            "Webhook delivered"
                        );
                        return true;
                    }
                    tracing::warn!(
                        reference = %payment.reference,
                        attempt,
                        status = %status,
                        "Webhook delivery failed with non-success status"
                    );
                }
                Err(error) => {
                    let message: String =
                        error.to_string().chars().take(MAX_ERROR_CHARS).collect();
                    self.patch_log(
                        log_id,
                        WebhookLogPatch {
                            error_message: Some(message),
                            duration_ms: Some(duration_ms),
                            ..Default::default()
                        },
                    )
                    .await;
                    tracing::warn!(
                        reference = %payment.reference,
                        attempt,
                        "Webhook delivery error: {error}"
                    );
                }
            }

            // Back off between attempts only.
            if attempt < self.inner.config.max_attempts {
                let delay = self
                    .inner
                    .config
                    .retry_delays
                    .get(attempt as usize - 1)
                    .copied()
                    .unwrap_or_default();
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(
            reference = %payment.reference,
            tenant = %tenant.slug,
            attempts = self.inner.config.max_attempts,
            "Webhook delivery exhausted its retry budget"
        );
        false
    }

    async fn patch_log(&self, log_id: Option<u64>, patch: WebhookLogPatch) {
        if let Some(id) = log_id {
            if let Err(error) = self.inner.repo.update_webhook_log(id, patch).await {
                tracing::warn!("Failed to update webhook log {id}: {error}");
            }
        }
    }
}
