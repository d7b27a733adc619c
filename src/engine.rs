//! Payment lifecycle engine.
//!
//! The engine owns every mutation of a payment after creation: initiation
//! with idempotency, verification against the upstream processor, refunds,
//! and the application of inbound processor notifications. Handlers never
//! touch the repository's write methods directly.
//!
//! Transitions into a terminal status go through the repository's
//! conditional updates, so the two verification paths (user-redirect
//! callback and inbound webhook) can race freely: exactly one observes the
//! payment in `pending`, and only that one dispatches the tenant webhook.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;
use url::Url;

use crate::credentials;
use crate::dispatcher::WebhookDispatcher;
use crate::model::{Payment, Tenant, from_minor_units, to_minor_units};
use crate::processor::{InboundEvent, InitializeRequest, Processor};
use crate::repository::{PageRequest, PaymentFilter, PaymentPage, RepoError, Repository};
use crate::types::{Currency, PaymentStatus, WebhookEvent};

/// How many times to re-mint a reference that collides on insert. Collisions
/// are vanishingly rare; the loop exists because the unique index is the
/// source of truth.
const REFERENCE_MINT_ATTEMPTS: usize = 5;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Input validation failed; the map is keyed by field name.
    #[error("Validation failed")]
    Validation(BTreeMap<&'static str, String>),
    #[error("Payment not found")]
    NotFound,
    #[error("Payment is not refundable")]
    NotRefundable,
    /// A refund amount outside `(0, refundable_amount]`.
    #[error("{0}")]
    InvalidRefundAmount(String),
    /// The upstream processor rejected the call or was unreachable. The
    /// payment was left untouched.
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Validated initiation input, one-to-one with the API request body.
#[derive(Debug, Clone, Default)]
pub struct InitiateInput {
    pub email: String,
    pub name: String,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub description: String,
    pub service_reference: String,
    pub callback_url: String,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
    pub client_ip: Option<String>,
}

/// Result of an initiation request.
#[derive(Debug)]
pub enum InitiateOutcome {
    /// A new payment was created and the upstream authorization URL stored.
    Created(Payment),
    /// An earlier payment with the same `(tenant, idempotency_key)` already
    /// exists; the upstream was not contacted.
    Existing(Payment),
}

pub struct PaymentEngine {
    repo: Arc<dyn Repository>,
    processor: Arc<dyn Processor>,
    dispatcher: WebhookDispatcher,
    /// Redirect-back target handed to the processor: the gateway's own
    /// verify endpoint, never the tenant's callback.
    verify_callback: Url,
}

impl PaymentEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        processor: Arc<dyn Processor>,
        dispatcher: WebhookDispatcher,
        site_url: &Url,
    ) -> Self {
        let verify_callback = site_url
            .join("/payments/verify/")
            .expect("site URL accepts a path");
        PaymentEngine {
            repo,
            processor,
            dispatcher,
            verify_callback,
        }
    }

    /// Start a new payment for a tenant.
    ///
    /// Validates input, honours the idempotency key, persists the payment
    /// in `pending`, and asks the processor for an authorization URL. On
    /// upstream failure the payment stays pending with no authorization
    /// URL, and an identical retry observes that same state without a
    /// second upstream call.
    #[instrument(skip_all, fields(tenant = %tenant.slug))]
    pub async fn initiate(
        &self,
        tenant: &Tenant,
        input: InitiateInput,
    ) -> Result<InitiateOutcome, EngineError> {
        let (amount, currency) = validate(tenant, &input)?;

        if !input.idempotency_key.is_empty() {
            if let Some(existing) = self
                .repo
                .payment_by_idempotency_key(&tenant.slug, &input.idempotency_key)
                .await?
            {
                return Ok(InitiateOutcome::Existing(existing));
            }
        }

        let callback_url = if input.callback_url.is_empty() {
            tenant.default_callback_url.clone()
        } else {
            input.callback_url.clone()
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("service".to_string(), serde_json::json!(tenant.slug));
        metadata.insert(
            "service_reference".to_string(),
            serde_json::json!(input.service_reference),
        );
        if let serde_json::Value::Object(extra) = input.metadata.clone() {
            metadata.extend(extra);
        }

        let outcome = self
            .insert_fresh(tenant, &input, amount, currency, callback_url, metadata)
            .await?;
        let mut payment = match outcome {
            existing @ InitiateOutcome::Existing(_) => return Ok(existing),
            InitiateOutcome::Created(payment) => payment,
        };

        let result = self
            .processor
            .initialize(&InitializeRequest {
                email: payment.email.clone(),
                amount_minor: payment.amount_in_minor_units(),
                reference: payment.reference.clone(),
                currency: payment.currency.to_string(),
                callback_url: self.verify_callback.to_string(),
                metadata: serde_json::json!({
                    "reference": payment.reference,
                    "service": tenant.slug,
                    "service_reference": payment.service_reference,
                    "description": payment.description,
                }),
            })
            .await;

        let message = result.message.clone();
        match result.data.filter(|_| result.status) {
            Some(data) if !data.authorization_url.is_empty() => {
                self.repo
                    .set_authorization_url(&payment.reference, &data.authorization_url)
                    .await?;
                payment.authorization_url = data.authorization_url;
                tracing::info!(reference = %payment.reference, "Payment initiated");
                Ok(InitiateOutcome::Created(payment))
            }
            _ => {
                tracing::error!(
                    reference = %payment.reference,
                    "Processor initiation failed: {message}"
                );
                Err(EngineError::Upstream(if message.is_empty() {
                    "Could not initiate payment with the processor".to_string()
                } else {
                    message
                }))
            }
        }
    }

    /// Mint a reference and insert the pending payment, retrying mint
    /// collisions. A concurrent insert with the same idempotency key folds
    /// into the idempotent outcome.
    async fn insert_fresh(
        &self,
        tenant: &Tenant,
        input: &InitiateInput,
        amount: Decimal,
        currency: Currency,
        callback_url: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<InitiateOutcome, EngineError> {
        for _ in 0..REFERENCE_MINT_ATTEMPTS {
            let now = Utc::now();
            let payment = Payment {
                reference: credentials::mint_reference().to_string(),
                tenant: Some(tenant.slug.clone()),
                service_reference: input.service_reference.clone(),
                email: input.email.clone(),
                name: input.name.clone(),
                amount,
                currency,
                description: input.description.clone(),
                status: PaymentStatus::Pending,
                channel: String::new(),
                fees: Decimal::ZERO,
                callback_url: callback_url.clone(),
                refund_status: crate::types::RefundStatus::None,
                refunded_amount: Decimal::ZERO,
                processor_transaction_id: String::new(),
                processor_refund_id: String::new(),
                authorization_url: String::new(),
                webhook_delivered: false,
                webhook_delivered_at: None,
                ip_address: input.client_ip.clone(),
                idempotency_key: input.idempotency_key.clone(),
                metadata: serde_json::Value::Object(metadata.clone()),
                created_at: now,
                updated_at: now,
            };
            match self.repo.insert_payment(payment.clone()).await {
                Ok(()) => return Ok(InitiateOutcome::Created(payment)),
                Err(RepoError::DuplicateReference) => continue,
                Err(RepoError::DuplicateIdempotencyKey) => {
                    let existing = self
                        .repo
                        .payment_by_idempotency_key(&tenant.slug, &input.idempotency_key)
                        .await?
                        .ok_or(RepoError::NotFound)?;
                    return Ok(InitiateOutcome::Existing(existing));
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(EngineError::Repo(RepoError::DuplicateReference))
    }

    /// Fetch one payment, scoped to its owning tenant.
    pub async fn payment_status(
        &self,
        tenant: &Tenant,
        reference: &str,
    ) -> Result<Payment, EngineError> {
        self.repo
            .payment_for_tenant(&tenant.slug, reference)
            .await?
            .ok_or(EngineError::NotFound)
    }

    /// List a tenant's payments, newest first.
    pub async fn list_payments(
        &self,
        tenant: &Tenant,
        filter: &PaymentFilter,
        page: PageRequest,
    ) -> Result<PaymentPage, EngineError> {
        Ok(self.repo.list_payments(&tenant.slug, filter, page).await?)
    }

    /// Verify a payment against the processor after the user redirect.
    ///
    /// Safe to call any number of times: the terminal transition applies at
    /// most once, and only the applying call dispatches the tenant webhook.
    /// Returns the payment's state after verification.
    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn verify_by_reference(&self, reference: &str) -> Result<Payment, EngineError> {
        if self.repo.payment_by_reference(reference).await?.is_none() {
            return Err(EngineError::NotFound);
        }

        let result = self.processor.verify(reference).await;
        match result.data.filter(|_| result.status) {
            Some(data) if data.status == "success" => {
                self.apply_success(
                    reference,
                    &data.id.to_string(),
                    &data.channel,
                    data.fees.unwrap_or(0),
                )
                .await?;
            }
            Some(data) if data.status == "abandoned" => {
                if let Some(payment) = self
                    .repo
                    .close_pending(reference, PaymentStatus::Abandoned)
                    .await?
                {
                    tracing::info!(reference = %payment.reference, "Payment abandoned");
                }
            }
            _ => {
                if let Some(payment) = self
                    .repo
                    .close_pending(reference, PaymentStatus::Failed)
                    .await?
                {
                    tracing::info!(reference = %payment.reference, "Payment failed verification");
                }
            }
        }

        self.repo
            .payment_by_reference(reference)
            .await?
            .ok_or(EngineError::NotFound)
    }

    /// Refund a payment, fully (no amount) or partially.
    ///
    /// On upstream failure nothing is mutated. On success the cumulative
    /// refunded amount grows, the refund status is recomputed, and a
    /// `payment.refunded` webhook is dispatched.
    #[instrument(skip_all, fields(tenant = %tenant.slug, reference = %reference))]
    pub async fn refund(
        &self,
        tenant: &Tenant,
        reference: &str,
        amount: Option<Decimal>,
        reason: Option<String>,
    ) -> Result<Payment, EngineError> {
        let payment = self
            .repo
            .payment_for_tenant(&tenant.slug, reference)
            .await?
            .ok_or(EngineError::NotFound)?;
        if !payment.is_refundable() {
            return Err(EngineError::NotRefundable);
        }

        let amount_minor = match amount {
            None => None,
            Some(amount) => {
                if amount <= Decimal::ZERO || amount > payment.refundable_amount() {
                    return Err(EngineError::InvalidRefundAmount(format!(
                        "Refund amount must be between 0.01 and {}",
                        payment.refundable_amount()
                    )));
                }
                Some(to_minor_units(amount))
            }
        };

        let result = self
            .processor
            .refund(reference, amount_minor, reason.as_deref())
            .await;
        let message = result.message.clone();
        match result.data.filter(|_| result.status) {
            Some(data) => {
                let updated = self
                    .repo
                    .add_refund(reference, from_minor_units(data.amount), &data.id.to_string())
                    .await?;
                tracing::info!(
                    reference = %updated.reference,
                    refund_status = %updated.refund_status,
                    "Refund initiated"
                );
                self.notify(updated.clone(), WebhookEvent::PaymentRefunded)
                    .await?;
                Ok(updated)
            }
            None => Err(EngineError::Upstream(if message.is_empty() {
                "Refund failed".to_string()
            } else {
                message
            })),
        }
    }

    /// Apply a verified inbound processor notification.
    ///
    /// Business-logic gaps (unknown reference, replayed event) are logged
    /// and swallowed so the webhook endpoint can acknowledge regardless.
    pub async fn handle_inbound_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::ChargeSuccess(data) => {
                let transaction_id = data.id.map(|id| id.to_string()).unwrap_or_default();
                match self
                    .apply_success(
                        &data.reference,
                        &transaction_id,
                        &data.channel,
                        data.fees.unwrap_or(0),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(EngineError::Repo(RepoError::NotFound)) => {
                        tracing::warn!(
                            reference = %data.reference,
                            "Webhook received for unknown reference"
                        );
                    }
                    Err(error) => {
                        tracing::error!(
                            reference = %data.reference,
                            "Failed to apply charge.success: {error}"
                        );
                    }
                }
            }
            InboundEvent::RefundProcessed(data) => {
                let reference = data.transaction.reference.clone();
                match self
                    .repo
                    .set_refund_total(
                        &reference,
                        from_minor_units(data.amount),
                        &data.id.to_string(),
                    )
                    .await
                {
                    Ok(Some(payment)) => {
                        tracing::info!(reference = %reference, "Refund processed");
                        if let Err(error) = self
                            .notify(payment, WebhookEvent::PaymentRefunded)
                            .await
                        {
                            tracing::error!(
                                reference = %reference,
                                "Failed to dispatch refund webhook: {error}"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(RepoError::NotFound) => {
                        tracing::warn!(
                            reference = %reference,
                            "Refund webhook for unknown reference"
                        );
                    }
                    Err(error) => {
                        tracing::error!(
                            reference = %reference,
                            "Failed to apply refund.processed: {error}"
                        );
                    }
                }
            }
            InboundEvent::Other(event) => {
                tracing::debug!(event = %event, "Ignoring inbound event");
            }
        }
    }

    /// Conditional success transition plus tenant notification. Only the
    /// call that actually flips `pending → success` dispatches.
    async fn apply_success(
        &self,
        reference: &str,
        transaction_id: &str,
        channel: &str,
        fees_minor: i64,
    ) -> Result<(), EngineError> {
        let updated = self
            .repo
            .complete_success(reference, transaction_id, channel, from_minor_units(fees_minor))
            .await?;
        if let Some(payment) = updated {
            tracing::info!(reference = %payment.reference, "Payment marked successful");
            self.notify(payment, WebhookEvent::PaymentSuccess).await?;
        }
        Ok(())
    }

    /// Queue an outbound webhook when the payment belongs to a tenant. The
    /// dispatcher itself skips tenants without a webhook URL.
    async fn notify(&self, payment: Payment, event: WebhookEvent) -> Result<(), EngineError> {
        let Some(slug) = payment.tenant.clone() else {
            return Ok(());
        };
        if let Some(tenant) = self.repo.tenant_by_slug(&slug).await? {
            self.dispatcher.dispatch(tenant, payment, event);
        }
        Ok(())
    }
}

/// Field-keyed validation per the API contract.
fn validate(
    tenant: &Tenant,
    input: &InitiateInput,
) -> Result<(Decimal, Currency), EngineError> {
    let mut errors: BTreeMap<&'static str, String> = BTreeMap::new();

    if input.email.trim().is_empty() {
        errors.insert("email", "Required".to_string());
    }

    let amount = match input.amount {
        Some(amount) if amount > Decimal::ZERO && amount.normalize().scale() <= 2 => amount,
        _ => {
            errors.insert(
                "amount",
                "Must be a positive number with at most 2 decimal places".to_string(),
            );
            Decimal::ZERO
        }
    };

    let currency = match Currency::from_str(&input.currency) {
        Ok(currency) => {
            if !tenant.allowed_currencies.is_empty()
                && !tenant.allowed_currencies.contains(&currency)
            {
                errors.insert(
                    "currency",
                    format!(
                        "Not allowed for this service. Allowed: {}",
                        tenant
                            .allowed_currencies
                            .iter()
                            .map(|c| c.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                );
            }
            currency
        }
        Err(_) => {
            errors.insert(
                "currency",
                format!("Must be one of: {}", Currency::supported_list()),
            );
            Currency::KES
        }
    };

    if errors.is_empty() {
        Ok((amount, currency))
    } else {
        Err(EngineError::Validation(errors))
    }
}
