//! Persistence port for tenants, payments, and webhook delivery logs.
//!
//! The trait is the only thing the rest of the gateway knows about storage.
//! Implementations must uphold the schema's unique indexes (payment
//! reference, tenant API key and slug, `(tenant, idempotency_key)` when the
//! key is non-empty) and make the pending→terminal payment transitions
//! conditional, so the two racing verification paths cannot both observe
//! `pending`.
//!
//! The in-memory adapter below is the reference implementation used by the
//! server binary and the test suite. A persistent adapter swaps in behind
//! the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Mutex;

use crate::model::{Payment, Tenant, WebhookDeliveryLog, refund_status_for};
use crate::types::PaymentStatus;

/// Storage-level failures. Conflict variants map to unique-index violations.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RepoError {
    #[error("duplicate payment reference")]
    DuplicateReference,
    #[error("duplicate idempotency key for tenant")]
    DuplicateIdempotencyKey,
    #[error("duplicate tenant slug or API key")]
    DuplicateTenant,
    #[error("row not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Filters for the tenant-scoped payment listing.
#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub status: Option<PaymentStatus>,
    pub email: Option<String>,
}

/// Page selection, already clamped to the API's bounds.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u64,
    pub per_page: u64,
}

impl PageRequest {
    pub const DEFAULT_PER_PAGE: u64 = 20;
    pub const MAX_PER_PAGE: u64 = 100;

    /// Clamp raw query values: `page >= 1`, `per_page` in `[1, 100]`.
    pub fn clamped(page: Option<i64>, per_page: Option<i64>) -> Self {
        let page = page.unwrap_or(1).max(1) as u64;
        let per_page = per_page
            .unwrap_or(Self::DEFAULT_PER_PAGE as i64)
            .clamp(1, Self::MAX_PER_PAGE as i64) as u64;
        PageRequest { page, per_page }
    }
}

/// One page of a tenant's payments, newest first.
#[derive(Debug, Clone)]
pub struct PaymentPage {
    pub data: Vec<Payment>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub pages: u64,
}

/// Post-attempt updates to a webhook delivery log row.
#[derive(Debug, Clone, Default)]
pub struct WebhookLogPatch {
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // Tenants.
    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), RepoError>;
    async fn tenant_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>, RepoError>;
    async fn tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, RepoError>;
    /// Replace a tenant's key and secret together. The old key stops
    /// resolving the instant this returns.
    async fn replace_tenant_credentials(
        &self,
        slug: &str,
        api_key: String,
        api_secret: String,
    ) -> Result<(), RepoError>;
    async fn set_tenant_active(&self, slug: &str, is_active: bool) -> Result<(), RepoError>;

    // Payments.
    async fn insert_payment(&self, payment: Payment) -> Result<(), RepoError>;
    async fn payment_by_reference(&self, reference: &str) -> Result<Option<Payment>, RepoError>;
    /// Tenant-scoped lookup; a foreign tenant's payment is indistinguishable
    /// from an absent one.
    async fn payment_for_tenant(
        &self,
        tenant: &str,
        reference: &str,
    ) -> Result<Option<Payment>, RepoError>;
    async fn payment_by_idempotency_key(
        &self,
        tenant: &str,
        key: &str,
    ) -> Result<Option<Payment>, RepoError>;
    async fn list_payments(
        &self,
        tenant: &str,
        filter: &PaymentFilter,
        page: PageRequest,
    ) -> Result<PaymentPage, RepoError>;
    async fn set_authorization_url(&self, reference: &str, url: &str) -> Result<(), RepoError>;
    /// Conditional `pending → success` transition. Returns the updated row,
    /// or `None` when the payment was no longer pending (the caller then
    /// performs no side effects).
    async fn complete_success(
        &self,
        reference: &str,
        transaction_id: &str,
        channel: &str,
        fees: Decimal,
    ) -> Result<Option<Payment>, RepoError>;
    /// Conditional `pending → failed|abandoned` transition.
    async fn close_pending(
        &self,
        reference: &str,
        status: PaymentStatus,
    ) -> Result<Option<Payment>, RepoError>;
    /// Add to the cumulative refunded amount and recompute the refund
    /// status (API-initiated refunds).
    async fn add_refund(
        &self,
        reference: &str,
        refunded: Decimal,
        refund_id: &str,
    ) -> Result<Payment, RepoError>;
    /// Set the cumulative refunded amount to an absolute value reported by
    /// the processor (`refund.processed`). Returns `None` when nothing
    /// changed, so replayed events dispatch nothing.
    async fn set_refund_total(
        &self,
        reference: &str,
        refunded: Decimal,
        refund_id: &str,
    ) -> Result<Option<Payment>, RepoError>;
    async fn mark_webhook_delivered(
        &self,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError>;

    // Webhook delivery logs (append-only).
    async fn append_webhook_log(&self, log: WebhookDeliveryLog) -> Result<u64, RepoError>;
    async fn update_webhook_log(&self, id: u64, patch: WebhookLogPatch) -> Result<(), RepoError>;
    async fn webhook_logs_for_payment(
        &self,
        reference: &str,
    ) -> Result<Vec<WebhookDeliveryLog>, RepoError>;
}

/// In-memory adapter. A single mutex guards all tables; no lock is held
/// across an await point, and every conditional transition happens inside
/// one critical section.
#[derive(Default)]
pub struct InMemoryRepository {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tenants: Vec<Tenant>,
    payments: Vec<Payment>,
    logs: Vec<WebhookDeliveryLog>,
    next_log_id: u64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("repository mutex poisoned")
    }
}

impl Inner {
    fn payment_mut(&mut self, reference: &str) -> Result<&mut Payment, RepoError> {
        self.payments
            .iter_mut()
            .find(|p| p.reference == reference)
            .ok_or(RepoError::NotFound)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), RepoError> {
        let mut inner = self.lock();
        if inner
            .tenants
            .iter()
            .any(|t| t.slug == tenant.slug || t.api_key == tenant.api_key)
        {
            return Err(RepoError::DuplicateTenant);
        }
        inner.tenants.push(tenant);
        Ok(())
    }

    async fn tenant_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>, RepoError> {
        let inner = self.lock();
        Ok(inner.tenants.iter().find(|t| t.api_key == api_key).cloned())
    }

    async fn tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, RepoError> {
        let inner = self.lock();
        Ok(inner.tenants.iter().find(|t| t.slug == slug).cloned())
    }

    async fn replace_tenant_credentials(
        &self,
        slug: &str,
        api_key: String,
        api_secret: String,
    ) -> Result<(), RepoError> {
        let mut inner = self.lock();
        if inner
            .tenants
            .iter()
            .any(|t| t.slug != slug && t.api_key == api_key)
        {
            return Err(RepoError::DuplicateTenant);
        }
        let tenant = inner
            .tenants
            .iter_mut()
            .find(|t| t.slug == slug)
            .ok_or(RepoError::NotFound)?;
        tenant.api_key = api_key;
        tenant.api_secret = api_secret;
        tenant.updated_at = Utc::now();
        Ok(())
    }

    async fn set_tenant_active(&self, slug: &str, is_active: bool) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let tenant = inner
            .tenants
            .iter_mut()
            .find(|t| t.slug == slug)
            .ok_or(RepoError::NotFound)?;
        tenant.is_active = is_active;
        tenant.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_payment(&self, payment: Payment) -> Result<(), RepoError> {
        let mut inner = self.lock();
        if inner
            .payments
            .iter()
            .any(|p| p.reference == payment.reference)
        {
            return Err(RepoError::DuplicateReference);
        }
        if !payment.idempotency_key.is_empty()
            && inner.payments.iter().any(|p| {
                p.tenant == payment.tenant && p.idempotency_key == payment.idempotency_key
            })
        {
            return Err(RepoError::DuplicateIdempotencyKey);
        }
        inner.payments.push(payment);
        Ok(())
    }

    async fn payment_by_reference(&self, reference: &str) -> Result<Option<Payment>, RepoError> {
        let inner = self.lock();
        Ok(inner
            .payments
            .iter()
            .find(|p| p.reference == reference)
            .cloned())
    }

    async fn payment_for_tenant(
        &self,
        tenant: &str,
        reference: &str,
    ) -> Result<Option<Payment>, RepoError> {
        let inner = self.lock();
        Ok(inner
            .payments
            .iter()
            .find(|p| p.reference == reference && p.tenant.as_deref() == Some(tenant))
            .cloned())
    }

    async fn payment_by_idempotency_key(
        &self,
        tenant: &str,
        key: &str,
    ) -> Result<Option<Payment>, RepoError> {
        let inner = self.lock();
        Ok(inner
            .payments
            .iter()
            .find(|p| p.tenant.as_deref() == Some(tenant) && p.idempotency_key == key)
            .cloned())
    }

    async fn list_payments(
        &self,
        tenant: &str,
        filter: &PaymentFilter,
        page: PageRequest,
    ) -> Result<PaymentPage, RepoError> {
        let inner = self.lock();
        // Insertion order is creation order; newest first.
        let matching: Vec<&Payment> = inner
            .payments
            .iter()
            .rev()
            .filter(|p| p.tenant.as_deref() == Some(tenant))
            .filter(|p| filter.status.is_none_or(|s| p.status == s))
            .filter(|p| filter.email.as_deref().is_none_or(|e| p.email == e))
            .collect();
        let total = matching.len() as u64;
        let offset = ((page.page - 1) * page.per_page) as usize;
        let data = matching
            .into_iter()
            .skip(offset)
            .take(page.per_page as usize)
            .cloned()
            .collect();
        Ok(PaymentPage {
            data,
            total,
            page: page.page,
            per_page: page.per_page,
            pages: total.div_ceil(page.per_page).max(1),
        })
    }

    async fn set_authorization_url(&self, reference: &str, url: &str) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let payment = inner.payment_mut(reference)?;
        payment.authorization_url = url.to_string();
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_success(
        &self,
        reference: &str,
        transaction_id: &str,
        channel: &str,
        fees: Decimal,
    ) -> Result<Option<Payment>, RepoError> {
        let mut inner = self.lock();
        let payment = inner.payment_mut(reference)?;
        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }
        payment.status = PaymentStatus::Success;
        payment.processor_transaction_id = transaction_id.to_string();
        payment.channel = channel.to_string();
        payment.fees = fees;
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn close_pending(
        &self,
        reference: &str,
        status: PaymentStatus,
    ) -> Result<Option<Payment>, RepoError> {
        debug_assert!(matches!(
            status,
            PaymentStatus::Failed | PaymentStatus::Abandoned
        ));
        let mut inner = self.lock();
        let payment = inner.payment_mut(reference)?;
        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }
        payment.status = status;
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn add_refund(
        &self,
        reference: &str,
        refunded: Decimal,
        refund_id: &str,
    ) -> Result<Payment, RepoError> {
        let mut inner = self.lock();
        let payment = inner.payment_mut(reference)?;
        payment.refunded_amount += refunded;
        payment.refund_status = refund_status_for(payment.amount, payment.refunded_amount);
        payment.processor_refund_id = refund_id.to_string();
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn set_refund_total(
        &self,
        reference: &str,
        refunded: Decimal,
        refund_id: &str,
    ) -> Result<Option<Payment>, RepoError> {
        let mut inner = self.lock();
        let payment = inner.payment_mut(reference)?;
        if payment.refunded_amount == refunded && payment.processor_refund_id == refund_id {
            return Ok(None);
        }
        payment.refunded_amount = refunded;
        payment.refund_status = refund_status_for(payment.amount, payment.refunded_amount);
        payment.processor_refund_id = refund_id.to_string();
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn mark_webhook_delivered(
        &self,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let payment = inner.payment_mut(reference)?;
        payment.webhook_delivered = true;
        payment.webhook_delivered_at = Some(at);
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn append_webhook_log(&self, mut log: WebhookDeliveryLog) -> Result<u64, RepoError> {
        let mut inner = self.lock();
        inner.next_log_id += 1;
        log.id = inner.next_log_id;
        let id = log.id;
        inner.logs.push(log);
        Ok(id)
    }

    async fn update_webhook_log(&self, id: u64, patch: WebhookLogPatch) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let log = inner
            .logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(RepoError::NotFound)?;
        if let Some(status) = patch.response_status {
            log.response_status = Some(status);
        }
        if let Some(body) = patch.response_body {
            log.response_body = body;
        }
        if let Some(success) = patch.success {
            log.success = success;
        }
        if let Some(error) = patch.error_message {
            log.error_message = error;
        }
        if let Some(duration) = patch.duration_ms {
            log.duration_ms = Some(duration);
        }
        Ok(())
    }

    async fn webhook_logs_for_payment(
        &self,
        reference: &str,
    ) -> Result<Vec<WebhookDeliveryLog>, RepoError> {
        let inner = self.lock();
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.payment_reference == reference)
            .cloned()
            .collect())
    }
}
