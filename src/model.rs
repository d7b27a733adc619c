//! Persistent entities: tenants, payments, webhook delivery logs.
//!
//! These structs mirror the logical schema in the repository layer. All
//! mutation of a payment after creation goes through [`crate::repository`]
//! so the status transitions stay conditional; the methods here are pure
//! derivations (refundability, minor units, net amount).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::credentials;
use crate::types::{Currency, PaymentStatus, RefundStatus, WebhookEvent};

/// Convert a major-unit amount to the integer minor units the upstream
/// processor deals in: `round(amount * 100)`.
pub fn to_minor_units(amount: Decimal) -> i64 {
    (amount * Decimal::new(100, 0))
        .round()
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Convert minor units reported by the upstream processor back to a
/// two-decimal major-unit amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// A registered external service that collects money through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Stable opaque identifier; never changes after onboarding.
    pub slug: String,
    pub name: String,
    /// Bearer credential, `ak_` + 48 hex chars. Unique across tenants.
    pub api_key: String,
    /// Signing secret for outbound webhooks, `sk_` + 64 hex chars. Never
    /// accepted from callers and never sent upstream.
    pub api_secret: String,
    /// Where outbound webhooks go. Empty means the tenant opted out.
    pub webhook_url: String,
    /// Fallback user-redirect target when an initiate request names none.
    pub default_callback_url: String,
    pub contact_email: String,
    pub is_active: bool,
    /// Restriction on collection currencies. Empty means all supported.
    pub allowed_currencies: Vec<Currency>,
    /// Client IPs allowed to call the API. Empty means unrestricted.
    pub allowed_ips: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Onboard a new tenant with freshly minted credentials.
    pub fn new(slug: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Tenant {
            slug: slug.into(),
            name: name.into(),
            api_key: credentials::mint_api_key(),
            api_secret: credentials::mint_api_secret(),
            webhook_url: String::new(),
            default_callback_url: String::new(),
            contact_email: String::new(),
            is_active: true,
            allowed_currencies: Vec::new(),
            allowed_ips: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Mint a replacement key/secret pair. Both rotate together; persisting
    /// the result atomically invalidates the previous key.
    pub fn regenerate_credentials(&mut self) -> (String, String) {
        self.api_key = credentials::mint_api_key();
        self.api_secret = credentials::mint_api_secret();
        self.updated_at = Utc::now();
        (self.api_key.clone(), self.api_secret.clone())
    }
}

/// One attempt to collect a specific amount from one customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Gateway-assigned, globally unique.
    pub reference: String,
    /// Owning tenant's slug. Absent for direct payments collected through
    /// the operator's own page. Never changes after creation.
    pub tenant: Option<String>,
    /// The tenant's own order id, stored verbatim and echoed back.
    pub service_reference: String,
    pub email: String,
    pub name: String,
    /// Major-unit amount, two fractional digits.
    pub amount: Decimal,
    pub currency: Currency,
    pub description: String,
    pub status: PaymentStatus,
    /// Channel reported by the upstream (`card`, `mobile_money`, ...).
    pub channel: String,
    /// Processor fees in major units, captured on verification.
    pub fees: Decimal,
    /// Where the user is redirected after the gateway's own verify step.
    pub callback_url: String,
    pub refund_status: RefundStatus,
    pub refunded_amount: Decimal,
    pub processor_transaction_id: String,
    pub processor_refund_id: String,
    pub authorization_url: String,
    pub webhook_delivered: bool,
    pub webhook_delivered_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    /// Tenant-scoped idempotency key; empty when the caller sent none.
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Amount in the smallest currency unit, as the upstream API expects.
    pub fn amount_in_minor_units(&self) -> i64 {
        to_minor_units(self.amount)
    }

    pub fn is_successful(&self) -> bool {
        self.status == PaymentStatus::Success
    }

    /// Amount after processor fees.
    pub fn net_amount(&self) -> Decimal {
        self.amount - self.fees
    }

    /// Maximum amount that can still be refunded.
    pub fn refundable_amount(&self) -> Decimal {
        self.amount - self.refunded_amount
    }

    /// Whether this payment can be (further) refunded.
    pub fn is_refundable(&self) -> bool {
        self.is_successful()
            && matches!(self.refund_status, RefundStatus::None | RefundStatus::Partial)
            && self.refundable_amount() > Decimal::ZERO
    }
}

/// Recompute a payment's refund status from its cumulative refunded amount.
pub fn refund_status_for(amount: Decimal, refunded: Decimal) -> RefundStatus {
    if refunded >= amount {
        RefundStatus::Full
    } else if refunded > Decimal::ZERO {
        RefundStatus::Partial
    } else {
        RefundStatus::None
    }
}

/// Audit record of one outbound webhook delivery attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryLog {
    pub id: u64,
    pub tenant: String,
    pub payment_reference: String,
    pub url: String,
    pub event: WebhookEvent,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: serde_json::Value,
    pub response_status: Option<u16>,
    /// Response body truncated to 2 000 characters.
    pub response_body: String,
    /// 1-based attempt number within one delivery sequence.
    pub attempt: u32,
    pub success: bool,
    /// Transport error message, truncated to 500 characters.
    pub error_message: String,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn payment(amount: &str) -> Payment {
        let now = Utc::now();
        Payment {
            reference: "acoruss-0123456789ab".to_string(),
            tenant: None,
            service_reference: String::new(),
            email: "u@x.com".to_string(),
            name: String::new(),
            amount: dec(amount),
            currency: Currency::KES,
            description: String::new(),
            status: PaymentStatus::Pending,
            channel: String::new(),
            fees: Decimal::ZERO,
            callback_url: String::new(),
            refund_status: RefundStatus::None,
            refunded_amount: Decimal::ZERO,
            processor_transaction_id: String::new(),
            processor_refund_id: String::new(),
            authorization_url: String::new(),
            webhook_delivered: false,
            webhook_delivered_at: None,
            ip_address: None,
            idempotency_key: String::new(),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_minor_units_rounding() {
        assert_eq!(to_minor_units(dec("2000")), 200_000);
        assert_eq!(to_minor_units(dec("10.55")), 1055);
        assert_eq!(to_minor_units(dec("0.01")), 1);
        assert_eq!(from_minor_units(3500), dec("35.00"));
    }

    #[test]
    fn test_net_amount() {
        let mut p = payment("2000.00");
        p.fees = dec("35.00");
        assert_eq!(p.net_amount(), dec("1965.00"));
    }

    #[test]
    fn test_pending_payment_is_not_refundable() {
        let p = payment("100.00");
        assert!(!p.is_refundable());
    }

    #[test]
    fn test_refundability_follows_refund_progress() {
        let mut p = payment("2000.00");
        p.status = PaymentStatus::Success;
        assert!(p.is_refundable());

        p.refunded_amount = dec("500.00");
        p.refund_status = RefundStatus::Partial;
        assert!(p.is_refundable());
        assert_eq!(p.refundable_amount(), dec("1500.00"));

        p.refunded_amount = dec("2000.00");
        p.refund_status = RefundStatus::Full;
        assert!(!p.is_refundable());
    }

    #[test]
    fn test_failed_refund_blocks_further_refunds() {
        let mut p = payment("100.00");
        p.status = PaymentStatus::Success;
        p.refund_status = RefundStatus::Failed;
        assert!(!p.is_refundable());
    }

    #[test]
    fn test_refund_status_derivation() {
        assert_eq!(refund_status_for(dec("100"), Decimal::ZERO), RefundStatus::None);
        assert_eq!(refund_status_for(dec("100"), dec("40")), RefundStatus::Partial);
        assert_eq!(refund_status_for(dec("100"), dec("100")), RefundStatus::Full);
    }

    #[test]
    fn test_regenerated_credentials_replace_both() {
        let mut tenant = Tenant::new("orders", "Orders Service");
        let old_key = tenant.api_key.clone();
        let old_secret = tenant.api_secret.clone();
        let (new_key, new_secret) = tenant.regenerate_credentials();
        assert_ne!(new_key, old_key);
        assert_ne!(new_secret, old_secret);
        assert_eq!(tenant.api_key, new_key);
        assert_eq!(tenant.api_secret, new_secret);
    }
}
