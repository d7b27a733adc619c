//! Value types shared across the gateway.
//!
//! These are the small, validated vocabulary types that appear on every
//! boundary: currencies, payment and refund statuses, outbound event names,
//! and the gateway-assigned payment reference. Parsing is strict at the
//! edges so the core never sees a malformed value.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Currencies the gateway accepts for collection.
///
/// The upstream processor supports more; this is the set the operator has
/// enabled settlement for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    KES,
    USD,
    NGN,
}

impl Currency {
    /// All supported currencies, in display order.
    pub fn variants() -> &'static [Currency] {
        &[Currency::KES, Currency::USD, Currency::NGN]
    }

    /// Comma-separated list of supported codes, used in validation messages.
    pub fn supported_list() -> String {
        Currency::variants()
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Currency::KES => "KES",
            Currency::USD => "USD",
            Currency::NGN => "NGN",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub struct UnsupportedCurrency(pub String);

impl Display for UnsupportedCurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unsupported currency: {}", self.0)
    }
}

impl std::error::Error for UnsupportedCurrency {}

impl FromStr for Currency {
    type Err = UnsupportedCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KES" => Ok(Currency::KES),
            "USD" => Ok(Currency::USD),
            "NGN" => Ok(Currency::NGN),
            other => Err(UnsupportedCurrency(other.to_string())),
        }
    }
}

/// Lifecycle status of a payment.
///
/// `Pending` is the only non-terminal state. `Success` is one-way terminal:
/// only refund fields may change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Abandoned,
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PaymentStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "abandoned" => Ok(PaymentStatus::Abandoned),
            _ => Err(()),
        }
    }
}

/// Refund progression of a payment, derived from `refunded_amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    None,
    Pending,
    Partial,
    Full,
    Failed,
}

impl Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefundStatus::None => "none",
            RefundStatus::Pending => "pending",
            RefundStatus::Partial => "partial",
            RefundStatus::Full => "full",
            RefundStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Events the gateway notifies tenants about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "payment.success")]
    PaymentSuccess,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::PaymentSuccess => "payment.success",
            WebhookEvent::PaymentRefunded => "payment.refunded",
        }
    }
}

impl Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Gateway-assigned payment reference: `acoruss-` followed by 12 lowercase
/// hex characters, 20 characters total. Globally unique across all payments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PaymentReference(String);

static REFERENCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^acoruss-[0-9a-f]{12}$").expect("Invalid payment reference regex"));

#[derive(Debug)]
pub struct InvalidReference(pub String);

impl Display for InvalidReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid payment reference format: {}", self.0)
    }
}

impl std::error::Error for InvalidReference {}

impl PaymentReference {
    pub fn parse(s: &str) -> Result<Self, InvalidReference> {
        if REFERENCE_REGEX.is_match(s) {
            Ok(PaymentReference(s.to_string()))
        } else {
            Err(InvalidReference(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for PaymentReference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PaymentReference::parse(&s).map_err(serde::de::Error::custom)
    }
}
