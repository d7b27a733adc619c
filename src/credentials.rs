//! Reference and credential mint.
//!
//! Everything here draws from the process CSPRNG. Uniqueness is ultimately
//! enforced by the repository's unique constraints; callers that insert a
//! minted value must retry generation on a conflict.

use rand::RngCore;

use crate::types::PaymentReference;

/// Hex-encode `n` random bytes from the CSPRNG.
fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Mint a payment reference: `acoruss-` + 12 hex chars, 20 total.
pub fn mint_reference() -> PaymentReference {
    let raw = format!("acoruss-{}", random_hex(6));
    PaymentReference::parse(&raw).expect("minted reference matches its own format")
}

/// Mint a tenant API key: `ak_` + 48 hex chars, 51 total.
pub fn mint_api_key() -> String {
    format!("ak_{}", random_hex(24))
}

/// Mint a tenant API secret: `sk_` + 64 hex chars, 67 total.
///
/// The secret only ever signs outbound webhooks; it is never accepted from
/// callers.
pub fn mint_api_secret() -> String {
    format!("sk_{}", random_hex(32))
}
