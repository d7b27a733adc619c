//! HMAC signing and verification for both webhook directions.
//!
//! Inbound: the upstream processor signs its notifications with
//! HMAC-SHA512 over the exact raw request bytes, hex encoded in the
//! `X-Paystack-Signature` header. Outbound: the gateway signs tenant
//! notifications with HMAC-SHA256 under the tenant's API secret.
//!
//! Comparison goes through `Mac::verify_slice`, which is constant time.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Sign an outbound webhook payload: hex HMAC-SHA256 under the tenant secret.
pub fn sign_sha256_hex(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an inbound processor signature: hex HMAC-SHA512 under the shared
/// upstream secret. A malformed hex signature simply fails verification.
pub fn verify_sha512_hex(payload: &[u8], secret: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}
