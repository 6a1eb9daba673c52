//! HMAC-SHA256 signing of hub webhook deliveries.
//!
//! The hub signs the exact request body with the webhook's shared secret and
//! sends it as `X-SCP-Signature: sha256=<hex>`.

use alloy_primitives::hex;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-scp-signature";
/// Header carrying the event name.
pub const EVENT_HEADER: &str = "x-scp-event";
/// Header carrying the 1-based delivery attempt.
pub const ATTEMPT_HEADER: &str = "x-scp-delivery-attempt";

const PREFIX: &str = "sha256=";

/// Signs `body`, returning the full header value `sha256=<hex>`.
#[must_use]
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    #[allow(clippy::expect_used)]
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a `sha256=<hex>` header value in constant time.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(sig_hex) = header.trim().strip_prefix(PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let body = br#"{"event":"payment.received","seq":1}"#;
        let header = sign_payload("s3cret", body);
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), 7 + 64);
        assert!(verify_signature("s3cret", body, &header));
        assert!(!verify_signature("other", body, &header));
        assert!(!verify_signature("s3cret", b"tampered", &header));
        assert!(!verify_signature("s3cret", body, header.trim_start_matches("sha256=")));
    }
}
